pub mod buffered;
pub mod coordinator;
pub mod fetcher;
pub mod indexer;
