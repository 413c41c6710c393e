pub mod user_agent_generator;
