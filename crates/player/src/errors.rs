use flv_demux::DemuxError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    #[error("Request failed: {err}")]
    Request { err: String },
    #[error("Invalid response status: {status}")]
    Status { status: u16 },
    #[error("Timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("Connection refused for {url}")]
    Unavailable { url: String },
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return NetworkError::Timeout { secs: 0 };
        }
        if let Some(status) = err.status() {
            return NetworkError::Status {
                status: status.as_u16(),
            };
        }
        NetworkError::Request {
            err: err.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Empty range")]
    EmptyRange,
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Buffer quota exceeded")]
    QuotaExceeded,
    #[error("Sink is closed")]
    Closed,
    #[error("Append rejected: {reason}")]
    Rejected { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayerError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("Malformed stream: {0}")]
    Malformed(#[from] DemuxError),
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Playback stalled: {err}")]
    Stalled { err: NetworkError },
    #[error("No resolver for url: {url}")]
    NoResolver { url: String },
    #[error("No sources to play")]
    NoSources,
    #[error("API error: {error}")]
    ApiError { error: String },
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Invalid response json: {resp}")]
    InvalidResponseJson { resp: serde_json::Value },
    #[error("Invalid config: {err}")]
    InvalidConfig { err: String },
    #[error("Session stopped")]
    Stopped,
}

impl From<FetchError> for PlayerError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::EmptyRange => PlayerError::Malformed(DemuxError::EmptyRange),
            FetchError::Network(err) => PlayerError::Network(err),
        }
    }
}

impl From<reqwest::Error> for PlayerError {
    fn from(err: reqwest::Error) -> Self {
        PlayerError::Network(err.into())
    }
}

impl PlayerError {
    /// Network failures may be retried, everything else ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PlayerError::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(!PlayerError::Network(NetworkError::Timeout { secs: 20 }).is_fatal());
        assert!(PlayerError::Stalled {
            err: NetworkError::Timeout { secs: 20 }
        }
        .is_fatal());
        assert!(PlayerError::Malformed(DemuxError::InvalidTag {
            offset: 13,
            tag_type: 1
        })
        .is_fatal());
    }

    #[test]
    fn fetch_errors_keep_their_kind() {
        let err: PlayerError = FetchError::Network(NetworkError::Status { status: 503 }).into();
        assert_eq!(err, PlayerError::Network(NetworkError::Status { status: 503 }));
    }
}
