use thiserror::Error;

#[derive(Debug, Error)]
pub enum TileMeshError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Rendezvous failed: {0}")]
    RendezvousFailed(String),

    #[error("Tracker unreachable: {0}")]
    TrackerUnreachable(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Tile store error: {0}")]
    Store(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Url Error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Parse Int Error: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error("Task Error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

impl TileMeshError {
    /// Errors that only concern one peer or one tracker call. The caller skips
    /// to the next candidate instead of giving up.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_)
                | Self::ProtocolViolation(_)
                | Self::Unavailable(_)
                | Self::RendezvousFailed(_)
                | Self::TrackerUnreachable(_)
                | Self::InvalidMessage(_)
                | Self::ConnectionClosed
        )
    }
}

impl From<reqwest::Error> for TileMeshError {
    fn from(err: reqwest::Error) -> Self {
        Self::TrackerUnreachable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable() {
        assert!(TileMeshError::Unavailable("tile".into()).is_recoverable());
        assert!(TileMeshError::ConnectionClosed.is_recoverable());
        assert!(!TileMeshError::Store("disk full".into()).is_recoverable());
    }
}
