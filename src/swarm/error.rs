use thiserror::Error;

pub type Result<T> = std::result::Result<T, SwarmError>;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("tracker did not answer within the discovery deadline")]
    DiscoveryTimeout,

    #[error("no seeders available")]
    NoSeedersAvailable,

    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("chunk {chunk_id} truncated: expected {expected} bytes, received {received}")]
    PartialChunk {
        chunk_id: u64,
        expected: usize,
        received: usize,
    },

    #[error("storage error: {0}")]
    Storage(std::io::Error),

    #[error("all {0} seeders failed before any chunk was retrieved")]
    SeedersExhausted(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Errors a caller may recover from by retrying or moving on to another peer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwarmError::DiscoveryTimeout
                | SwarmError::ConnectionFailure(_)
                | SwarmError::PartialChunk { .. }
        )
    }

    pub(crate) fn connection(err: impl std::fmt::Display) -> Self {
        SwarmError::ConnectionFailure(err.to_string())
    }

    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        SwarmError::ProtocolViolation(reason.into())
    }
}
