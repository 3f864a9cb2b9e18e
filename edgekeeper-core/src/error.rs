//! Error types for edgekeeper operations

/// Result type for edgekeeper operations
pub type Result<T> = std::result::Result<T, EdgeKeeperError>;

/// Error types shared by the edgekeeper crates
#[derive(Debug, thiserror::Error)]
pub enum EdgeKeeperError {
    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The instance engine failed to start, stop or restart an instance
    #[error("Engine error: {0}")]
    Engine(String),

    /// No instance is known under the given key
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// No workload is known under the given name/version
    #[error("Workload not found: {0}")]
    WorkloadNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for EdgeKeeperError {
    fn from(s: String) -> Self {
        EdgeKeeperError::Other(s)
    }
}

impl From<&str> for EdgeKeeperError {
    fn from(s: &str) -> Self {
        EdgeKeeperError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for EdgeKeeperError {
    fn from(err: anyhow::Error) -> Self {
        EdgeKeeperError::Other(err.to_string())
    }
}
