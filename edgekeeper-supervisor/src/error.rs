//! Error types for supervisor operations

use edgekeeper_core::error::EdgeKeeperError;
use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Engine(#[from] EdgeKeeperError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A probe attempt could not be performed at all.
///
/// These never describe the health of the target; an unhealthy target is a
/// `ProbeResult::Failure`.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("No port selected")]
    MissingPort,

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Failed to read probe response body: {0}")]
    Body(String),

    #[error("Probe failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}
