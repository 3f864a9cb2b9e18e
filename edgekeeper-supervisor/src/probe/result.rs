//! Probe verdicts

use serde::{Deserialize, Serialize};

/// Outcome of one health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeResult {
    /// Target is healthy
    Success,
    /// Healthy, but something is worth surfacing (e.g. a redirect)
    Warning,
    /// Target is unhealthy
    Failure,
    /// No verdict yet
    #[default]
    Unknown,
}

impl ProbeResult {
    /// Warning counts as a success for thresholding
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Success | ProbeResult::Warning)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ProbeResult::Failure)
    }
}

impl std::fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeResult::Success => write!(f, "success"),
            ProbeResult::Warning => write!(f, "warning"),
            ProbeResult::Failure => write!(f, "failure"),
            ProbeResult::Unknown => write!(f, "unknown"),
        }
    }
}
