//! Running instances: handles, observed status and exit results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one running instance of a workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Owning workload name
    pub workload: String,
    /// Owning workload version
    pub version: String,
    /// Instance name, unique within the workload
    pub instance: String,
}

impl InstanceHandle {
    /// Create a new handle
    pub fn new(
        workload: impl Into<String>,
        version: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            workload: workload.into(),
            version: version.into(),
            instance: instance.into(),
        }
    }

    /// Key used by the status store
    pub fn key(&self) -> String {
        format!("{}/{}", self.workload, self.instance)
    }
}

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.workload, self.version, self.instance)
    }
}

/// Observed lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Being started for the first time
    Starting,
    /// Process is running
    Running,
    /// Waiting for backoff or being restarted
    Restarting,
    /// Exited permanently; will not be restarted without re-registration
    Terminated,
}

impl InstanceStatus {
    /// True once the instance has exited for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Terminated)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Restarting => write!(f, "restarting"),
            InstanceStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Status record published to the status store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    /// Instance this record describes
    pub handle: InstanceHandle,
    /// Current status
    pub status: InstanceStatus,
    /// Process id, when the engine exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the current process was started
    pub started_at: DateTime<Utc>,
    /// Number of restarts performed by the supervisor
    #[serde(default)]
    pub restarts: u32,
    /// Set once a startup or liveness probe crossed its success threshold
    #[serde(default)]
    pub ready: bool,
    /// Last exit observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitStatus>,
}

impl InstanceStats {
    /// Fresh record for an instance that just started
    pub fn running(handle: InstanceHandle, pid: Option<u32>) -> Self {
        Self {
            handle,
            status: InstanceStatus::Running,
            pid,
            started_at: Utc::now(),
            restarts: 0,
            ready: false,
            last_exit: None,
        }
    }
}

/// How an instance exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code, if the process exited normally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Normal exit with the given code
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Killed by a signal
    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Only a zero exit code counts as success
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}
