//! Engine contract: the only way the supervision core affects real processes

use crate::error::Result;
use crate::instance::{ExitStatus, InstanceHandle};
use crate::workload::Workload;
use async_trait::async_trait;

/// Starts, stops, restarts and waits on workload instances.
///
/// `restart_instance` is invoked both by probe workers and by instance
/// supervisors, possibly at the same time for the same instance. Implementations
/// must serialize or deduplicate such calls.
#[async_trait]
pub trait InstanceEngine: Send + Sync {
    /// Start the workload's instance and return its handle
    async fn start_instance(&self, workload: &Workload) -> Result<InstanceHandle>;

    /// Stop the instance and forget it. Stopping an unknown instance is a no-op.
    async fn stop_instance(&self, handle: &InstanceHandle) -> Result<()>;

    /// Replace the instance's process with a fresh one
    async fn restart_instance(&self, handle: &InstanceHandle) -> Result<()>;

    /// Resolve when the instance's current process exits.
    ///
    /// A process replaced by `restart_instance` does not count as an exit.
    async fn wait_instance(&self, handle: &InstanceHandle) -> Result<ExitStatus>;

    /// Current process id, if known
    async fn instance_pid(&self, _handle: &InstanceHandle) -> Option<u32> {
        None
    }
}
