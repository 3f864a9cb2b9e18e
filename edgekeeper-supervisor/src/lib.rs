//! EdgeKeeper Supervisor - keeps locally deployed workloads running and healthy
//!
//! Two independent mechanisms act on each instance through the
//! [`InstanceEngine`](edgekeeper_core::engine::InstanceEngine) contract:
//!
//! - **Instance supervisors** wait for process exits and restart according to
//!   the workload's restart policy, with exponential backoff and a retry budget.
//! - **Probe workers** periodically run HTTP or TCP checks and restart an
//!   instance that keeps failing, independent of whether the process exited.
//!
//! [`WorkloadAgent`] ties both to a desired workload set, and [`NativeEngine`]
//! runs instances as local child processes.

mod backoff;
mod error;
mod instance;
mod lifecycle;
#[cfg(unix)]
mod native;
pub mod probe;

#[cfg(test)]
mod testing;

pub use backoff::Backoff;
pub use error::{ProbeError, Result, SupervisorError};
pub use instance::{InstanceSupervisor, SupervisionOutcome, SupervisorHandle};
pub use lifecycle::{ReconciliationReport, WorkloadAgent};
#[cfg(unix)]
pub use native::NativeEngine;
pub use probe::{ProbeManager, ProbeResult, ProbeRunner, Prober, WorkerKey, WorkerSnapshot};
