//! # EdgeKeeper core
//!
//! Shared building blocks of the edgekeeper workload supervisor:
//! - Workload declarations with restart policies and health probes
//! - Instance handles, status records and exit results
//! - The `InstanceEngine` contract used to affect real processes
//! - Status and workload stores
//! - Configuration loading
//!
//! ## Quick Start
//!
//! ```rust
//! use edgekeeper_core::prelude::*;
//!
//! let workload = Workload::new("web", "/usr/bin/web")
//!     .with_restart(RestartPolicy::on_failure().with_max_retries(5))
//!     .with_liveness_probe(ProbeSpec::http(8080, "/healthz").with_thresholds(1, 3));
//!
//! assert_eq!(workload.instance_handle().key(), "web/web");
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod instance;
pub mod store;
pub mod workload;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{AgentConfig, EngineConfig, LoggingConfig, ReconcileConfig};
    pub use crate::engine::InstanceEngine;
    pub use crate::error::{EdgeKeeperError, Result};
    pub use crate::instance::{ExitStatus, InstanceHandle, InstanceStats, InstanceStatus};
    pub use crate::store::{InMemoryStatusStore, InMemoryWorkloadStore, StatusStore, WorkloadStore};
    pub use crate::workload::{
        BackoffConfig, HttpGetAction, HttpHeader, HttpScheme, ProbeAction, ProbeKind, ProbeSpec,
        RestartMode, RestartPolicy, RetryConfig, TcpSocketAction, Workload, WorkloadRef,
    };
}
