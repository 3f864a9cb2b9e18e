//! Health probing: executors, the retrying runner, per-workload workers and their registry

pub mod http;
pub mod manager;
pub mod result;
pub mod runner;
pub mod tcp;
pub mod worker;


pub use http::HttpProber;
pub use manager::{MAX_MISSED_CYCLES, ProbeManager};
pub use result::ProbeResult;
pub use runner::{LOCALHOST, MAX_PROBE_RETRIES, ProbeRunner, Prober};
pub use tcp::probe_tcp;
pub use worker::{FixedJitter, JitterSource, RandomJitter, WorkerKey, WorkerSnapshot};
