//! Probe worker: the periodic probing loop for one workload and probe kind

use super::ProbeResult;
use super::manager::ProbeManager;
use chrono::{DateTime, Utc};
use edgekeeper_core::instance::{InstanceHandle, InstanceStats, InstanceStatus};
use edgekeeper_core::workload::{ProbeKind, ProbeSpec, Workload, WorkloadRef};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lower bound for the probe period
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Registry key of a probe worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerKey {
    /// Workload name
    pub name: String,
    /// Workload version
    pub version: String,
    /// Probe kind
    pub kind: ProbeKind,
}

impl WorkerKey {
    /// Create a new key
    pub fn new(workload: &WorkloadRef, kind: ProbeKind) -> Self {
        Self {
            name: workload.name.clone(),
            version: workload.version.clone(),
            kind,
        }
    }

    /// Workload this worker belongs to
    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::new(&self.name, &self.version)
    }
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.name, self.version, self.kind)
    }
}

/// Point-in-time view of a worker, published after every decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Last verdict
    pub last_result: ProbeResult,
    /// Consecutive verdicts of the same class as `last_result`
    pub consecutive_run_length: u32,
    /// Restart requests issued by this worker
    pub restarts: u32,
    /// Success threshold reached since the last restart request
    pub healthy: bool,
    /// When the worker was created
    pub started_at: DateTime<Utc>,
}

/// Source of the stagger fraction applied before the first probe
pub trait JitterSource: Send + Sync {
    /// A value in `[0, 1)`
    fn fraction(&self) -> f64;
}

/// Uniform random jitter
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn fraction(&self) -> f64 {
        use rand::Rng;
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// Constant jitter, for deterministic schedules
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn fraction(&self) -> f64 {
        self.0
    }
}

/// Run-length bookkeeping owned by one worker
#[derive(Debug, Clone)]
pub(crate) struct WorkerState {
    pub last_result: ProbeResult,
    pub run_length: u32,
    pub started_at: DateTime<Utc>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            last_result: ProbeResult::Unknown,
            run_length: 0,
            started_at: Utc::now(),
        }
    }

    /// Record a verdict. Warning and Success belong to the same run.
    pub(crate) fn observe(&mut self, result: ProbeResult) {
        if class(self.last_result).is_some() && class(self.last_result) == class(result) {
            self.run_length = self.run_length.saturating_add(1);
        } else {
            self.run_length = 1;
        }
        self.last_result = result;
    }
}

fn class(result: ProbeResult) -> Option<bool> {
    match result {
        ProbeResult::Success | ProbeResult::Warning => Some(true),
        ProbeResult::Failure => Some(false),
        ProbeResult::Unknown => None,
    }
}

enum Step {
    Continue,
    Stop,
}

/// One probing loop. Owned by its task; the manager only keeps the cancel token.
pub(crate) struct ProbeWorker {
    id: Uuid,
    key: WorkerKey,
    workload: Workload,
    spec: ProbeSpec,
    handle: InstanceHandle,
    manager: ProbeManager,
    cancel: CancellationToken,
    snapshot: watch::Sender<WorkerSnapshot>,
    state: WorkerState,
    restarts: u32,
    healthy: bool,
}

impl ProbeWorker {
    pub(crate) fn new(
        id: Uuid,
        key: WorkerKey,
        workload: Workload,
        spec: ProbeSpec,
        manager: ProbeManager,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<WorkerSnapshot>) {
        let state = WorkerState::new();
        let (snapshot, receiver) = watch::channel(WorkerSnapshot {
            last_result: state.last_result,
            consecutive_run_length: 0,
            restarts: 0,
            healthy: false,
            started_at: state.started_at,
        });
        let handle = workload.instance_handle();

        let worker = Self {
            id,
            key,
            workload,
            spec,
            handle,
            manager,
            cancel,
            snapshot,
            state,
            restarts: 0,
            healthy: false,
        };
        (worker, receiver)
    }

    pub(crate) async fn run(mut self) {
        let period = self.spec.period().max(MIN_PERIOD);
        debug!(worker = %self.key, period = ?period, "Probe worker started");

        // Stagger the first probe while the manager is younger than one period
        if self.manager.uptime() < period {
            let delay = period.mul_f64(self.manager.jitter_fraction());
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.finish().await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Step::Stop = self.probe_once().await {
                break;
            }
        }

        self.finish().await;
    }

    async fn probe_once(&mut self) -> Step {
        let key = self.handle.key();
        let stats = match self.manager.status_store().get(&key).await {
            Ok(Some(stats)) => stats,
            Ok(None) => {
                debug!(worker = %self.key, "No status for instance, skipping tick");
                return Step::Continue;
            }
            Err(e) => {
                warn!(worker = %self.key, error = %e, "Failed to read instance status");
                return Step::Continue;
            }
        };

        match stats.status {
            InstanceStatus::Terminated => {
                debug!(worker = %self.key, "Instance terminated, exiting probe worker");
                return Step::Stop;
            }
            InstanceStatus::Starting | InstanceStatus::Restarting => {
                debug!(worker = %self.key, status = %stats.status, "Instance not running, skipping tick");
                return Step::Continue;
            }
            InstanceStatus::Running => {}
        }

        let since_start = Utc::now()
            .signed_duration_since(stats.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if since_start < self.spec.initial_delay() {
            debug!(worker = %self.key, "Initial delay not elapsed, skipping tick");
            return Step::Continue;
        }

        let result = match self.manager.prober().probe(&self.key.name, &self.spec).await {
            Ok(result) => result,
            Err(e) => {
                debug!(worker = %self.key, error = %e, "Probe errored, discarding tick");
                return Step::Continue;
            }
        };

        self.state.observe(result);
        let step = if result.is_failure() && self.state.run_length >= self.spec.failure_threshold {
            self.restart_instance().await;
            Step::Continue
        } else if result.is_success() && self.state.run_length >= self.spec.success_threshold {
            self.mark_healthy().await
        } else {
            Step::Continue
        };

        self.publish();
        step
    }

    async fn restart_instance(&mut self) {
        warn!(
            worker = %self.key,
            instance = %self.handle,
            failures = self.state.run_length,
            "Probe failure threshold reached, restarting instance"
        );
        self.restarts += 1;

        let engine = self.manager.engine();
        match engine.restart_instance(&self.handle).await {
            Ok(()) => {
                let pid = engine.instance_pid(&self.handle).await;
                let update = move |stats: &mut InstanceStats| {
                    stats.started_at = Utc::now();
                    stats.pid = pid.or(stats.pid);
                    stats.restarts += 1;
                    stats.ready = false;
                };
                if let Err(e) = self
                    .manager
                    .status_store()
                    .update(&self.handle.key(), &update)
                    .await
                {
                    warn!(worker = %self.key, error = %e, "Failed to record restart");
                }
            }
            Err(e) => {
                error!(worker = %self.key, instance = %self.handle, error = %e, "Failed to restart instance");
            }
        }

        self.state.run_length = 0;
        self.healthy = false;
    }

    async fn mark_healthy(&mut self) -> Step {
        if !self.healthy {
            self.healthy = true;
            info!(worker = %self.key, "Probe success threshold reached");
            let ready = |stats: &mut InstanceStats| stats.ready = true;
            if let Err(e) = self
                .manager
                .status_store()
                .update(&self.handle.key(), &ready)
                .await
            {
                warn!(worker = %self.key, error = %e, "Failed to mark instance ready");
            }
        }

        if self.key.kind == ProbeKind::Startup {
            debug!(worker = %self.key, "Startup finished, handing over to liveness probing");
            if self.workload.liveness_probe.is_some() {
                self.manager
                    .hand_over(&self.workload, ProbeKind::Liveness, &self.cancel)
                    .await;
            }
            return Step::Stop;
        }

        Step::Continue
    }

    fn publish(&self) {
        self.snapshot.send_replace(WorkerSnapshot {
            last_result: self.state.last_result,
            consecutive_run_length: self.state.run_length,
            restarts: self.restarts,
            healthy: self.healthy,
            started_at: self.state.started_at,
        });
    }

    async fn finish(&self) {
        self.manager.unregister(&self.key, self.id).await;
        debug!(worker = %self.key, "Probe worker stopped");
    }
}
