//! Probe worker registry
//!
//! Holds at most one live worker per [`WorkerKey`], removes workers whose
//! workload stops being desired after a few consecutive reconciliation cycles,
//! and hands workers the collaborators they probe and restart through.

use super::runner::{ProbeRunner, Prober};
use super::worker::{JitterSource, ProbeWorker, RandomJitter, WorkerKey, WorkerSnapshot};
use crate::error::ProbeError;
use edgekeeper_core::engine::InstanceEngine;
use edgekeeper_core::store::{StatusStore, WorkloadStore};
use edgekeeper_core::workload::{ProbeKind, Workload, WorkloadRef};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Consecutive reconciliation cycles a workload may be missing before its workers are stopped
pub const MAX_MISSED_CYCLES: u32 = 3;

struct WorkerEntry {
    id: Uuid,
    cancel: CancellationToken,
    snapshot: watch::Receiver<WorkerSnapshot>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    workers: HashMap<WorkerKey, WorkerEntry>,
    missed: HashMap<WorkerKey, u32>,
    closed: bool,
}

struct ManagerInner {
    registry: RwLock<Registry>,
    started: Instant,
    engine: Arc<dyn InstanceEngine>,
    status: Arc<dyn StatusStore>,
    workloads: Arc<dyn WorkloadStore>,
    prober: Arc<dyn Prober>,
    jitter: Arc<dyn JitterSource>,
}

/// Creates, looks up and retires probe workers.
///
/// Cloning is cheap; all clones share one registry.
#[derive(Clone)]
pub struct ProbeManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ProbeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeManager")
            .field("started", &self.inner.started)
            .finish_non_exhaustive()
    }
}

impl ProbeManager {
    /// Create a manager with explicit collaborators
    pub fn new(
        engine: Arc<dyn InstanceEngine>,
        status: Arc<dyn StatusStore>,
        workloads: Arc<dyn WorkloadStore>,
        prober: Arc<dyn Prober>,
        jitter: Arc<dyn JitterSource>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: RwLock::new(Registry::default()),
                started: Instant::now(),
                engine,
                status,
                workloads,
                prober,
                jitter,
            }),
        }
    }

    /// Create a manager probing with [`ProbeRunner`] and random start jitter
    pub fn with_defaults(
        engine: Arc<dyn InstanceEngine>,
        status: Arc<dyn StatusStore>,
        workloads: Arc<dyn WorkloadStore>,
    ) -> Result<Self, ProbeError> {
        Ok(Self::new(
            engine,
            status,
            workloads,
            Arc::new(ProbeRunner::new()?),
            Arc::new(RandomJitter),
        ))
    }

    /// Register the first worker a workload needs.
    ///
    /// The startup worker comes first when declared, unless the instance is
    /// already marked ready. No-op when the workload has no probe or already
    /// has a live worker.
    pub async fn add_workload(&self, workload: &Workload) {
        let Some(mut kind) = workload.initial_probe_kind() else {
            return;
        };

        if kind == ProbeKind::Startup && self.instance_ready(workload).await {
            if workload.liveness_probe.is_none() {
                return;
            }
            kind = ProbeKind::Liveness;
        }

        let workload_ref = workload.workload_ref();
        {
            let registry = self.inner.registry.read().await;
            let has_live_worker = [ProbeKind::Startup, ProbeKind::Liveness]
                .into_iter()
                .filter_map(|kind| registry.workers.get(&WorkerKey::new(&workload_ref, kind)))
                .any(|entry| !entry.cancel.is_cancelled());
            if has_live_worker {
                return;
            }
        }

        self.add_worker(workload, kind).await;
    }

    /// Register a worker for one probe kind.
    ///
    /// Idempotent: a live worker under the same key is left alone. A worker
    /// that was asked to stop but hasn't unregistered yet is replaced.
    /// No-op once the manager has shut down.
    pub async fn add_worker(&self, workload: &Workload, kind: ProbeKind) {
        self.insert_worker(workload, kind, None).await;
    }

    /// Register the worker that takes over from `from`, unless `from` was
    /// stopped while it was still running its last probe.
    pub(crate) async fn hand_over(
        &self,
        workload: &Workload,
        kind: ProbeKind,
        from: &CancellationToken,
    ) {
        self.insert_worker(workload, kind, Some(from)).await;
    }

    async fn insert_worker(
        &self,
        workload: &Workload,
        kind: ProbeKind,
        from: Option<&CancellationToken>,
    ) {
        let Some(spec) = workload.probe(kind).cloned() else {
            return;
        };
        let key = WorkerKey::new(&workload.workload_ref(), kind);

        let mut registry = self.inner.registry.write().await;
        if registry.closed {
            debug!(worker = %key, "Manager shut down, not adding probe worker");
            return;
        }
        if from.is_some_and(CancellationToken::is_cancelled) {
            debug!(worker = %key, "Handing worker was stopped, not adding probe worker");
            return;
        }
        if let Some(existing) = registry.workers.get(&key) {
            if !existing.cancel.is_cancelled() {
                return;
            }
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (worker, snapshot) = ProbeWorker::new(
            id,
            key.clone(),
            workload.clone(),
            spec,
            self.clone(),
            cancel.clone(),
        );
        let join = spawn_worker(worker);

        registry.workers.insert(
            key.clone(),
            WorkerEntry {
                id,
                cancel,
                snapshot,
                join,
            },
        );
        registry.missed.insert(key.clone(), 0);
        debug!(worker = %key, "Added probe worker");
    }

    /// Ask a worker to stop. It unregisters itself once its loop notices.
    pub async fn remove_worker(&self, key: &WorkerKey) {
        let registry = self.inner.registry.read().await;
        if let Some(entry) = registry.workers.get(key) {
            entry.cancel.cancel();
        }
    }

    /// Ask every worker of a workload to stop
    pub async fn remove_workload(&self, workload: &WorkloadRef) {
        for kind in [ProbeKind::Startup, ProbeKind::Liveness] {
            self.remove_worker(&WorkerKey::new(workload, kind)).await;
        }
    }

    /// Debounced removal of workers whose workload is not desired.
    ///
    /// A worker missing from `desired` for [`MAX_MISSED_CYCLES`] consecutive
    /// calls is stopped; appearing again resets its counter.
    pub async fn reconcile_against_desired(&self, desired: &HashSet<WorkloadRef>) {
        let mut registry = self.inner.registry.write().await;
        let Registry { workers, missed, .. } = &mut *registry;

        for (key, entry) in workers.iter() {
            let counter = missed.entry(key.clone()).or_insert(0);
            if desired.contains(&key.workload_ref()) {
                *counter = 0;
                continue;
            }

            *counter += 1;
            if *counter >= MAX_MISSED_CYCLES {
                debug!(worker = %key, missed = *counter, "Workload no longer desired, stopping probe worker");
                entry.cancel.cancel();
            }
        }
    }

    /// Ensure workers for a workload known only by name and version.
    ///
    /// Returns false when the workload store has no declaration for it.
    pub async fn check_and_ensure(&self, workload: &WorkloadRef) -> bool {
        match self.inner.workloads.get(workload).await {
            Ok(Some(declared)) => {
                self.add_workload(&declared).await;
                true
            }
            Ok(None) => {
                warn!(workload = %workload, "No declaration for workload, not probing");
                false
            }
            Err(e) => {
                error!(workload = %workload, error = %e, "Failed to get workload");
                false
            }
        }
    }

    /// Whether a worker is registered under `key`
    pub async fn contains(&self, key: &WorkerKey) -> bool {
        self.inner.registry.read().await.workers.contains_key(key)
    }

    /// Registered worker keys, sorted
    pub async fn workers(&self) -> Vec<WorkerKey> {
        let registry = self.inner.registry.read().await;
        let mut keys: Vec<WorkerKey> = registry.workers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Latest snapshot of a registered worker
    pub async fn snapshot(&self, key: &WorkerKey) -> Option<WorkerSnapshot> {
        let registry = self.inner.registry.read().await;
        registry
            .workers
            .get(key)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    /// Missed reconciliation cycles recorded for a worker
    pub async fn missed_cycles(&self, key: &WorkerKey) -> Option<u32> {
        self.inner.registry.read().await.missed.get(key).copied()
    }

    /// Stop every worker and wait for all of them to exit.
    ///
    /// The manager accepts no new workers afterwards.
    pub async fn shutdown(&self) {
        let joins: Vec<JoinHandle<()>> = {
            let mut registry = self.inner.registry.write().await;
            registry.closed = true;
            registry.missed.clear();
            registry
                .workers
                .drain()
                .map(|(_, entry)| {
                    entry.cancel.cancel();
                    entry.join
                })
                .collect()
        };

        for join in joins {
            if let Err(e) = join.await {
                warn!(error = %e, "Probe worker task failed");
            }
        }
    }

    /// Called by a worker when its loop exits
    pub(crate) async fn unregister(&self, key: &WorkerKey, id: Uuid) {
        let mut registry = self.inner.registry.write().await;
        if registry.workers.get(key).is_some_and(|entry| entry.id == id) {
            registry.workers.remove(key);
            registry.missed.remove(key);
        }
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub(crate) fn jitter_fraction(&self) -> f64 {
        let fraction = self.inner.jitter.fraction();
        if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub(crate) fn engine(&self) -> &Arc<dyn InstanceEngine> {
        &self.inner.engine
    }

    pub(crate) fn status_store(&self) -> &Arc<dyn StatusStore> {
        &self.inner.status
    }

    pub(crate) fn prober(&self) -> &Arc<dyn Prober> {
        &self.inner.prober
    }

    async fn instance_ready(&self, workload: &Workload) -> bool {
        match self.inner.status.get(&workload.instance_handle().key()).await {
            Ok(Some(stats)) => stats.ready,
            _ => false,
        }
    }
}

// Kept out of the async call chain so the worker future's type doesn't depend on itself.
fn spawn_worker(worker: ProbeWorker) -> JoinHandle<()> {
    tokio::spawn(worker.run())
}
