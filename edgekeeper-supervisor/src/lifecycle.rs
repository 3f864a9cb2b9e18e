//! Workload agent that bridges the desired workload set with supervision and probing

use crate::error::Result;
use crate::instance::{InstanceSupervisor, SupervisorHandle};
use crate::probe::ProbeManager;
use edgekeeper_core::engine::InstanceEngine;
use edgekeeper_core::store::{InMemoryStatusStore, InMemoryWorkloadStore, StatusStore, WorkloadStore};
use edgekeeper_core::workload::{Workload, WorkloadRef};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Report of reconciliation actions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Workloads whose supervisor was launched
    pub started: Vec<String>,
    /// Workloads stopped because they are no longer desired
    pub stopped: Vec<String>,
    /// Workloads relaunched because their version changed
    pub replaced: Vec<String>,
    /// Workloads whose supervisor ended on its own
    pub terminated: Vec<String>,
    /// Workloads that could not be started
    pub failed: Vec<String>,
}

impl ReconciliationReport {
    /// True when the pass changed nothing
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.replaced.is_empty()
            && self.terminated.is_empty()
            && self.failed.is_empty()
    }
}

#[derive(Default)]
struct AgentState {
    /// Live supervisors by workload name
    supervisors: HashMap<String, SupervisorHandle>,
    /// Refs whose supervisor ended; not relaunched while they stay desired
    terminated: HashSet<WorkloadRef>,
}

/// Drives supervisors and probe workers towards a desired workload set
pub struct WorkloadAgent {
    engine: Arc<dyn InstanceEngine>,
    status: Arc<dyn StatusStore>,
    workloads: Arc<dyn WorkloadStore>,
    probes: ProbeManager,
    state: Mutex<AgentState>,
}

impl WorkloadAgent {
    /// Create a new agent
    pub fn new(
        engine: Arc<dyn InstanceEngine>,
        status: Arc<dyn StatusStore>,
        workloads: Arc<dyn WorkloadStore>,
        probes: ProbeManager,
    ) -> Self {
        Self {
            engine,
            status,
            workloads,
            probes,
            state: Mutex::new(AgentState::default()),
        }
    }

    /// Create an agent with in-memory stores and the default probe runner
    pub fn with_defaults(engine: Arc<dyn InstanceEngine>) -> Result<Self> {
        let status: Arc<dyn StatusStore> = Arc::new(InMemoryStatusStore::new());
        let workloads: Arc<dyn WorkloadStore> = Arc::new(InMemoryWorkloadStore::new());
        let probes = ProbeManager::with_defaults(engine.clone(), status.clone(), workloads.clone())?;
        Ok(Self::new(engine, status, workloads, probes))
    }

    /// Probe worker registry
    pub fn probes(&self) -> &ProbeManager {
        &self.probes
    }

    /// Instance status store
    pub fn status_store(&self) -> &Arc<dyn StatusStore> {
        &self.status
    }

    /// Reconcile supervisors and probe workers against `desired`
    pub async fn apply(&self, desired: Vec<Workload>) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport::default();
        let desired_refs: HashSet<WorkloadRef> = desired.iter().map(Workload::workload_ref).collect();
        let desired_names: HashSet<&str> = desired.iter().map(|w| w.name.as_str()).collect();

        debug!("Reconciling {} desired workloads", desired.len());

        for workload in &desired {
            self.workloads.put(workload.clone()).await?;
        }

        let mut state = self.state.lock().await;
        let AgentState {
            supervisors,
            terminated,
        } = &mut *state;

        // Reap supervisors that ended on their own
        let finished: Vec<String> = supervisors
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        for name in finished {
            let Some(handle) = supervisors.remove(&name) else {
                continue;
            };
            let workload_ref = handle.workload().clone();
            match handle.join().await {
                Ok(outcome) => info!(workload = %workload_ref, ?outcome, "Supervisor finished"),
                Err(e) => error!(workload = %workload_ref, error = %e, "Supervisor task failed"),
            }
            report.terminated.push(workload_ref.to_string());
            terminated.insert(workload_ref);
        }

        // Stop what is no longer desired
        let undesired: Vec<String> = supervisors
            .keys()
            .filter(|name| !desired_names.contains(name.as_str()))
            .cloned()
            .collect();
        for name in undesired {
            let Some(handle) = supervisors.remove(&name) else {
                continue;
            };
            let workload_ref = handle.workload().clone();
            if let Err(e) = handle.shutdown().await {
                warn!(workload = %workload_ref, error = %e, "Supervisor did not shut down cleanly");
            }
            if let Err(e) = self.workloads.remove(&workload_ref).await {
                warn!(workload = %workload_ref, error = %e, "Failed to forget workload");
            }
            report.stopped.push(workload_ref.to_string());
        }
        terminated.retain(|workload_ref| desired_refs.contains(workload_ref));

        for workload in &desired {
            let workload_ref = workload.workload_ref();

            let replacing = match supervisors.get(&workload.name) {
                Some(handle) if handle.workload() == &workload_ref => {
                    self.probes.add_workload(workload).await;
                    continue;
                }
                Some(_) => true,
                None => false,
            };

            if replacing {
                if let Some(old) = supervisors.remove(&workload.name) {
                    let old_ref = old.workload().clone();
                    debug!(from = %old_ref, to = %workload_ref, "Workload version changed");
                    // Old workers would otherwise probe the replacement instance
                    self.probes.remove_workload(&old_ref).await;
                    if let Err(e) = old.shutdown().await {
                        warn!(workload = %old_ref, error = %e, "Supervisor did not shut down cleanly");
                    }
                }
            } else if terminated.contains(&workload_ref) {
                continue;
            }

            match InstanceSupervisor::launch(workload.clone(), self.engine.clone(), self.status.clone()).await {
                Ok(handle) => {
                    supervisors.insert(workload.name.clone(), handle);
                    self.probes.add_workload(workload).await;
                    if replacing {
                        report.replaced.push(workload_ref.to_string());
                    } else {
                        report.started.push(workload_ref.to_string());
                    }
                }
                Err(e) => {
                    error!(workload = %workload_ref, error = %e, "Failed to launch workload");
                    report.failed.push(workload_ref.to_string());
                }
            }
        }
        drop(state);

        self.probes.reconcile_against_desired(&desired_refs).await;

        if !report.is_empty() {
            info!(
                "Reconciliation complete: started={:?}, stopped={:?}, replaced={:?}, terminated={:?}, failed={:?}",
                report.started, report.stopped, report.replaced, report.terminated, report.failed
            );
        }

        Ok(report)
    }

    /// Re-create probe workers for every supervised workload from the workload store
    pub async fn resync_probes(&self) {
        for workload_ref in self.supervised().await {
            self.probes.check_and_ensure(&workload_ref).await;
        }
    }

    /// Supervised workloads, sorted
    pub async fn supervised(&self) -> Vec<WorkloadRef> {
        let state = self.state.lock().await;
        let mut refs: Vec<WorkloadRef> = state
            .supervisors
            .values()
            .map(|handle| handle.workload().clone())
            .collect();
        refs.sort();
        refs
    }

    /// Stop every probe worker and supervisor and wait for them to finish
    pub async fn shutdown(&self) {
        self.probes.shutdown().await;

        let handles: Vec<SupervisorHandle> = {
            let mut state = self.state.lock().await;
            state.terminated.clear();
            state.supervisors.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            let workload_ref = handle.workload().clone();
            match handle.join().await {
                Ok(outcome) => debug!(workload = %workload_ref, ?outcome, "Supervisor stopped"),
                Err(e) => warn!(workload = %workload_ref, error = %e, "Supervisor task failed"),
            }
        }
        info!("Workload agent shut down");
    }
}

impl std::fmt::Debug for WorkloadAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadAgent")
            .field("probes", &self.probes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{FixedJitter, ProbeResult, WorkerKey};
    use crate::testing::{MockEngine, ScriptedProber};
    use edgekeeper_core::instance::{ExitStatus, InstanceStatus};
    use edgekeeper_core::workload::{ProbeKind, ProbeSpec, RestartPolicy};
    use std::time::Duration;

    struct Fixture {
        engine: Arc<MockEngine>,
        status: Arc<InMemoryStatusStore>,
        workloads: Arc<InMemoryWorkloadStore>,
        agent: WorkloadAgent,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());
        let workloads = Arc::new(InMemoryWorkloadStore::new());
        let probes = ProbeManager::new(
            engine.clone(),
            status.clone(),
            workloads.clone(),
            Arc::new(ScriptedProber::always(ProbeResult::Success)),
            Arc::new(FixedJitter(0.0)),
        );
        let agent = WorkloadAgent::new(engine.clone(), status.clone(), workloads.clone(), probes);
        Fixture {
            engine,
            status,
            workloads,
            agent,
        }
    }

    fn web(version: &str) -> Workload {
        Workload::new("web", "/bin/web").with_version(version)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_starts_new_workloads_once() {
        let f = fixture();

        let report = f.agent.apply(vec![web("1"), Workload::new("db", "/bin/db")]).await.unwrap();
        assert_eq!(report.started, vec!["web@1".to_string(), "db@1".to_string()]);
        assert_eq!(f.engine.starts(), 2);

        let report = f.agent.apply(vec![web("1"), Workload::new("db", "/bin/db")]).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(f.engine.starts(), 2);
        assert_eq!(
            f.agent.supervised().await,
            vec![WorkloadRef::new("db", "1"), WorkloadRef::new("web", "1")]
        );
        assert!(f.workloads.get(&WorkloadRef::new("web", "1")).await.unwrap().is_some());

        f.agent.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_change_replaces_supervisor() {
        let f = fixture();
        f.agent.apply(vec![web("1")]).await.unwrap();
        settle().await;

        let report = f.agent.apply(vec![web("2")]).await.unwrap();
        assert_eq!(report.replaced, vec!["web@2".to_string()]);
        assert!(report.started.is_empty());
        assert_eq!(f.engine.stops(), 1);
        assert_eq!(f.engine.starts(), 2);
        assert_eq!(f.agent.supervised().await, vec![WorkloadRef::new("web", "2")]);

        f.agent.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_undesired_workload_is_stopped() {
        let f = fixture();
        f.agent.apply(vec![web("1")]).await.unwrap();
        settle().await;
        assert!(f.status.get("web/web").await.unwrap().is_some());

        let report = f.agent.apply(vec![]).await.unwrap();
        assert_eq!(report.stopped, vec!["web@1".to_string()]);
        assert_eq!(f.engine.stops(), 1);
        assert!(f.status.get("web/web").await.unwrap().is_none());
        assert!(f.workloads.get(&WorkloadRef::new("web", "1")).await.unwrap().is_none());
        assert!(f.agent.supervised().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_workload_is_reaped_and_not_relaunched() {
        let f = fixture();
        f.engine.push_exit(Duration::ZERO, ExitStatus::from_code(1));
        let workload = web("1").with_restart(RestartPolicy::never());

        f.agent.apply(vec![workload.clone()]).await.unwrap();
        settle().await;

        let report = f.agent.apply(vec![workload.clone()]).await.unwrap();
        assert_eq!(report.terminated, vec!["web@1".to_string()]);
        assert!(report.started.is_empty());

        let stats = f.status.get("web/web").await.unwrap().unwrap();
        assert_eq!(stats.status, InstanceStatus::Terminated);

        let report = f.agent.apply(vec![workload]).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(f.engine.starts(), 1);

        // A new version runs again
        let report = f.agent.apply(vec![web("2").with_restart(RestartPolicy::never())]).await.unwrap();
        assert_eq!(report.started, vec!["web@2".to_string()]);
        f.agent.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_launch_is_reported_and_retried() {
        let f = fixture();
        f.engine.fail_starts(2);

        let report = f.agent.apply(vec![web("1")]).await.unwrap();
        assert_eq!(report.failed, vec!["web@1".to_string()]);
        assert!(f.agent.supervised().await.is_empty());

        let report = f.agent.apply(vec![web("1")]).await.unwrap();
        assert_eq!(report.started, vec!["web@1".to_string()]);
        assert_eq!(f.engine.starts(), 3);
        f.agent.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_workers_follow_desired_set() {
        let f = fixture();
        let workload = web("1").with_liveness_probe(ProbeSpec::http(8080, "/healthz"));
        let key = WorkerKey::new(&workload.workload_ref(), ProbeKind::Liveness);

        f.agent.apply(vec![workload.clone()]).await.unwrap();
        assert!(f.agent.probes().contains(&key).await);

        f.agent.apply(vec![]).await.unwrap();
        f.agent.apply(vec![]).await.unwrap();
        assert!(f.agent.probes().contains(&key).await);
        assert_eq!(f.agent.probes().missed_cycles(&key).await, Some(2));

        f.agent.apply(vec![]).await.unwrap();
        settle().await;
        assert!(!f.agent.probes().contains(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_recreates_probe_workers() {
        let f = fixture();
        let workload = web("1").with_liveness_probe(ProbeSpec::tcp(5432));
        let key = WorkerKey::new(&workload.workload_ref(), ProbeKind::Liveness);

        f.agent.apply(vec![workload]).await.unwrap();
        f.agent.probes().remove_worker(&key).await;
        settle().await;
        assert!(!f.agent.probes().contains(&key).await);

        f.agent.resync_probes().await;
        assert!(f.agent.probes().contains(&key).await);
        f.agent.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let f = fixture();
        let workload = web("1").with_liveness_probe(ProbeSpec::tcp(5432));
        f.agent.apply(vec![workload, Workload::new("db", "/bin/db")]).await.unwrap();
        settle().await;

        f.agent.shutdown().await;
        assert_eq!(f.engine.stops(), 2);
        assert!(f.agent.supervised().await.is_empty());
        assert!(f.agent.probes().workers().await.is_empty());
        assert!(f.status.list().await.unwrap().is_empty());
    }
}
