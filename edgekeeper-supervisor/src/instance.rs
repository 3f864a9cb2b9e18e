//! Instance supervisor: keeps one instance alive under its restart policy

use crate::backoff::Backoff;
use crate::error::{Result, SupervisorError};
use edgekeeper_core::engine::InstanceEngine;
use edgekeeper_core::instance::{ExitStatus, InstanceHandle, InstanceStats, InstanceStatus};
use edgekeeper_core::store::StatusStore;
use edgekeeper_core::workload::{RestartMode, Workload, WorkloadRef};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a supervisor ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// Stopped on request; the instance was torn down
    Stopped,
    /// The instance exited and the policy did not restart it
    Exited(ExitStatus),
    /// The retry budget ran out
    RetriesExhausted {
        /// Restart attempts made
        attempts: u32,
        /// Exit that asked for the attempt over budget
        last_exit: ExitStatus,
    },
}

/// Handle to a running supervisor task
#[derive(Debug)]
pub struct SupervisorHandle {
    workload: WorkloadRef,
    instance: InstanceHandle,
    cancel: CancellationToken,
    join: JoinHandle<SupervisionOutcome>,
}

impl SupervisorHandle {
    /// Workload being supervised
    pub fn workload(&self) -> &WorkloadRef {
        &self.workload
    }

    /// Instance being supervised
    pub fn instance(&self) -> &InstanceHandle {
        &self.instance
    }

    /// Ask the supervisor to tear down its instance and exit. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// True once the supervisor task has ended
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the supervisor to end
    pub async fn join(self) -> Result<SupervisionOutcome> {
        self.join
            .await
            .map_err(|e| SupervisorError::Supervisor(format!("supervisor task failed: {}", e)))
    }

    /// Stop and wait
    pub async fn shutdown(self) -> Result<SupervisionOutcome> {
        self.stop();
        self.join().await
    }
}

/// Restart-policy state machine for a single instance
pub struct InstanceSupervisor {
    workload: Workload,
    handle: InstanceHandle,
    engine: Arc<dyn InstanceEngine>,
    status: Arc<dyn StatusStore>,
    cancel: CancellationToken,
    backoff: Backoff,
    retry_count: u32,
}

impl InstanceSupervisor {
    /// Start the workload's instance and supervise it in a background task.
    ///
    /// A failed start is retried once before giving up.
    pub async fn launch(
        workload: Workload,
        engine: Arc<dyn InstanceEngine>,
        status: Arc<dyn StatusStore>,
    ) -> Result<SupervisorHandle> {
        let handle = match engine.start_instance(&workload).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(workload = %workload.workload_ref(), error = %e, "Failed to start instance, retrying once");
                engine.start_instance(&workload).await?
            }
        };
        info!(instance = %handle, "Instance started");

        let cancel = CancellationToken::new();
        let supervisor = Self {
            backoff: Backoff::new(workload.restart.backoff),
            workload: workload.clone(),
            handle: handle.clone(),
            engine,
            status,
            cancel: cancel.clone(),
            retry_count: 0,
        };

        Ok(SupervisorHandle {
            workload: workload.workload_ref(),
            instance: handle,
            cancel,
            join: tokio::spawn(supervisor.run()),
        })
    }

    async fn run(mut self) -> SupervisionOutcome {
        let outcome = self.supervise().await;
        let key = self.handle.key();

        match &outcome {
            SupervisionOutcome::Stopped => {
                debug!(instance = %self.handle, "Stopping instance");
                if let Err(e) = self.engine.stop_instance(&self.handle).await {
                    error!(instance = %self.handle, error = %e, "Failed to stop instance");
                }
                if let Err(e) = self.status.delete(&key).await {
                    warn!(instance = %self.handle, error = %e, "Failed to delete instance status");
                }
            }
            SupervisionOutcome::Exited(exit)
            | SupervisionOutcome::RetriesExhausted {
                last_exit: exit, ..
            } => {
                let exit = *exit;
                let terminated = move |stats: &mut InstanceStats| {
                    stats.status = InstanceStatus::Terminated;
                    stats.last_exit = Some(exit);
                    stats.ready = false;
                };
                if let Err(e) = self.status.update(&key, &terminated).await {
                    warn!(instance = %self.handle, error = %e, "Failed to record termination");
                }
                info!(instance = %self.handle, %exit, "Instance terminated");
            }
        }

        outcome
    }

    async fn supervise(&mut self) -> SupervisionOutcome {
        let mut first = true;

        loop {
            self.publish_running(first).await;
            first = false;

            let exit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SupervisionOutcome::Stopped,
                exit = self.engine.wait_instance(&self.handle) => exit,
            };
            let exit = exit.unwrap_or_else(|e| {
                warn!(instance = %self.handle, error = %e, "Failed to wait for instance");
                ExitStatus::default()
            });

            let restart = match self.workload.restart.policy {
                RestartMode::Never => false,
                RestartMode::OnFailure => !exit.success(),
                RestartMode::Always => true,
            };
            if !restart {
                info!(instance = %self.handle, %exit, policy = %self.workload.restart.policy, "Instance exited, not restarting");
                return SupervisionOutcome::Exited(exit);
            }

            warn!(instance = %self.handle, %exit, "Instance exited, restarting");
            let restarting = move |stats: &mut InstanceStats| {
                stats.status = InstanceStatus::Restarting;
                stats.last_exit = Some(exit);
            };
            if let Err(e) = self.status.update(&self.handle.key(), &restarting).await {
                warn!(instance = %self.handle, error = %e, "Failed to record restart");
            }

            loop {
                self.retry_count += 1;
                let max = self.workload.restart.max_retries();
                if max > 0 && self.retry_count > max {
                    error!(instance = %self.handle, retries = max, "Retry budget exhausted");
                    return SupervisionOutcome::RetriesExhausted {
                        attempts: max,
                        last_exit: exit,
                    };
                }

                let delay = self.backoff.next();
                debug!(instance = %self.handle, delay = ?delay, attempt = self.retry_count, "Waiting before restart");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return SupervisionOutcome::Stopped,
                    _ = tokio::time::sleep(delay) => {}
                }

                match self.engine.restart_instance(&self.handle).await {
                    Ok(()) => break,
                    Err(e) => {
                        error!(instance = %self.handle, error = %e, "Failed to restart instance, trying again");
                    }
                }
            }
        }
    }

    async fn publish_running(&self, first: bool) {
        let key = self.handle.key();
        let pid = self.engine.instance_pid(&self.handle).await;

        let result = if first {
            self.status
                .set(&key, InstanceStats::running(self.handle.clone(), pid))
                .await
        } else {
            let running = move |stats: &mut InstanceStats| {
                stats.status = InstanceStatus::Running;
                stats.started_at = chrono::Utc::now();
                stats.pid = pid;
                stats.restarts += 1;
                stats.ready = false;
            };
            match self.status.update(&key, &running).await {
                Ok(true) => Ok(()),
                Ok(false) => {
                    let mut stats = InstanceStats::running(self.handle.clone(), pid);
                    stats.restarts = self.retry_count;
                    self.status.set(&key, stats).await
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = result {
            warn!(instance = %self.handle, error = %e, "Failed to publish instance status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;
    use edgekeeper_core::store::InMemoryStatusStore;
    use edgekeeper_core::workload::RestartPolicy;
    use std::time::Duration;
    use tokio::time::Instant;

    fn workload(policy: RestartPolicy) -> Workload {
        Workload::new("app", "/bin/app").with_restart(policy.with_backoff(
            Duration::from_secs(1),
            Duration::from_secs(300),
            2.0,
        ))
    }

    fn exit_code(code: i32) -> ExitStatus {
        ExitStatus::from_code(code)
    }

    async fn launch(
        workload: Workload,
        engine: &Arc<MockEngine>,
        status: &Arc<InMemoryStatusStore>,
    ) -> SupervisorHandle {
        InstanceSupervisor::launch(workload, engine.clone(), status.clone())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_restarts_until_budget_exhausted() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());
        for _ in 0..3 {
            engine.push_exit(Duration::ZERO, exit_code(1));
        }

        let started = Instant::now();
        let handle = launch(
            workload(RestartPolicy::always().with_max_retries(2)),
            &engine,
            &status,
        )
        .await;
        let outcome = handle.join().await.unwrap();

        assert_eq!(
            outcome,
            SupervisionOutcome::RetriesExhausted {
                attempts: 2,
                last_exit: exit_code(1)
            }
        );
        assert_eq!(engine.restarts(), 2);

        let times = engine.restart_times();
        assert_eq!(times[0] - started, Duration::from_secs(1));
        assert_eq!(times[1] - times[0], Duration::from_secs(2));

        let stats = status.get("app/app").await.unwrap().unwrap();
        assert_eq!(stats.status, InstanceStatus::Terminated);
        assert_eq!(stats.restarts, 2);
        assert_eq!(stats.last_exit, Some(exit_code(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_does_not_restart() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());
        engine.push_exit(Duration::from_secs(5), exit_code(1));

        let handle = launch(workload(RestartPolicy::never()), &engine, &status).await;
        let outcome = handle.join().await.unwrap();

        assert_eq!(outcome, SupervisionOutcome::Exited(exit_code(1)));
        assert_eq!(engine.restarts(), 0);
        let stats = status.get("app/app").await.unwrap().unwrap();
        assert_eq!(stats.status, InstanceStatus::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_failure_skips_clean_exit() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());
        engine.push_exit(Duration::from_secs(5), exit_code(0));

        let handle = launch(workload(RestartPolicy::on_failure()), &engine, &status).await;
        let outcome = handle.join().await.unwrap();

        assert_eq!(outcome, SupervisionOutcome::Exited(exit_code(0)));
        assert_eq!(engine.restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_failure_restarts_failed_exit() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());
        engine.push_exit(Duration::from_secs(5), ExitStatus::from_signal(9));

        let handle = launch(workload(RestartPolicy::on_failure()), &engine, &status).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(engine.restarts(), 1);
        let stats = status.get("app/app").await.unwrap().unwrap();
        assert_eq!(stats.status, InstanceStatus::Running);
        assert_eq!(stats.restarts, 1);
        assert!(!handle.is_finished());

        assert_eq!(handle.shutdown().await.unwrap(), SupervisionOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_restarts_clean_exit() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());
        engine.push_exit(Duration::from_secs(5), exit_code(0));

        let handle = launch(workload(RestartPolicy::always()), &engine, &status).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(engine.restarts(), 1);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tears_down_and_clears_status() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());

        let handle = launch(workload(RestartPolicy::always()), &engine, &status).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            status.get("app/app").await.unwrap().unwrap().status,
            InstanceStatus::Running
        );

        handle.stop();
        handle.stop();
        handle.stop();
        let outcome = handle.join().await.unwrap();

        assert_eq!(outcome, SupervisionOutcome::Stopped);
        assert_eq!(engine.stops(), 1);
        assert!(status.get("app/app").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_preempts_backoff() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());
        engine.push_exit(Duration::ZERO, exit_code(1));

        let policy = RestartPolicy::always().with_backoff(
            Duration::from_secs(600),
            Duration::from_secs(600),
            2.0,
        );
        let handle = launch(
            Workload::new("app", "/bin/app").with_restart(policy),
            &engine,
            &status,
        )
        .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            status.get("app/app").await.unwrap().unwrap().status,
            InstanceStatus::Restarting
        );

        let started = Instant::now();
        let outcome = handle.shutdown().await.unwrap();
        assert_eq!(outcome, SupervisionOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_is_retried() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());
        engine.push_exit(Duration::ZERO, exit_code(1));
        engine.fail_restarts(2);

        let handle = launch(workload(RestartPolicy::always()), &engine, &status).await;
        // Backoff 1s + 2s + 4s before the third attempt succeeds.
        tokio::time::sleep(Duration::from_secs(8)).await;

        assert_eq!(engine.restarts(), 3);
        assert_eq!(
            status.get("app/app").await.unwrap().unwrap().status,
            InstanceStatus::Running
        );
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restarts_count_against_budget() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());
        engine.push_exit(Duration::ZERO, exit_code(1));
        engine.fail_restarts(10);

        let handle = launch(
            workload(RestartPolicy::always().with_max_retries(3)),
            &engine,
            &status,
        )
        .await;
        let outcome = handle.join().await.unwrap();

        assert!(matches!(
            outcome,
            SupervisionOutcome::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(engine.restarts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_retries_start_once() {
        let engine = Arc::new(MockEngine::new());
        let status = Arc::new(InMemoryStatusStore::new());

        engine.fail_starts(1);
        let handle = launch(workload(RestartPolicy::always()), &engine, &status).await;
        assert_eq!(engine.starts(), 2);
        handle.stop();

        let engine = Arc::new(MockEngine::new());
        engine.fail_starts(2);
        let err = InstanceSupervisor::launch(
            workload(RestartPolicy::always()),
            engine.clone(),
            status.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SupervisorError::Engine(_)));
        assert_eq!(engine.starts(), 2);
    }
}
