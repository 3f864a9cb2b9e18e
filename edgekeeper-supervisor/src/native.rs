//! Native process engine
//!
//! Runs each workload instance as a child process of the agent. Every
//! instance owns a slot that tracks the current process generation; a reaper
//! task per generation records its exit. Waiters only see exits of the
//! current generation that were not caused by a restart.

use edgekeeper_core::config::EngineConfig;
use edgekeeper_core::engine::InstanceEngine;
use edgekeeper_core::error::{EdgeKeeperError, Result};
use edgekeeper_core::instance::{ExitStatus, InstanceHandle};
use edgekeeper_core::workload::Workload;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
struct ProcessState {
    generation: u64,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
    /// Set while the process is being stopped on purpose
    replacing: bool,
}

struct InstanceSlot {
    workload: Workload,
    ops: Mutex<()>,
    state: watch::Sender<ProcessState>,
}

impl InstanceSlot {
    fn new(workload: Workload) -> Self {
        let (state, _) = watch::channel(ProcessState::default());
        Self {
            workload,
            ops: Mutex::new(()),
            state,
        }
    }

    fn is_alive(&self) -> bool {
        let state = self.state.borrow();
        state.pid.is_some() && state.exit.is_none()
    }
}

/// [`InstanceEngine`] backed by local child processes.
///
/// Children inherit the agent's stdio. On Linux they receive SIGTERM when the
/// agent dies. Stopping sends SIGTERM, then SIGKILL once the grace period
/// runs out.
pub struct NativeEngine {
    config: EngineConfig,
    instances: RwLock<HashMap<InstanceHandle, Arc<InstanceSlot>>>,
}

impl NativeEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.config.grace_period
    }

    async fn slot(&self, handle: &InstanceHandle) -> Option<Arc<InstanceSlot>> {
        self.instances.read().await.get(handle).cloned()
    }

    fn command(&self, workload: &Workload) -> Command {
        let mut cmd = Command::new(&workload.command);
        cmd.args(&workload.args).envs(&workload.env);
        if let Some(dir) = workload.working_dir.as_ref().or(self.config.working_dir.as_ref()) {
            cmd.current_dir(dir);
        }
        die_with_parent(&mut cmd);
        cmd
    }

    /// Spawn a new generation into `slot`, retrying once
    fn spawn(&self, slot: &Arc<InstanceSlot>) -> Result<Option<u32>> {
        let workload = &slot.workload;
        let mut child = match self.command(workload).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(workload = %workload.name, error = %e, "Failed to spawn process, retrying once");
                self.command(workload).spawn().map_err(|e| {
                    EdgeKeeperError::Engine(format!("failed to spawn '{}': {}", workload.command, e))
                })?
            }
        };

        let pid = child.id();
        let mut generation = 0;
        slot.state.send_modify(|state| {
            state.generation += 1;
            state.pid = pid;
            state.exit = None;
            state.replacing = false;
            generation = state.generation;
        });

        let reaper = Arc::clone(slot);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    warn!(workload = %reaper.workload.name, error = %e, "Failed to wait on process");
                    ExitStatus::default()
                }
            };
            debug!(workload = %reaper.workload.name, generation, %exit, "Process exited");
            reaper.state.send_modify(|state| {
                if state.generation == generation {
                    state.exit = Some(exit);
                }
            });
        });

        Ok(pid)
    }

    /// Stop the slot's current process, escalating to SIGKILL after the grace period
    async fn terminate(&self, slot: &InstanceSlot) -> Result<()> {
        let (generation, pid) = {
            let state = slot.state.borrow();
            if state.exit.is_some() {
                return Ok(());
            }
            match state.pid {
                Some(pid) => (state.generation, pid),
                None => return Ok(()),
            }
        };

        let gone = |state: &ProcessState| state.generation != generation || state.exit.is_some();
        let mut rx = slot.state.subscribe();

        send_signal(pid, Signal::SIGTERM)?;
        if tokio::time::timeout(self.config.grace_period, rx.wait_for(gone))
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(
            workload = %slot.workload.name,
            pid,
            grace_period = ?self.config.grace_period,
            "Process ignored SIGTERM, killing"
        );
        send_signal(pid, Signal::SIGKILL)?;
        if tokio::time::timeout(self.config.grace_period, rx.wait_for(gone))
            .await
            .is_err()
        {
            return Err(EdgeKeeperError::Engine(format!(
                "process {} did not exit after SIGKILL",
                pid
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl InstanceEngine for NativeEngine {
    async fn start_instance(&self, workload: &Workload) -> Result<InstanceHandle> {
        let handle = workload.instance_handle();

        let slot = {
            let mut instances = self.instances.write().await;
            if instances.get(&handle).is_some_and(|slot| slot.is_alive()) {
                debug!(instance = %handle, "Instance already running");
                return Ok(handle);
            }
            let slot = Arc::new(InstanceSlot::new(workload.clone()));
            instances.insert(handle.clone(), Arc::clone(&slot));
            slot
        };

        let _guard = slot.ops.lock().await;
        match self.spawn(&slot) {
            Ok(pid) => {
                info!(instance = %handle, pid = ?pid, "Started instance");
                Ok(handle)
            }
            Err(e) => {
                self.instances.write().await.remove(&handle);
                Err(e)
            }
        }
    }

    async fn stop_instance(&self, handle: &InstanceHandle) -> Result<()> {
        let Some(slot) = self.slot(handle).await else {
            return Ok(());
        };

        let _guard = slot.ops.lock().await;
        slot.state.send_modify(|state| state.replacing = true);
        if let Err(e) = self.terminate(&slot).await {
            slot.state.send_modify(|state| state.replacing = false);
            return Err(e);
        }
        self.instances.write().await.remove(handle);
        info!(instance = %handle, "Stopped instance");
        Ok(())
    }

    async fn restart_instance(&self, handle: &InstanceHandle) -> Result<()> {
        let slot = self
            .slot(handle)
            .await
            .ok_or_else(|| EdgeKeeperError::InstanceNotFound(handle.key()))?;

        let _guard = slot.ops.lock().await;
        slot.state.send_modify(|state| state.replacing = true);

        let respawned = match self.terminate(&slot).await {
            Ok(()) => self.spawn(&slot),
            Err(e) => Err(e),
        };
        match respawned {
            Ok(pid) => {
                info!(instance = %handle, pid = ?pid, "Restarted instance");
                Ok(())
            }
            Err(e) => {
                slot.state.send_modify(|state| state.replacing = false);
                Err(e)
            }
        }
    }

    async fn wait_instance(&self, handle: &InstanceHandle) -> Result<ExitStatus> {
        let mut rx = self
            .slot(handle)
            .await
            .ok_or_else(|| EdgeKeeperError::InstanceNotFound(handle.key()))?
            .state
            .subscribe();

        let exit = rx
            .wait_for(|state| state.exit.is_some() && !state.replacing)
            .await
            .map_err(|_| EdgeKeeperError::InstanceNotFound(handle.key()))?
            .exit
            .unwrap_or_default();
        Ok(exit)
    }

    async fn instance_pid(&self, handle: &InstanceHandle) -> Option<u32> {
        let slot = self.slot(handle).await?;
        let state = slot.state.borrow();
        if state.exit.is_some() { None } else { state.pid }
    }
}

#[cfg(target_os = "linux")]
fn die_with_parent(cmd: &mut Command) {
    // SAFETY: the closure runs between fork and exec and only issues prctl(2).
    unsafe {
        cmd.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(Signal::SIGTERM)?;
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_cmd: &mut Command) {}

fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| EdgeKeeperError::Engine(format!("pid {} out of range", pid)))?;
    match signal::kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(EdgeKeeperError::Engine(format!(
            "failed to send {:?} to {}: {}",
            signal, pid, e
        ))),
    }
}
