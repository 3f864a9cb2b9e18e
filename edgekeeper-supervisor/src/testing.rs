//! In-crate test doubles for the engine and the prober

use crate::error::ProbeError;
use crate::probe::{ProbeResult, Prober};
use async_trait::async_trait;
use edgekeeper_core::engine::InstanceEngine;
use edgekeeper_core::error::{EdgeKeeperError, Result};
use edgekeeper_core::instance::{ExitStatus, InstanceHandle, InstanceStats};
use edgekeeper_core::store::StatusStore;
use edgekeeper_core::workload::{ProbeSpec, Workload};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Engine that records calls and replays scripted exits.
///
/// Each `wait_instance` call pops the next scripted exit; with none left it
/// never resolves.
#[derive(Default)]
pub(crate) struct MockEngine {
    starts: AtomicU32,
    restarts: AtomicU32,
    stops: AtomicU32,
    failing_restarts: AtomicU32,
    failing_starts: AtomicU32,
    exits: Mutex<VecDeque<(Duration, ExitStatus)>>,
    restart_times: Mutex<Vec<Instant>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script an exit that happens `after` the wait begins
    pub fn push_exit(&self, after: Duration, exit: ExitStatus) {
        self.exits.lock().unwrap().push_back((after, exit));
    }

    /// Make the next `n` restart calls fail
    pub fn fail_restarts(&self, n: u32) {
        self.failing_restarts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` start calls fail
    pub fn fail_starts(&self, n: u32) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn restart_times(&self) -> Vec<Instant> {
        self.restart_times.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl InstanceEngine for MockEngine {
    async fn start_instance(&self, workload: &Workload) -> Result<InstanceHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_starts) {
            return Err(EdgeKeeperError::Engine("scripted start failure".into()));
        }
        Ok(workload.instance_handle())
    }

    async fn stop_instance(&self, _handle: &InstanceHandle) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart_instance(&self, _handle: &InstanceHandle) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.restart_times.lock().unwrap().push(Instant::now());
        if Self::take_failure(&self.failing_restarts) {
            return Err(EdgeKeeperError::Engine("scripted restart failure".into()));
        }
        Ok(())
    }

    async fn wait_instance(&self, _handle: &InstanceHandle) -> Result<ExitStatus> {
        let next = self.exits.lock().unwrap().pop_front();
        match next {
            Some((after, exit)) => {
                tokio::time::sleep(after).await;
                Ok(exit)
            }
            None => std::future::pending().await,
        }
    }

    async fn instance_pid(&self, _handle: &InstanceHandle) -> Option<u32> {
        Some(4242)
    }
}

/// Prober that replays a verdict script, then repeats a fallback verdict.
///
/// `None` entries in the script are execution errors.
pub(crate) struct ScriptedProber {
    script: Mutex<VecDeque<Option<ProbeResult>>>,
    fallback: ProbeResult,
    calls: AtomicU32,
    latency: Duration,
}

impl ScriptedProber {
    pub fn new(script: impl IntoIterator<Item = Option<ProbeResult>>, fallback: ProbeResult) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Take `latency` to produce every verdict
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Always return `result`
    pub fn always(result: ProbeResult) -> Self {
        Self::new([], result)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, _workload: &str, _spec: &ProbeSpec) -> std::result::Result<ProbeResult, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Some(result)) => Ok(result),
            Some(None) => Err(ProbeError::Exhausted {
                attempts: 3,
                last: "scripted error".into(),
            }),
            None => Ok(self.fallback),
        }
    }
}

/// Publish a `Running` record for the workload's instance
pub(crate) async fn mark_running(store: &dyn StatusStore, workload: &Workload) {
    let handle = workload.instance_handle();
    store
        .set(&handle.key(), InstanceStats::running(handle, Some(4242)))
        .await
        .unwrap();
}
