//! Status and workload stores shared between supervisors, probe workers and the agent

use crate::error::Result;
use crate::instance::{InstanceStats, InstanceStatus};
use crate::workload::{Workload, WorkloadRef};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Partial update applied to a status record in place
pub type StatsUpdate = dyn for<'s> Fn(&'s mut InstanceStats) + Send + Sync;

/// Key/value store of instance status records
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Get the record for an instance
    async fn get(&self, key: &str) -> Result<Option<InstanceStats>>;

    /// Insert or replace a record
    async fn set(&self, key: &str, stats: InstanceStats) -> Result<()>;

    /// Remove a record
    async fn delete(&self, key: &str) -> Result<()>;

    /// All records
    async fn list(&self) -> Result<Vec<InstanceStats>>;

    /// Apply a partial update to an existing record.
    ///
    /// Returns false when no record exists.
    async fn update(&self, key: &str, update: &StatsUpdate) -> Result<bool> {
        match self.get(key).await? {
            Some(mut stats) => {
                update(&mut stats);
                self.set(key, stats).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Change only the status of an existing record
    async fn set_status(&self, key: &str, status: InstanceStatus) -> Result<bool> {
        self.update(key, &move |stats: &mut InstanceStats| stats.status = status)
            .await
    }
}

/// In-process status store
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    records: RwLock<HashMap<String, InstanceStats>>,
}

impl InMemoryStatusStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get(&self, key: &str) -> Result<Option<InstanceStats>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, stats: InstanceStats) -> Result<()> {
        self.records.write().await.insert(key.to_string(), stats);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceStats>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    // Single write lock, so concurrent partial updates never lose each other.
    async fn update(&self, key: &str, update: &StatsUpdate) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(key) {
            Some(stats) => {
                update(stats);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Full workload declarations, looked up when only a name/version is known
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Get a declaration
    async fn get(&self, workload: &WorkloadRef) -> Result<Option<Workload>>;

    /// Insert or replace a declaration
    async fn put(&self, workload: Workload) -> Result<()>;

    /// Remove a declaration
    async fn remove(&self, workload: &WorkloadRef) -> Result<()>;
}

/// In-process workload store
#[derive(Debug, Default)]
pub struct InMemoryWorkloadStore {
    workloads: RwLock<HashMap<WorkloadRef, Workload>>,
}

impl InMemoryWorkloadStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkloadStore for InMemoryWorkloadStore {
    async fn get(&self, workload: &WorkloadRef) -> Result<Option<Workload>> {
        Ok(self.workloads.read().await.get(workload).cloned())
    }

    async fn put(&self, workload: Workload) -> Result<()> {
        self.workloads
            .write()
            .await
            .insert(workload.workload_ref(), workload);
        Ok(())
    }

    async fn remove(&self, workload: &WorkloadRef) -> Result<()> {
        self.workloads.write().await.remove(workload);
        Ok(())
    }
}
