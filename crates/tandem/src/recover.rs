//! The recovery store contract.
//!
//! The manager persists three things through this trait: the `head` and
//! `tail` counters bounding in-flight work, and a persistent-subset snapshot
//! of every Context that has been dequeued but not yet resolved. A restarted
//! manager reads them back and replays according to its configured
//! [`crate::manager::RecoveryPolicy`].
//!
//! Store I/O failures surface to the caller of the operation in progress and
//! are never retried internally.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

#[async_trait]
pub trait RecoveryStore: Send + Sync {
    async fn put_counter(&self, name: &str, value: u64) -> Result<()>;
    async fn get_counter(&self, name: &str) -> Result<Option<u64>>;

    async fn put_snapshot(&self, id: u64, snapshot: Value) -> Result<()>;
    async fn get_snapshot(&self, id: u64) -> Result<Option<Value>>;
    async fn delete_snapshot(&self, id: u64) -> Result<()>;

    /// Ids of every stored snapshot, ascending.
    async fn snapshot_ids(&self) -> Result<Vec<u64>>;
}

/// In-process store for tests, demos and managers that can afford to lose
/// progress on restart.
#[derive(Default)]
pub struct MemoryRecoveryStore {
    counters: Mutex<BTreeMap<String, u64>>,
    snapshots: Mutex<BTreeMap<u64, Value>>,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryStore for MemoryRecoveryStore {
    async fn put_counter(&self, name: &str, value: u64) -> Result<()> {
        self.counters.lock().await.insert(name.to_string(), value);
        Ok(())
    }

    async fn get_counter(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.counters.lock().await.get(name).copied())
    }

    async fn put_snapshot(&self, id: u64, snapshot: Value) -> Result<()> {
        self.snapshots.lock().await.insert(id, snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, id: u64) -> Result<Option<Value>> {
        Ok(self.snapshots.lock().await.get(&id).cloned())
    }

    async fn delete_snapshot(&self, id: u64) -> Result<()> {
        self.snapshots.lock().await.remove(&id);
        Ok(())
    }

    async fn snapshot_ids(&self) -> Result<Vec<u64>> {
        Ok(self.snapshots.lock().await.keys().copied().collect())
    }
}
