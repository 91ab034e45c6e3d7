//! Entity snapshot storage
//!
//! The store keeps the last known local/remote version, timestamp and
//! derived status of every entity. It never computes derived fields; callers
//! hand in fully computed snapshots. All read-detect-write sequences on one
//! key run under that key's lock from [`KeyLocks`].

use crate::error::Result;
use crate::settings::SyncFilters;
use crate::types::{EntitySnapshot, EntityType, SnapshotKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Selection of snapshots for a sync pass
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityFilter {
    /// Type/project/agent allow-lists
    #[serde(default)]
    pub allow: SyncFilters,
    /// Restrict to these entity ids
    #[serde(default)]
    pub entity_ids: Option<BTreeSet<String>>,
    /// Only entities with a local or remote write after this instant
    #[serde(default)]
    pub changed_after: Option<DateTime<Utc>>,
}

impl EntityFilter {
    /// Every known entity
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_types(types: impl IntoIterator<Item = EntityType>) -> Self {
        let mut filter = Self::default();
        filter.allow.entity_types = types.into_iter().collect();
        filter
    }

    pub fn for_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn with_changed_after(mut self, boundary: Option<DateTime<Utc>>) -> Self {
        self.changed_after = boundary;
        self
    }

    pub fn matches(&self, snapshot: &EntitySnapshot) -> bool {
        if !self.allow.matches(snapshot) {
            return false;
        }
        if let Some(ids) = &self.entity_ids {
            if !ids.contains(&snapshot.entity_id) {
                return false;
            }
        }
        match self.changed_after {
            Some(boundary) => {
                snapshot.local_timestamp > boundary
                    || snapshot.remote_timestamp.is_some_and(|ts| ts > boundary)
            }
            None => true,
        }
    }
}

/// Storage of entity snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Get the snapshot of one entity
    async fn get(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntitySnapshot>>;

    /// Insert or replace a snapshot by key
    async fn upsert(&self, snapshot: EntitySnapshot) -> Result<()>;

    /// Snapshots matching `filter`, ordered by `(entity_type, entity_id)`
    async fn list_by_filter(&self, filter: &EntityFilter) -> Result<Vec<EntitySnapshot>>;
}

/// Counters kept by the in-memory store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub snapshot_count: usize,
    pub upsert_count: u64,
}

/// In-memory snapshot store
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    data: Arc<RwLock<BTreeMap<SnapshotKey, EntitySnapshot>>>,
    stats: Arc<RwLock<StoreStats>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntitySnapshot>> {
        let key = SnapshotKey::new(entity_type, entity_id);
        Ok(self.data.read().get(&key).cloned())
    }

    async fn upsert(&self, snapshot: EntitySnapshot) -> Result<()> {
        let mut data = self.data.write();
        data.insert(snapshot.key(), snapshot);

        let mut stats = self.stats.write();
        stats.upsert_count += 1;
        stats.snapshot_count = data.len();
        Ok(())
    }

    async fn list_by_filter(&self, filter: &EntityFilter) -> Result<Vec<EntitySnapshot>> {
        let data = self.data.read();
        Ok(data
            .values()
            .filter(|snapshot| filter.matches(snapshot))
            .cloned()
            .collect())
    }
}

/// Per-key async locks serializing work on one snapshot
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<SnapshotKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &SnapshotKey) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}
