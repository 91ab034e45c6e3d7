//! Local entity repository boundary
//!
//! Entity CRUD lives outside the engine. The engine loads the current local
//! replica before detection and commits merged replicas back afterwards.

use crate::error::Result;
use crate::types::{EntityPayload, Replica, SnapshotKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Local view of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub entity_name: String,
    pub replica: Replica,
    /// Edits made since `replica.version` was last committed
    pub has_local_edits: bool,
}

/// Producer and sink of local entity state
#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn load(&self, key: &SnapshotKey) -> Result<Option<LocalEntity>>;

    /// Store a merged replica; pending local edits are considered committed
    async fn commit(&self, key: &SnapshotKey, replica: Replica) -> Result<()>;
}

/// In-memory entity repository
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    entities: Arc<DashMap<SnapshotKey, LocalEntity>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: SnapshotKey, entity: LocalEntity) {
        self.entities.insert(key, entity);
    }

    /// Apply a local edit, moving the replica past its committed version
    pub fn edit(&self, key: &SnapshotKey, payload: EntityPayload, at: DateTime<Utc>) -> bool {
        match self.entities.get_mut(key) {
            Some(mut entity) => {
                entity.replica.version = entity.replica.version.next();
                entity.replica.payload = payload;
                entity.replica.timestamp = at;
                entity.has_local_edits = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<LocalEntity> {
        self.entities.get(key).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl EntityRepository for MemoryRepository {
    async fn load(&self, key: &SnapshotKey) -> Result<Option<LocalEntity>> {
        Ok(self.get(key))
    }

    async fn commit(&self, key: &SnapshotKey, replica: Replica) -> Result<()> {
        let mut entry = self.entities.entry(key.clone()).or_insert_with(|| LocalEntity {
            entity_name: key.entity_id.clone(),
            replica: replica.clone(),
            has_local_edits: false,
        });
        entry.replica = replica;
        entry.has_local_edits = false;
        Ok(())
    }
}
