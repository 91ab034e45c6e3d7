//! Point-in-time archives of snapshots and local replicas

use crate::error::{EngineError, Result};
use crate::repository::LocalEntity;
use crate::types::{EntitySnapshot, SnapshotKey};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// One archived entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub snapshot: EntitySnapshot,
    /// Local replica at capture time; `None` if the entity had no local side
    pub local: Option<LocalEntity>,
}

/// A set of entries captured together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArchive {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Job that produced the archive
    pub job_id: Option<Uuid>,
    pub entries: Vec<BackupEntry>,
}

impl BackupArchive {
    pub fn new(job_id: Option<Uuid>, mut entries: Vec<BackupEntry>) -> Self {
        entries.sort_by_key(|e| e.snapshot.key());
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            job_id,
            entries,
        }
    }

    pub fn entry(&self, key: &SnapshotKey) -> Option<&BackupEntry> {
        self.entries
            .binary_search_by(|e| e.snapshot.key().cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Summary returned by listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub job_id: Option<Uuid>,
    pub entities: usize,
}

/// In-memory archive storage, oldest first
#[derive(Debug, Clone, Default)]
pub struct BackupVault {
    archives: Arc<RwLock<Vec<Arc<BackupArchive>>>>,
}

impl BackupVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, archive: BackupArchive) -> Arc<BackupArchive> {
        let archive = Arc::new(archive);
        self.archives.write().push(archive.clone());
        archive
    }

    pub fn get(&self, id: Uuid) -> Result<Arc<BackupArchive>> {
        self.archives
            .read()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(EngineError::BackupNotFound(id))
    }

    pub fn latest(&self) -> Option<Arc<BackupArchive>> {
        self.archives.read().last().cloned()
    }

    pub fn list(&self) -> Vec<BackupInfo> {
        self.archives
            .read()
            .iter()
            .map(|a| BackupInfo {
                id: a.id,
                created_at: a.created_at,
                job_id: a.job_id,
                entities: a.len(),
            })
            .collect()
    }
}
