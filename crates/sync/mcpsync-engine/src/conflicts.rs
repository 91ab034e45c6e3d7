//! Audit log of conflicts
//!
//! Conflicts are never deleted. Each record keeps the replicas it was
//! detected from, so a manual decision taken later can still be applied.

use crate::error::{EngineError, Result};
use crate::types::{Conflict, ConflictField, ConflictType, Replica, Resolution, SnapshotKey};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// A conflict together with the replicas it was detected from
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub conflict: Conflict,
    pub local: Replica,
    pub remote: Replica,
    /// Server the remote replica came from
    pub server_id: String,
    pub(crate) sequence: u64,
}

#[derive(Debug, Default)]
struct LogState {
    records: HashMap<Uuid, ConflictRecord>,
    open_by_key: BTreeMap<SnapshotKey, Uuid>,
    next_sequence: u64,
}

/// Conflict records in creation order
#[derive(Debug, Clone, Default)]
pub struct ConflictLog {
    state: Arc<RwLock<LogState>>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a newly detected conflict.
    ///
    /// Fails if the entity already has an open conflict, which keeps at
    /// most one open conflict per entity.
    pub fn open(&self, conflict: Conflict, local: Replica, remote: Replica, server_id: String) -> Result<Uuid> {
        let mut state = self.state.write();
        let key = conflict.key();
        if let Some(existing) = state.open_by_key.get(&key) {
            return Err(EngineError::InvalidTransition(format!(
                "{} already has open conflict {}",
                key, existing
            )));
        }

        let id = conflict.id;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.open_by_key.insert(key, id);
        state.records.insert(
            id,
            ConflictRecord {
                conflict,
                local,
                remote,
                server_id,
                sequence,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<ConflictRecord> {
        self.state.read().records.get(&id).cloned()
    }

    /// Id of the open conflict of an entity, if any
    pub fn open_for(&self, key: &SnapshotKey) -> Option<Uuid> {
        self.state.read().open_by_key.get(key).copied()
    }

    pub fn has_open(&self, key: &SnapshotKey) -> bool {
        self.open_for(key).is_some()
    }

    /// Replace the replicas of an open conflict with what a later pass saw
    pub fn refresh(
        &self,
        id: Uuid,
        local: Replica,
        remote: Replica,
        conflict_type: ConflictType,
        fields: Vec<ConflictField>,
    ) -> Result<Conflict> {
        let mut state = self.state.write();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(EngineError::ConflictNotFound(id))?;

        if record.conflict.is_resolved() {
            return Err(EngineError::InvalidTransition(format!(
                "conflict {} is already resolved",
                id
            )));
        }

        record.local = local;
        record.remote = remote;
        record.conflict.conflict_type = conflict_type;
        record.conflict.conflict_fields = fields;
        Ok(record.conflict.clone())
    }

    /// Close a conflict exactly once
    pub fn close(&self, id: Uuid, resolution: Resolution, resolved_by: &str) -> Result<Conflict> {
        let mut state = self.state.write();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(EngineError::ConflictNotFound(id))?;

        if record.conflict.is_resolved() {
            return Err(EngineError::InvalidTransition(format!(
                "conflict {} is already resolved",
                id
            )));
        }

        record.conflict.resolved_at = Some(Utc::now());
        record.conflict.resolution = Some(resolution);
        record.conflict.resolved_by = Some(resolved_by.to_string());
        let closed = record.conflict.clone();
        state.open_by_key.remove(&closed.key());
        Ok(closed)
    }

    /// Conflicts in creation order; `Some(flag)` keeps only resolved/unresolved ones
    pub fn list(&self, resolved: Option<bool>) -> Vec<Conflict> {
        let state = self.state.read();
        let mut records: Vec<&ConflictRecord> = state
            .records
            .values()
            .filter(|r| resolved.map_or(true, |flag| r.conflict.is_resolved() == flag))
            .collect();
        records.sort_by_key(|r| r.sequence);
        records.into_iter().map(|r| r.conflict.clone()).collect()
    }
}
