//! Field-level divergence detection between local and remote replicas
//!
//! Detection is a pure function of its inputs: no clock reads, no
//! randomness, and field order fixed by the importance table. Identical
//! inputs always produce identical classifications and field sequences.

use crate::schema::{FieldRole, ImportanceTable};
use crate::types::{ConflictField, ConflictType, DataType, EntityType, Replica, SyncStatus};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// Which side is ahead in a directional divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Divergence {
    LocalNewer,
    RemoteNewer,
}

impl From<Divergence> for SyncStatus {
    fn from(divergence: Divergence) -> Self {
        match divergence {
            Divergence::LocalNewer => SyncStatus::LocalNewer,
            Divergence::RemoteNewer => SyncStatus::RemoteNewer,
        }
    }
}

/// Outcome of comparing two replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Detection {
    /// Nothing to transfer; both sides should carry `version`
    Synced { version: Version },
    /// Only one side moved; the stale side can be overwritten
    Directional { divergence: Divergence },
    /// Both sides diverged; a resolution decision is required
    Conflict {
        conflict_type: ConflictType,
        fields: Vec<ConflictField>,
    },
}

impl Detection {
    pub fn status(&self) -> SyncStatus {
        match self {
            Detection::Synced { .. } => SyncStatus::Synced,
            Detection::Directional { divergence } => (*divergence).into(),
            Detection::Conflict { .. } => SyncStatus::Conflict,
        }
    }
}

/// Compares replicas using version ordering and the field table
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    table: Arc<ImportanceTable>,
}

impl ConflictDetector {
    pub fn new(table: Arc<ImportanceTable>) -> Self {
        Self { table }
    }

    /// Classify the divergence between `local` and `remote`.
    ///
    /// `local_edits` reports uncommitted local changes tracked by the entity
    /// repository; with edits pending, a newer remote can no longer simply
    /// overwrite the local side.
    pub fn detect(
        &self,
        entity_type: EntityType,
        local: &Replica,
        remote: &Replica,
        local_edits: bool,
    ) -> Detection {
        if local.version > remote.version {
            return Detection::Directional {
                divergence: Divergence::LocalNewer,
            };
        }
        if remote.version > local.version && !local_edits {
            return Detection::Directional {
                divergence: Divergence::RemoteNewer,
            };
        }

        let fields = self.diff(entity_type, local, remote);
        if fields.is_empty() {
            return Detection::Synced {
                version: Version::max_of(&local.version, &remote.version).clone(),
            };
        }

        let conflict_type = self.classify(entity_type, &fields);
        trace!(
            %entity_type,
            fields = fields.len(),
            ?conflict_type,
            "replicas diverged"
        );
        Detection::Conflict {
            conflict_type,
            fields,
        }
    }

    /// Every differing field, in comparison order
    pub fn diff(&self, entity_type: EntityType, local: &Replica, remote: &Replica) -> Vec<ConflictField> {
        self.table
            .comparison_order(entity_type, &local.payload, &remote.payload)
            .into_iter()
            .filter_map(|field| {
                let local_value = local.payload.get(&field);
                let remote_value = remote.payload.get(&field);
                if local_value == remote_value {
                    return None;
                }

                let data_type = match local_value {
                    Some(value) => DataType::of(Some(value)),
                    None => DataType::of(remote_value),
                };
                Some(ConflictField {
                    importance: self.table.importance(entity_type, &field),
                    local_value: local_value.cloned(),
                    remote_value: remote_value.cloned(),
                    data_type,
                    field,
                })
            })
            .collect()
    }

    /// Conflict category of a non-empty field difference
    pub(crate) fn classify(&self, entity_type: EntityType, fields: &[ConflictField]) -> ConflictType {
        if fields
            .iter()
            .any(|f| f.local_value.is_none() || f.remote_value.is_none())
        {
            return ConflictType::Structure;
        }

        let roles: Vec<FieldRole> = fields
            .iter()
            .map(|f| self.table.role(entity_type, &f.field))
            .collect();

        if roles.contains(&FieldRole::AccessControl) {
            ConflictType::Permissions
        } else if roles.iter().all(|role| *role == FieldRole::Metadata) {
            ConflictType::Metadata
        } else {
            ConflictType::Content
        }
    }
}
