//! Core data model shared by the sync engine components

use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Kinds of entities managed by the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    Agent,
    Task,
    Document,
    Specification,
    Yaml,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Project,
        EntityType::Agent,
        EntityType::Task,
        EntityType::Document,
        EntityType::Specification,
        EntityType::Yaml,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Project => "project",
            EntityType::Agent => "agent",
            EntityType::Task => "task",
            EntityType::Document => "document",
            EntityType::Specification => "specification",
            EntityType::Yaml => "yaml",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived synchronization status of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Conflict,
    LocalNewer,
    RemoteNewer,
    Error,
}

/// Classification of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Content,
    Metadata,
    Structure,
    Permissions,
}

/// Which way data is allowed to flow for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    LocalToRemote,
    RemoteToLocal,
    #[default]
    Bidirectional,
}

impl SyncDirection {
    pub fn allows_push(&self) -> bool {
        matches!(self, SyncDirection::LocalToRemote | SyncDirection::Bidirectional)
    }

    pub fn allows_pull(&self) -> bool {
        matches!(self, SyncDirection::RemoteToLocal | SyncDirection::Bidirectional)
    }
}

/// Importance of a field, used to rank conflict fields for review
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Type tag of a conflicting value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
    /// The field is absent on this side
    Missing,
}

impl DataType {
    pub fn of(value: Option<&Value>) -> Self {
        match value {
            None => DataType::Missing,
            Some(Value::Null) => DataType::Null,
            Some(Value::Bool(_)) => DataType::Boolean,
            Some(Value::Number(_)) => DataType::Number,
            Some(Value::String(_)) => DataType::String,
            Some(Value::Array(_)) => DataType::Array,
            Some(Value::Object(_)) => DataType::Object,
        }
    }
}

/// Key of an entity snapshot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl SnapshotKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Field map of an entity
///
/// Keys are ordered, so iteration is deterministic regardless of how the
/// payload was built or decoded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityPayload {
    fields: BTreeMap<String, Value>,
}

impl EntityPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Value)> for EntityPayload {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// One side of an entity as seen during detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    pub payload: EntityPayload,
}

impl Replica {
    pub fn new(version: impl Into<Version>, timestamp: DateTime<Utc>, payload: EntityPayload) -> Self {
        Self {
            version: version.into(),
            timestamp,
            payload,
        }
    }
}

/// Last known local/remote state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: String,
    /// Owning project, used by project allow-lists
    pub project_id: Option<String>,
    /// Owning agent, used by agent allow-lists
    pub agent_id: Option<String>,
    pub local_version: Version,
    /// `None` until the entity has been seen on the remote side
    pub remote_version: Option<Version>,
    pub local_timestamp: DateTime<Utc>,
    pub remote_timestamp: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub conflict_type: Option<ConflictType>,
    pub sync_direction: SyncDirection,
    pub last_sync_attempt: Option<DateTime<Utc>>,
}

impl EntitySnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Latest write instant on either side
    pub fn last_change(&self) -> DateTime<Utc> {
        match self.remote_timestamp {
            Some(remote) if remote > self.local_timestamp => remote,
            _ => self.local_timestamp,
        }
    }
}

/// A single diverging field inside a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictField {
    pub field: String,
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
    /// Tag of the local value, or of the remote one when the field is
    /// missing locally
    pub data_type: DataType,
    pub importance: Importance,
}

/// How a conflict was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    ManualMerge,
    Skip,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::LocalWins => "local_wins",
            Resolution::RemoteWins => "remote_wins",
            Resolution::ManualMerge => "manual_merge",
            Resolution::Skip => "skip",
        }
    }
}

/// Field-level divergence awaiting (or having received) a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub entity_id: String,
    pub entity_name: String,
    pub entity_type: EntityType,
    pub conflict_type: ConflictType,
    pub conflict_fields: Vec<ConflictField>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    pub resolved_by: Option<String>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(self.entity_type, self.entity_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_serde() {
        let json = serde_json::to_string(&EntityType::Specification).unwrap();
        assert_eq!(json, "\"specification\"");
        assert_eq!(EntityType::Yaml.to_string(), "yaml");
    }

    #[test]
    fn test_payload_iterates_in_key_order() {
        let payload = EntityPayload::new()
            .with("tools", json!(["search"]))
            .with("goal", "ship")
            .with("name", "planner");

        let names: Vec<&str> = payload.field_names().collect();
        assert_eq!(names, vec!["goal", "name", "tools"]);
    }

    #[test]
    fn test_data_type_tags() {
        assert_eq!(DataType::of(None), DataType::Missing);
        assert_eq!(DataType::of(Some(&json!(1))), DataType::Number);
        assert_eq!(DataType::of(Some(&json!({"a": 1}))), DataType::Object);
    }

    #[test]
    fn test_direction_permissions() {
        assert!(SyncDirection::Bidirectional.allows_pull());
        assert!(SyncDirection::Bidirectional.allows_push());
        assert!(!SyncDirection::LocalToRemote.allows_pull());
        assert!(!SyncDirection::RemoteToLocal.allows_push());
    }
}
