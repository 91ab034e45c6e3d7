//! Per entity-type field tables
//!
//! The detector never hardcodes field names. It asks the table for the
//! declared field order, each field's importance, and whether a field is
//! descriptive metadata or access control (both feed conflict typing).

use crate::types::{EntityPayload, EntityType, Importance};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// What a field means for conflict classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    #[default]
    Payload,
    Metadata,
    AccessControl,
}

/// Declaration of one tracked field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub role: FieldRole,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, importance: Importance, role: FieldRole) -> Self {
        Self {
            name: name.into(),
            importance,
            role,
        }
    }
}

/// Ordered field declarations for one entity type
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldSchema {
    pub fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn spec(&self, field: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|spec| spec.name == field)
    }
}

/// Importance/role lookup for every entity type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportanceTable {
    schemas: HashMap<EntityType, FieldSchema>,
}

impl ImportanceTable {
    /// Empty table: every field is undeclared, `medium` importance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, entity_type: EntityType, schema: FieldSchema) -> Self {
        self.schemas.insert(entity_type, schema);
        self
    }

    pub fn schema(&self, entity_type: EntityType) -> Option<&FieldSchema> {
        self.schemas.get(&entity_type)
    }

    pub fn importance(&self, entity_type: EntityType, field: &str) -> Importance {
        self.spec(entity_type, field)
            .map(|spec| spec.importance)
            .unwrap_or_default()
    }

    pub fn role(&self, entity_type: EntityType, field: &str) -> FieldRole {
        self.spec(entity_type, field)
            .map(|spec| spec.role)
            .unwrap_or_default()
    }

    fn spec(&self, entity_type: EntityType, field: &str) -> Option<&FieldSpec> {
        self.schemas.get(&entity_type).and_then(|schema| schema.spec(field))
    }

    /// Comparison order over the union of both payloads' fields.
    ///
    /// Declared fields come first in declaration order, followed by any
    /// undeclared field in lexicographic order. Declared fields absent from
    /// both payloads are left out.
    pub fn comparison_order(
        &self,
        entity_type: EntityType,
        local: &EntityPayload,
        remote: &EntityPayload,
    ) -> Vec<String> {
        let mut present: BTreeSet<&str> = local.field_names().collect();
        present.extend(remote.field_names());

        let mut order = Vec::with_capacity(present.len());
        if let Some(schema) = self.schemas.get(&entity_type) {
            for spec in &schema.fields {
                if present.remove(spec.name.as_str()) {
                    order.push(spec.name.clone());
                }
            }
        }
        order.extend(present.into_iter().map(str::to_string));
        order
    }

    /// Field table for the dashboard's entity types
    pub fn dashboard_defaults() -> Self {
        use FieldRole::{AccessControl, Metadata, Payload};
        use Importance::{Critical, High, Low, Medium};

        let spec = FieldSpec::new;
        Self::new()
            .with_schema(
                EntityType::Project,
                FieldSchema::new(vec![
                    spec("name", High, Payload),
                    spec("status", Medium, Payload),
                    spec("description", Low, Metadata),
                    spec("tags", Low, Metadata),
                    spec("owner", Critical, AccessControl),
                    spec("members", High, AccessControl),
                ]),
            )
            .with_schema(
                EntityType::Agent,
                FieldSchema::new(vec![
                    spec("name", High, Payload),
                    spec("goal", Critical, Payload),
                    spec("instructions", High, Payload),
                    spec("tools", High, Payload),
                    spec("model", High, Payload),
                    spec("description", Low, Metadata),
                    spec("tags", Low, Metadata),
                    spec("permissions", Critical, AccessControl),
                ]),
            )
            .with_schema(
                EntityType::Task,
                FieldSchema::new(vec![
                    spec("title", High, Payload),
                    spec("status", High, Payload),
                    spec("priority", Medium, Payload),
                    spec("assignee", Medium, Payload),
                    spec("due_date", Medium, Payload),
                    spec("description", Low, Metadata),
                ]),
            )
            .with_schema(
                EntityType::Document,
                FieldSchema::new(vec![
                    spec("title", High, Payload),
                    spec("content", Critical, Payload),
                    spec("format", Medium, Payload),
                    spec("tags", Low, Metadata),
                    spec("visibility", Critical, AccessControl),
                ]),
            )
            .with_schema(
                EntityType::Specification,
                FieldSchema::new(vec![
                    spec("title", High, Payload),
                    spec("body", Critical, Payload),
                    spec("version_label", Medium, Metadata),
                    spec("reviewers", Medium, AccessControl),
                ]),
            )
            .with_schema(
                EntityType::Yaml,
                FieldSchema::new(vec![
                    spec("path", High, Payload),
                    spec("content", Critical, Payload),
                    spec("description", Low, Metadata),
                ]),
            )
    }
}
