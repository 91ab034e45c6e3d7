//! Declarative sync settings and the process-wide settings handle
//!
//! Settings are mutated only through [`SettingsHandle::update`]. Jobs take a
//! copy at start, so a later update never changes the behavior of a job that
//! is already running.

use crate::error::{EngineError, Result};
use crate::types::{EntitySnapshot, EntityType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// How conflicts are closed once detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    #[default]
    Manual,
    LocalWins,
    RemoteWins,
    NewestWins,
}

impl ResolutionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionPolicy::Manual => "manual",
            ResolutionPolicy::LocalWins => "local_wins",
            ResolutionPolicy::RemoteWins => "remote_wins",
            ResolutionPolicy::NewestWins => "newest_wins",
        }
    }

    pub fn is_automatic(&self) -> bool {
        !matches!(self, ResolutionPolicy::Manual)
    }
}

/// Allow-lists restricting which entities take part in sync.
///
/// An empty list places no restriction on that dimension.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncFilters {
    #[serde(default)]
    pub entity_types: BTreeSet<EntityType>,
    #[serde(default)]
    pub project_ids: BTreeSet<String>,
    #[serde(default)]
    pub agent_ids: BTreeSet<String>,
}

impl SyncFilters {
    pub fn matches(&self, snapshot: &EntitySnapshot) -> bool {
        let type_ok =
            self.entity_types.is_empty() || self.entity_types.contains(&snapshot.entity_type);
        let project_ok = self.project_ids.is_empty()
            || snapshot
                .project_id
                .as_ref()
                .is_some_and(|id| self.project_ids.contains(id));
        let agent_ok = self.agent_ids.is_empty()
            || snapshot
                .agent_id
                .as_ref()
                .is_some_and(|id| self.agent_ids.contains(id));
        type_ok && project_ok && agent_ok
    }
}

/// Settings consumed by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub auto_sync: bool,
    /// Minutes between automatic passes
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
    #[serde(default)]
    pub conflict_resolution: ResolutionPolicy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Total attempts per remote call, first try included
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_true")]
    pub enable_backup: bool,
    #[serde(default)]
    pub sync_filters: SyncFilters,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_sync: false,
            sync_interval: default_sync_interval(),
            conflict_resolution: ResolutionPolicy::Manual,
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            enable_backup: true,
            sync_filters: SyncFilters::default(),
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<()> {
        if self.sync_interval == 0 {
            return Err(EngineError::InvalidSettings(
                "sync_interval must be at least one minute".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(EngineError::InvalidSettings("batch_size must be positive".into()));
        }
        if self.retry_attempts == 0 {
            return Err(EngineError::InvalidSettings(
                "retry_attempts must allow at least one attempt".into(),
            ));
        }
        Ok(())
    }
}

fn default_sync_interval() -> u64 {
    30
}

fn default_batch_size() -> usize {
    50
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Shared, explicitly updated settings
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<SyncSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: SyncSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(settings)),
        })
    }

    /// Immutable copy for a job about to start
    pub fn snapshot(&self) -> SyncSettings {
        self.inner.read().clone()
    }

    /// Replace the settings, returning the previous value
    pub fn update(&self, settings: SyncSettings) -> Result<SyncSettings> {
        settings.validate()?;
        let mut guard = self.inner.write();
        Ok(std::mem::replace(&mut *guard, settings))
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SyncSettings::default())),
        }
    }
}
