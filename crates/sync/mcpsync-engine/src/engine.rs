//! Public engine surface: queries and controls over snapshots, conflicts,
//! jobs, servers, settings and backups.

use crate::backup::{BackupInfo, BackupVault};
use crate::config::EngineConfig;
use crate::conflicts::ConflictLog;
use crate::detector::ConflictDetector;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, SyncEvent};
use crate::job::{JobRequest, SyncJob};
use crate::reconcile::SyncCore;
use crate::registry::{LivenessProber, ServerConnection, ServerRegistry};
use crate::repository::EntityRepository;
use crate::resolver::ConflictResolver;
use crate::scheduler::JobScheduler;
use crate::schema::ImportanceTable;
use crate::settings::{SettingsHandle, SyncSettings};
use crate::store::{EntityFilter, KeyLocks, MemorySnapshotStore, SnapshotStore};
use crate::transport::EntityTransport;
use crate::types::{
    Conflict, EntityPayload, EntitySnapshot, EntityType, Resolution, SnapshotKey, SyncDirection,
    SyncStatus,
};
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// Identity and ownership of an entity to start tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub sync_direction: SyncDirection,
}

impl EntityDescriptor {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, entity_name: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            project_id: None,
            agent_id: None,
            sync_direction: SyncDirection::default(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.sync_direction = direction;
        self
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// Builder for [`SyncEngine`]
pub struct SyncEngineBuilder {
    transport: Arc<dyn EntityTransport>,
    repository: Arc<dyn EntityRepository>,
    store: Option<Arc<dyn SnapshotStore>>,
    registry: ServerRegistry,
    table: Arc<ImportanceTable>,
    config: EngineConfig,
    settings: SyncSettings,
}

impl SyncEngineBuilder {
    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: ServerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn importance_table(mut self, table: ImportanceTable) -> Self {
        self.table = Arc::new(table);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;

        let mut events = EventBus::new(self.config.event_capacity);
        if let Some(path) = &self.config.event_log_path {
            events = events.with_log_file(path);
        }

        let core = Arc::new(SyncCore {
            store: self.store.unwrap_or_else(|| Arc::new(MemorySnapshotStore::new())),
            repository: self.repository,
            transport: self.transport,
            registry: self.registry,
            detector: ConflictDetector::new(self.table),
            resolver: ConflictResolver::new(),
            conflicts: ConflictLog::new(),
            settings: SettingsHandle::new(self.settings)?,
            locks: KeyLocks::new(),
            events,
            backups: BackupVault::new(),
            config: self.config,
        });
        let scheduler = Arc::new(JobScheduler::new(Arc::clone(&core)));

        Ok(SyncEngine { core, scheduler })
    }
}

/// Synchronizes tracked entities with remote MCP servers
#[derive(Clone)]
pub struct SyncEngine {
    core: Arc<SyncCore>,
    scheduler: Arc<JobScheduler>,
}

impl SyncEngine {
    pub fn builder(transport: Arc<dyn EntityTransport>, repository: Arc<dyn EntityRepository>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            transport,
            repository,
            store: None,
            registry: ServerRegistry::new(),
            table: Arc::new(ImportanceTable::dashboard_defaults()),
            config: EngineConfig::default(),
            settings: SyncSettings::default(),
        }
    }

    // Queries

    pub async fn list_sync_states(&self, filter: &EntityFilter) -> Result<Vec<EntitySnapshot>> {
        self.core.store.list_by_filter(filter).await
    }

    pub async fn get_sync_state(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntitySnapshot>> {
        self.core.store.get(entity_type, entity_id).await
    }

    /// Conflicts in detection order; `Some(true)` keeps only resolved ones
    pub fn list_conflicts(&self, resolved: Option<bool>) -> Vec<Conflict> {
        self.core.conflicts.list(resolved)
    }

    pub fn get_conflict(&self, conflict_id: Uuid) -> Result<Conflict> {
        self.core
            .conflicts
            .get(conflict_id)
            .map(|record| record.conflict)
            .ok_or(EngineError::ConflictNotFound(conflict_id))
    }

    pub fn list_jobs(&self) -> Vec<SyncJob> {
        self.scheduler.list()
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<SyncJob> {
        self.scheduler.get(job_id)
    }

    pub fn list_servers(&self) -> Vec<ServerConnection> {
        self.core.registry.list()
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.core.registry
    }

    pub fn settings(&self) -> SyncSettings {
        self.core.settings.snapshot()
    }

    pub fn list_backups(&self) -> Vec<BackupInfo> {
        self.core.backups.list()
    }

    /// Start of the last completed sync against a server
    pub fn last_sync(&self, server_id: &str) -> Option<DateTime<Utc>> {
        self.scheduler.last_sync(server_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.core.events.subscribe()
    }

    // Controls

    /// Start a job in the background and return its initial record.
    ///
    /// A job that cannot run (unknown or disconnected server, nothing to
    /// restore) is returned already failed. Overlap with a running job is an
    /// error.
    pub async fn start_job(&self, request: JobRequest) -> Result<SyncJob> {
        self.scheduler.start(request).await
    }

    pub fn cancel_job(&self, job_id: Uuid) -> Result<SyncJob> {
        self.scheduler.cancel(job_id)
    }

    pub fn resume_job(&self, job_id: Uuid) -> Result<SyncJob> {
        self.scheduler.resume(job_id)
    }

    /// Wait until a job completes, fails or pauses
    pub async fn wait_for_job(&self, job_id: Uuid) -> Result<SyncJob> {
        self.scheduler.wait(job_id).await
    }

    /// Close a conflict.
    ///
    /// `merged` is required for [`Resolution::ManualMerge`] and ignored
    /// otherwise. Resolving an already resolved conflict fails.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: Resolution,
        resolved_by: &str,
        merged: Option<EntityPayload>,
    ) -> Result<Conflict> {
        let (conflict, _) = self
            .core
            .resolve_conflict(conflict_id, resolution, resolved_by, merged)
            .await?;
        Ok(conflict)
    }

    /// Replace the settings; running jobs keep the copy they started with
    pub fn update_settings(&self, settings: SyncSettings) -> Result<SyncSettings> {
        let previous = self.core.settings.update(settings)?;
        info!("sync settings updated");
        self.core.events.emit(SyncEvent::SettingsUpdated { timestamp: Utc::now() });
        Ok(previous)
    }

    /// Probe every registered server and record the results
    pub async fn refresh_servers(&self, prober: &dyn LivenessProber) {
        self.core.registry.refresh_all(prober).await;
    }

    /// Create or refresh the snapshot of an entity.
    ///
    /// New entities start as `local_newer` (or `remote_newer` when only the
    /// remote side exists) until a sync pass compares both sides.
    pub async fn track_entity(&self, descriptor: EntityDescriptor) -> Result<EntitySnapshot> {
        let key = descriptor.key();
        let _guard = self.core.locks.lock(&key).await;
        let local = self.core.repository.load(&key).await?;
        let existing = self.core.store.get(key.entity_type, &key.entity_id).await?;

        let snapshot = match existing {
            Some(mut snapshot) => {
                snapshot.entity_name = descriptor.entity_name;
                snapshot.project_id = descriptor.project_id;
                snapshot.agent_id = descriptor.agent_id;
                snapshot.sync_direction = descriptor.sync_direction;
                if let Some(local) = &local {
                    snapshot.local_version = local.replica.version.clone();
                    snapshot.local_timestamp = local.replica.timestamp;
                    let idle = matches!(snapshot.status, SyncStatus::Synced | SyncStatus::RemoteNewer);
                    if local.has_local_edits && idle && !self.core.conflicts.has_open(&key) {
                        snapshot.status = SyncStatus::LocalNewer;
                    }
                }
                snapshot
            }
            None => EntitySnapshot {
                entity_type: descriptor.entity_type,
                entity_id: descriptor.entity_id,
                entity_name: descriptor.entity_name,
                project_id: descriptor.project_id,
                agent_id: descriptor.agent_id,
                local_version: local
                    .as_ref()
                    .map(|l| l.replica.version.clone())
                    .unwrap_or_else(Version::default),
                remote_version: None,
                local_timestamp: local.as_ref().map(|l| l.replica.timestamp).unwrap_or_else(Utc::now),
                remote_timestamp: None,
                status: if local.is_some() {
                    SyncStatus::LocalNewer
                } else {
                    SyncStatus::RemoteNewer
                },
                conflict_type: None,
                sync_direction: descriptor.sync_direction,
                last_sync_attempt: None,
            },
        };

        self.core.store.upsert(snapshot.clone()).await?;
        Ok(snapshot)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("servers", &self.core.registry.list().len())
            .field("jobs", &self.scheduler.list().len())
            .finish()
    }
}
