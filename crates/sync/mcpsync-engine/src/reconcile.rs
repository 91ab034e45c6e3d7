//! Per-entity synchronization and conflict handling
//!
//! Every read-detect-write sequence on an entity runs while holding that
//! entity's key lock, so a sync pass, a manual resolution and a restore can
//! never interleave on the same snapshot.

use crate::backup::{BackupEntry, BackupVault};
use crate::config::EngineConfig;
use crate::conflicts::ConflictLog;
use crate::detector::{ConflictDetector, Detection, Divergence};
use crate::error::{EngineError, ErrorType, Result, TransportError};
use crate::events::{EventBus, SyncEvent};
use crate::job::SyncError;
use crate::registry::{ServerConnection, ServerRegistry};
use crate::repository::EntityRepository;
use crate::resolver::{status_from_versions, ConflictResolver, MergeAction};
use crate::retry::with_retries;
use crate::settings::{SettingsHandle, SyncSettings};
use crate::store::{KeyLocks, SnapshotStore};
use crate::transport::{EntityTransport, PushRequest};
use crate::types::{
    Conflict, EntityPayload, EntitySnapshot, Replica, Resolution, SnapshotKey, SyncStatus,
};
use crate::version::Version;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared collaborators of the engine
pub(crate) struct SyncCore {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) repository: Arc<dyn EntityRepository>,
    pub(crate) transport: Arc<dyn EntityTransport>,
    pub(crate) registry: ServerRegistry,
    pub(crate) detector: ConflictDetector,
    pub(crate) resolver: ConflictResolver,
    pub(crate) conflicts: ConflictLog,
    pub(crate) settings: SettingsHandle,
    pub(crate) locks: KeyLocks,
    pub(crate) events: EventBus,
    pub(crate) backups: BackupVault,
}

/// What processing one entity contributed to its job
#[derive(Debug, Default)]
pub(crate) struct EntityOutcome {
    pub(crate) conflict_raised: bool,
    pub(crate) error: Option<SyncError>,
}

impl EntityOutcome {
    fn failed(error: SyncError) -> Self {
        Self {
            conflict_raised: false,
            error: Some(error),
        }
    }
}

/// An error together with the retries spent before it was final
struct Failure {
    error: EngineError,
    retries: u32,
}

impl From<EngineError> for Failure {
    fn from(error: EngineError) -> Self {
        Self { error, retries: 0 }
    }
}

impl Failure {
    fn into_sync_error(self, key: &SnapshotKey, entity_name: &str) -> SyncError {
        SyncError::new(
            key.entity_id.clone(),
            entity_name,
            self.error.error_type(),
            self.error.to_string(),
            self.retries,
        )
    }
}

/// Bring both sides of a snapshot to `version`
fn align(snapshot: &mut EntitySnapshot, version: Version, local_at: DateTime<Utc>, remote_at: DateTime<Utc>) {
    snapshot.local_version = version.clone();
    snapshot.remote_version = Some(version);
    snapshot.local_timestamp = local_at;
    snapshot.remote_timestamp = Some(remote_at);
    snapshot.status = SyncStatus::Synced;
    snapshot.conflict_type = None;
}

/// Record both replicas without transferring anything
fn observe(snapshot: &mut EntitySnapshot, local: &Replica, remote: &Replica, status: SyncStatus) {
    snapshot.local_version = local.version.clone();
    snapshot.remote_version = Some(remote.version.clone());
    snapshot.local_timestamp = local.timestamp;
    snapshot.remote_timestamp = Some(remote.timestamp);
    snapshot.status = status;
    snapshot.conflict_type = None;
}

impl SyncCore {
    /// Reconcile one entity against `server`
    pub(crate) async fn sync_entity(
        &self,
        server: &ServerConnection,
        key: &SnapshotKey,
        settings: &SyncSettings,
    ) -> EntityOutcome {
        let _guard = self.locks.lock(key).await;

        let snapshot = match self.store.get(key.entity_type, &key.entity_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                let failure = Failure::from(EngineError::EntityNotFound(key.to_string()));
                return EntityOutcome::failed(failure.into_sync_error(key, &key.entity_id));
            }
            Err(e) => return EntityOutcome::failed(Failure::from(e).into_sync_error(key, &key.entity_id)),
        };
        let entity_name = snapshot.entity_name.clone();

        match self.sync_locked(server, key, snapshot, settings).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                warn!(entity = %key, server = %server.id, error = %failure.error, "entity sync failed");
                self.mark_error(key).await;
                EntityOutcome::failed(failure.into_sync_error(key, &entity_name))
            }
        }
    }

    async fn sync_locked(
        &self,
        server: &ServerConnection,
        key: &SnapshotKey,
        mut snapshot: EntitySnapshot,
        settings: &SyncSettings,
    ) -> std::result::Result<EntityOutcome, Failure> {
        let local = self.repository.load(key).await?;

        let fetched = with_retries(
            settings.retry_attempts,
            self.config.request_timeout(),
            &self.config.backoff,
            || self.transport.fetch_remote(server, key),
        )
        .await;
        let retries = fetched.retries;
        let remote = fetched.result.map_err(|e| Failure {
            error: e.into(),
            retries,
        })?;

        let now = Utc::now();
        snapshot.last_sync_attempt = Some(now);

        if let Some(conflict_id) = self.conflicts.open_for(key) {
            // still waiting for a decision; only an automatic policy may close it here
            let mut outcome = EntityOutcome::default();
            if let (Some(local), Some(remote)) = (local, remote) {
                if self
                    .refresh_open_conflict(
                        conflict_id,
                        key,
                        &mut snapshot,
                        local.replica,
                        remote.replica,
                        settings,
                    )
                    .await?
                {
                    return Ok(outcome);
                }
            }
            snapshot.status = SyncStatus::Conflict;
            self.store.upsert(snapshot.clone()).await?;
            if settings.conflict_resolution.is_automatic() {
                if let Err(e) = self.auto_resolve_locked(conflict_id, settings).await {
                    outcome.error = Some(Failure::from(e).into_sync_error(key, &snapshot.entity_name));
                }
            }
            return Ok(outcome);
        }

        let direction = snapshot.sync_direction;
        match (local, remote) {
            (None, None) => {
                return Err(EngineError::EntityNotFound(format!("{} is unknown on both sides", key)).into());
            }
            (None, Some(remote)) => {
                if direction.allows_pull() {
                    self.repository.commit(key, remote.replica.clone()).await?;
                    align(&mut snapshot, remote.replica.version, remote.replica.timestamp, remote.replica.timestamp);
                } else {
                    snapshot.remote_version = Some(remote.replica.version);
                    snapshot.remote_timestamp = Some(remote.replica.timestamp);
                    snapshot.status = SyncStatus::RemoteNewer;
                }
            }
            (Some(local), None) => {
                if direction.allows_push() {
                    let (version, at) = self
                        .push(
                            server,
                            key,
                            settings,
                            &local.entity_name,
                            local.replica.payload.clone(),
                            None,
                            local.replica.version.clone(),
                            local.replica.timestamp,
                        )
                        .await?;
                    self.repository
                        .commit(key, Replica::new(version.clone(), local.replica.timestamp, local.replica.payload))
                        .await?;
                    align(&mut snapshot, version, local.replica.timestamp, at);
                } else {
                    snapshot.local_version = local.replica.version;
                    snapshot.local_timestamp = local.replica.timestamp;
                    snapshot.status = SyncStatus::LocalNewer;
                }
            }
            (Some(local), Some(remote)) => {
                let detection = self.detector.detect(
                    key.entity_type,
                    &local.replica,
                    &remote.replica,
                    local.has_local_edits,
                );
                match detection {
                    Detection::Synced { version } => {
                        if local.replica.version != version || local.has_local_edits {
                            let normalized = Replica::new(version.clone(), local.replica.timestamp, local.replica.payload.clone());
                            self.repository.commit(key, normalized).await?;
                        }
                        align(&mut snapshot, version, local.replica.timestamp, remote.replica.timestamp);
                    }
                    Detection::Directional {
                        divergence: Divergence::RemoteNewer,
                    } => {
                        if direction.allows_pull() {
                            self.repository.commit(key, remote.replica.clone()).await?;
                            align(&mut snapshot, remote.replica.version, remote.replica.timestamp, remote.replica.timestamp);
                        } else {
                            observe(&mut snapshot, &local.replica, &remote.replica, SyncStatus::RemoteNewer);
                        }
                    }
                    Detection::Directional {
                        divergence: Divergence::LocalNewer,
                    } => {
                        if direction.allows_push() {
                            let (version, at) = self
                                .push(
                                    server,
                                    key,
                                    settings,
                                    &local.entity_name,
                                    local.replica.payload.clone(),
                                    Some(remote.replica.version.clone()),
                                    local.replica.version.clone(),
                                    local.replica.timestamp,
                                )
                                .await?;
                            self.repository
                                .commit(key, Replica::new(version.clone(), local.replica.timestamp, local.replica.payload))
                                .await?;
                            align(&mut snapshot, version, local.replica.timestamp, at);
                        } else {
                            observe(&mut snapshot, &local.replica, &remote.replica, SyncStatus::LocalNewer);
                        }
                    }
                    Detection::Conflict { conflict_type, fields } => {
                        let conflict = Conflict {
                            id: Uuid::new_v4(),
                            entity_id: key.entity_id.clone(),
                            entity_name: snapshot.entity_name.clone(),
                            entity_type: key.entity_type,
                            conflict_type,
                            conflict_fields: fields,
                            created_at: now,
                            resolved_at: None,
                            resolution: None,
                            resolved_by: None,
                        };
                        let event = SyncEvent::conflict_detected(&conflict);
                        let conflict_id =
                            self.conflicts
                                .open(conflict, local.replica.clone(), remote.replica.clone(), server.id.clone())?;

                        observe(&mut snapshot, &local.replica, &remote.replica, SyncStatus::Conflict);
                        snapshot.conflict_type = Some(conflict_type);
                        self.store.upsert(snapshot.clone()).await?;
                        self.events.emit(event);
                        info!(entity = %key, ?conflict_type, %conflict_id, "conflict detected");

                        let mut outcome = EntityOutcome {
                            conflict_raised: true,
                            error: None,
                        };
                        if settings.conflict_resolution.is_automatic() {
                            if let Err(e) = self.auto_resolve_locked(conflict_id, settings).await {
                                warn!(entity = %key, error = %e, "automatic resolution failed");
                                outcome.error = Some(Failure::from(e).into_sync_error(key, &snapshot.entity_name));
                            }
                        }
                        return Ok(outcome);
                    }
                }
            }
        }

        debug!(entity = %key, status = ?snapshot.status, "entity reconciled");
        self.store.upsert(snapshot).await?;
        Ok(EntityOutcome::default())
    }

    #[allow(clippy::too_many_arguments)]
    async fn push(
        &self,
        server: &ServerConnection,
        key: &SnapshotKey,
        settings: &SyncSettings,
        entity_name: &str,
        payload: EntityPayload,
        expected: Option<Version>,
        proposed: Version,
        timestamp: DateTime<Utc>,
    ) -> std::result::Result<(Version, DateTime<Utc>), Failure> {
        let pushed = with_retries(
            settings.retry_attempts,
            self.config.request_timeout(),
            &self.config.backoff,
            || {
                self.transport.push_local(
                    server,
                    key,
                    PushRequest {
                        entity_name: entity_name.to_string(),
                        payload: payload.clone(),
                        expected_remote_version: expected.clone(),
                        proposed_version: proposed.clone(),
                        timestamp,
                    },
                )
            },
        )
        .await;

        let retries = pushed.retries;
        pushed
            .result
            .map(|version| (version, timestamp))
            .map_err(|e| Failure {
                error: e.into(),
                retries,
            })
    }

    /// Bring an open conflict up to date with the replicas seen by this pass.
    ///
    /// Returns `true` when both sides converged and the conflict was closed.
    async fn refresh_open_conflict(
        &self,
        conflict_id: Uuid,
        key: &SnapshotKey,
        snapshot: &mut EntitySnapshot,
        local: Replica,
        remote: Replica,
        settings: &SyncSettings,
    ) -> Result<bool> {
        let record = self
            .conflicts
            .get(conflict_id)
            .ok_or(EngineError::ConflictNotFound(conflict_id))?;
        if record.local == local && record.remote == remote {
            return Ok(false);
        }

        let fields = self.detector.diff(key.entity_type, &local, &remote);
        if fields.is_empty() {
            self.conflicts.refresh(
                conflict_id,
                local,
                remote,
                record.conflict.conflict_type,
                record.conflict.conflict_fields,
            )?;
            self.apply_resolution_locked(conflict_id, Resolution::RemoteWins, "sync:converged", None, settings)
                .await?;
            return Ok(true);
        }

        let conflict_type = self.detector.classify(key.entity_type, &fields);
        self.conflicts
            .refresh(conflict_id, local.clone(), remote.clone(), conflict_type, fields)?;
        observe(snapshot, &local, &remote, SyncStatus::Conflict);
        snapshot.conflict_type = Some(conflict_type);
        debug!(
            entity = %key,
            %conflict_id,
            remote_version = %remote.version,
            "open conflict refreshed"
        );
        Ok(false)
    }

    /// Flag a snapshot as failed unless it is waiting on a conflict
    async fn mark_error(&self, key: &SnapshotKey) {
        let snapshot = match self.store.get(key.entity_type, &key.entity_id).await {
            Ok(Some(snapshot)) => snapshot,
            _ => return,
        };
        let mut snapshot = snapshot;
        snapshot.last_sync_attempt = Some(Utc::now());
        if !self.conflicts.has_open(key) {
            snapshot.status = SyncStatus::Error;
        }
        if let Err(e) = self.store.upsert(snapshot).await {
            warn!(entity = %key, error = %e, "failed to record entity error");
        }
    }

    /// Record a failure for an entity that could not be attempted at all
    pub(crate) async fn fail_entity(&self, key: &SnapshotKey, error_type: ErrorType, message: String) -> EntityOutcome {
        let _guard = self.locks.lock(key).await;
        let entity_name = self.entity_name(key).await;
        self.mark_error(key).await;
        EntityOutcome::failed(SyncError::new(key.entity_id.clone(), entity_name, error_type, message, 0))
    }

    async fn entity_name(&self, key: &SnapshotKey) -> String {
        match self.store.get(key.entity_type, &key.entity_id).await {
            Ok(Some(snapshot)) => snapshot.entity_name,
            _ => key.entity_id.clone(),
        }
    }

    /// Close a conflict with a caller-supplied decision
    pub(crate) async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: Resolution,
        resolved_by: &str,
        merged: Option<EntityPayload>,
    ) -> Result<(Conflict, EntitySnapshot)> {
        let record = self
            .conflicts
            .get(conflict_id)
            .ok_or(EngineError::ConflictNotFound(conflict_id))?;
        let _guard = self.locks.lock(&record.conflict.key()).await;
        let settings = self.settings.snapshot();
        self.apply_resolution_locked(conflict_id, resolution, resolved_by, merged, &settings)
            .await
    }

    /// Apply the job's policy to the open conflict of `key`, if any
    pub(crate) async fn resolve_open_conflict(&self, key: &SnapshotKey, settings: &SyncSettings) -> EntityOutcome {
        let _guard = self.locks.lock(key).await;
        let Some(conflict_id) = self.conflicts.open_for(key) else {
            return EntityOutcome::default();
        };

        match self.auto_resolve_locked(conflict_id, settings).await {
            Ok(_) => EntityOutcome::default(),
            Err(e) => {
                let entity_name = self.entity_name(key).await;
                EntityOutcome::failed(Failure::from(e).into_sync_error(key, &entity_name))
            }
        }
    }

    async fn auto_resolve_locked(&self, conflict_id: Uuid, settings: &SyncSettings) -> Result<Option<Conflict>> {
        let record = self
            .conflicts
            .get(conflict_id)
            .ok_or(EngineError::ConflictNotFound(conflict_id))?;
        let Some(resolution) = self.resolver.decide(settings.conflict_resolution, &record)? else {
            return Ok(None);
        };

        let resolved_by = format!("policy:{}", settings.conflict_resolution.as_str());
        let (conflict, _) = self
            .apply_resolution_locked(conflict_id, resolution, &resolved_by, None, settings)
            .await?;
        Ok(Some(conflict))
    }

    /// Carry out a resolution, then close the conflict.
    ///
    /// The conflict stays open if any side effect fails.
    async fn apply_resolution_locked(
        &self,
        conflict_id: Uuid,
        resolution: Resolution,
        resolved_by: &str,
        merged: Option<EntityPayload>,
        settings: &SyncSettings,
    ) -> Result<(Conflict, EntitySnapshot)> {
        let record = self
            .conflicts
            .get(conflict_id)
            .ok_or(EngineError::ConflictNotFound(conflict_id))?;
        let plan = self.resolver.plan(&record, resolution, merged)?;
        let key = record.conflict.key();
        let mut snapshot = self
            .store
            .get(key.entity_type, &key.entity_id)
            .await?
            .ok_or_else(|| EngineError::EntityNotFound(key.to_string()))?;

        match plan.action {
            MergeAction::Push {
                payload,
                proposed_version,
            } => {
                // a merged payload is a new write; a winning local side keeps its own write time
                let written_at = match plan.resolution {
                    Resolution::LocalWins => record.local.timestamp,
                    _ => Utc::now(),
                };
                let server = self
                    .registry
                    .get(&record.server_id)
                    .filter(ServerConnection::is_usable)
                    .ok_or_else(|| {
                        TransportError::Network(format!("server {} is not connected", record.server_id))
                    })?;
                let (version, at) = self
                    .push(
                        &server,
                        &key,
                        settings,
                        &record.conflict.entity_name,
                        payload.clone(),
                        Some(record.remote.version.clone()),
                        proposed_version,
                        written_at,
                    )
                    .await
                    .map_err(|failure| failure.error)?;
                self.repository
                    .commit(&key, Replica::new(version.clone(), at, payload))
                    .await?;
                align(&mut snapshot, version, at, at);
            }
            MergeAction::Pull { replica } => {
                self.repository.commit(&key, replica.clone()).await?;
                align(&mut snapshot, replica.version, replica.timestamp, replica.timestamp);
            }
            MergeAction::Leave => {
                let status = status_from_versions(&record.local.version, Some(&record.remote.version), false);
                observe(&mut snapshot, &record.local, &record.remote, status);
            }
        }

        let conflict = self.conflicts.close(conflict_id, plan.resolution, resolved_by)?;
        snapshot.last_sync_attempt = Some(Utc::now());
        self.store.upsert(snapshot.clone()).await?;

        if let Some(event) = SyncEvent::conflict_resolved(&conflict) {
            self.events.emit(event);
        }
        info!(
            entity = %key,
            %conflict_id,
            resolution = plan.resolution.as_str(),
            resolved_by,
            "conflict resolved"
        );
        Ok((conflict, snapshot))
    }

    /// Archive the current snapshot and local replica of `key`
    pub(crate) async fn capture_entry(&self, key: &SnapshotKey) -> Result<BackupEntry> {
        let _guard = self.locks.lock(key).await;
        let snapshot = self
            .store
            .get(key.entity_type, &key.entity_id)
            .await?
            .ok_or_else(|| EngineError::EntityNotFound(key.to_string()))?;
        let local = self.repository.load(key).await?;
        Ok(BackupEntry { snapshot, local })
    }

    /// Put an archived local replica back in place.
    ///
    /// Entities with an open conflict are left alone; the conflict has to be
    /// decided first.
    pub(crate) async fn restore_entry(&self, entry: &BackupEntry) -> Result<()> {
        let key = entry.snapshot.key();
        let _guard = self.locks.lock(&key).await;
        if let Some(conflict_id) = self.conflicts.open_for(&key) {
            return Err(EngineError::InvalidTransition(format!(
                "{} has open conflict {}",
                key, conflict_id
            )));
        }

        let current = self.store.get(key.entity_type, &key.entity_id).await?;
        if let Some(local) = &entry.local {
            self.repository.commit(&key, local.replica.clone()).await?;
        }

        let mut restored = entry.snapshot.clone();
        if let Some(current) = current {
            restored.remote_version = current.remote_version;
            restored.remote_timestamp = current.remote_timestamp;
        }
        let remote_unchanged = restored.remote_version == entry.snapshot.remote_version;
        restored.status = status_from_versions(
            &restored.local_version,
            restored.remote_version.as_ref(),
            remote_unchanged && entry.snapshot.status == SyncStatus::Synced,
        );
        restored.conflict_type = None;
        restored.last_sync_attempt = Some(Utc::now());
        self.store.upsert(restored).await?;
        debug!(entity = %key, "entity restored from archive");
        Ok(())
    }
}
