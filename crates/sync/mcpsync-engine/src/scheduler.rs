//! Job scheduling and batch execution
//!
//! A job claims the entity keys it resolved at start. A second job whose
//! keys intersect a claimed set is rejected, which keeps at most one job in
//! flight per entity. Claims are dropped when a job finishes or pauses.

use crate::backup::{BackupArchive, BackupEntry};
use crate::reconcile::{EntityOutcome, SyncCore};
use crate::error::{EngineError, ErrorType, Result};
use crate::events::SyncEvent;
use crate::job::{JobRequest, JobStatus, JobType, SyncError, SyncJob};
use crate::registry::ServerConnection;
use crate::settings::SyncSettings;
use crate::store::EntityFilter;
use crate::types::SnapshotKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runtime state of one job
struct JobSlot {
    job: RwLock<SyncJob>,
    /// Entities of the job in processing order
    keys: Vec<SnapshotKey>,
    cancel: AtomicBool,
    status: watch::Sender<JobStatus>,
    /// Pre-sync archive already taken
    backed_up: AtomicBool,
    /// Entries collected by a backup job
    captured: Mutex<Vec<BackupEntry>>,
    /// Archive a restore job reads from
    source: Option<Arc<BackupArchive>>,
}

impl JobSlot {
    fn new(job: SyncJob, keys: Vec<SnapshotKey>, source: Option<Arc<BackupArchive>>) -> Self {
        let (status, _) = watch::channel(job.status);
        Self {
            job: RwLock::new(job),
            keys,
            cancel: AtomicBool::new(false),
            status,
            backed_up: AtomicBool::new(false),
            captured: Mutex::new(Vec::new()),
            source,
        }
    }

    fn snapshot(&self) -> SyncJob {
        self.job.read().clone()
    }
}

/// Starts, runs, pauses and resumes sync jobs
pub(crate) struct JobScheduler {
    core: Arc<SyncCore>,
    jobs: DashMap<Uuid, Arc<JobSlot>>,
    order: RwLock<Vec<Uuid>>,
    claims: Mutex<HashMap<Uuid, BTreeSet<SnapshotKey>>>,
    /// Start time of the last completed sync per server
    boundaries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl JobScheduler {
    pub(crate) fn new(core: Arc<SyncCore>) -> Self {
        Self {
            core,
            jobs: DashMap::new(),
            order: RwLock::new(Vec::new()),
            claims: Mutex::new(HashMap::new()),
            boundaries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn start(self: &Arc<Self>, request: JobRequest) -> Result<SyncJob> {
        let settings = match request.settings {
            Some(settings) => settings,
            None => self.core.settings.snapshot(),
        };
        settings.validate()?;

        let mut filter = request.filter;
        if request.job_type == JobType::IncrementalSync && filter.changed_after.is_none() {
            filter.changed_after = self.last_sync(&request.server_id);
        }

        let source = match (request.job_type, request.backup_id) {
            (JobType::Restore, Some(id)) => Some(self.core.backups.get(id)?),
            (JobType::Restore, None) => self.core.backups.latest(),
            _ => None,
        };

        let keys = self.resolve_keys(request.job_type, &filter, &settings, source.as_deref()).await?;

        let mut job = SyncJob::new(request.job_type, request.server_id, filter, settings);
        job.entities_total = keys.len();
        job.backup_id = source.as_ref().map(|archive| archive.id);

        if let Some(reason) = self.start_blocker(&job, source.is_some()) {
            job.fail(reason)?;
            warn!(job_id = %job.id, job_type = job.job_type.as_str(), reason = ?job.failure_reason, "job failed to start");
            self.register(JobSlot::new(job.clone(), keys, source));
            self.core.events.emit(SyncEvent::job_finished(&job));
            return Ok(job);
        }

        {
            let mut claims = self.claims.lock();
            check_overlap(&claims, job.id, &keys)?;
            claims.insert(job.id, keys.iter().cloned().collect());
        }
        job.transition(JobStatus::Running)?;

        info!(
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            server = %job.server_id,
            entities = job.entities_total,
            "job started"
        );
        let slot = self.register(JobSlot::new(job.clone(), keys, source));
        self.core.events.emit(SyncEvent::job_started(&job));
        tokio::spawn(Arc::clone(self).run(slot));
        Ok(job)
    }

    /// Request a pause at the next batch boundary
    pub(crate) fn cancel(&self, job_id: Uuid) -> Result<SyncJob> {
        let slot = self.slot(job_id)?;
        let job = slot.snapshot();
        match job.status {
            JobStatus::Running => {
                slot.cancel.store(true, Ordering::SeqCst);
                debug!(%job_id, "pause requested");
                Ok(job)
            }
            JobStatus::Paused => Ok(job),
            status => Err(EngineError::InvalidTransition(format!(
                "job {} is {:?} and cannot be cancelled",
                job_id, status
            ))),
        }
    }

    /// Continue a paused job from its last processed entity
    pub(crate) fn resume(self: &Arc<Self>, job_id: Uuid) -> Result<SyncJob> {
        let slot = self.slot(job_id)?;
        let job = {
            let mut claims = self.claims.lock();
            let mut job = slot.job.write();
            if job.status != JobStatus::Paused {
                return Err(EngineError::InvalidTransition(format!(
                    "job {} is {:?}, only paused jobs can resume",
                    job_id, job.status
                )));
            }
            let remaining = &slot.keys[job.entities_processed.min(slot.keys.len())..];
            check_overlap(&claims, job_id, remaining)?;
            job.transition(JobStatus::Running)?;
            claims.insert(job_id, remaining.iter().cloned().collect());
            job.clone()
        };

        slot.cancel.store(false, Ordering::SeqCst);
        slot.status.send_replace(JobStatus::Running);
        info!(%job_id, processed = job.entities_processed, "job resumed");
        tokio::spawn(Arc::clone(self).run(slot));
        Ok(job)
    }

    /// Wait until the job completes, fails or pauses
    pub(crate) async fn wait(&self, job_id: Uuid) -> Result<SyncJob> {
        let slot = self.slot(job_id)?;
        let mut rx = slot.status.subscribe();
        rx.wait_for(|status| status.is_terminal() || *status == JobStatus::Paused)
            .await
            .map_err(|_| EngineError::Internal(format!("status channel of job {} closed", job_id)))?;
        Ok(slot.snapshot())
    }

    pub(crate) fn get(&self, job_id: Uuid) -> Result<SyncJob> {
        Ok(self.slot(job_id)?.snapshot())
    }

    /// Jobs in start order
    pub(crate) fn list(&self) -> Vec<SyncJob> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.jobs.get(id).map(|slot| slot.snapshot()))
            .collect()
    }

    /// Start of the last completed sync against `server_id`
    pub(crate) fn last_sync(&self, server_id: &str) -> Option<DateTime<Utc>> {
        self.boundaries.read().get(server_id).copied()
    }

    fn slot(&self, job_id: Uuid) -> Result<Arc<JobSlot>> {
        self.jobs
            .get(&job_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(EngineError::JobNotFound(job_id))
    }

    fn register(&self, slot: JobSlot) -> Arc<JobSlot> {
        let slot = Arc::new(slot);
        let id = slot.job.read().id;
        self.jobs.insert(id, Arc::clone(&slot));
        self.order.write().push(id);
        slot
    }

    async fn resolve_keys(
        &self,
        job_type: JobType,
        filter: &EntityFilter,
        settings: &SyncSettings,
        source: Option<&BackupArchive>,
    ) -> Result<Vec<SnapshotKey>> {
        let keys: Vec<SnapshotKey> = match (job_type, source) {
            (JobType::Restore, Some(archive)) => archive
                .entries
                .iter()
                .map(|entry| &entry.snapshot)
                .filter(|snapshot| filter.matches(snapshot) && settings.sync_filters.matches(snapshot))
                .map(|snapshot| snapshot.key())
                .collect(),
            (JobType::Restore, None) => Vec::new(),
            _ => self
                .core
                .store
                .list_by_filter(filter)
                .await?
                .iter()
                .filter(|snapshot| settings.sync_filters.matches(snapshot))
                .map(|snapshot| snapshot.key())
                .collect(),
        };

        if job_type == JobType::ConflictResolution {
            return Ok(keys
                .into_iter()
                .filter(|key| self.core.conflicts.has_open(key))
                .collect());
        }
        Ok(keys)
    }

    /// Reason a job cannot run at all
    fn start_blocker(&self, job: &SyncJob, has_source: bool) -> Option<String> {
        if job.job_type.needs_server() {
            match self.core.registry.get(&job.server_id) {
                None => return Some(format!("server {} is not registered", job.server_id)),
                Some(server) if !server.is_usable() => {
                    return Some(format!("server {} is {:?}", job.server_id, server.status));
                }
                Some(_) => {}
            }
        }
        if job.job_type == JobType::ConflictResolution && !job.settings.conflict_resolution.is_automatic() {
            return Some("conflict_resolution jobs need an automatic resolution policy".into());
        }
        if job.job_type == JobType::Restore && !has_source {
            return Some("no backup archive available".into());
        }
        None
    }

    async fn run(self: Arc<Self>, slot: Arc<JobSlot>) {
        let (job_id, job_type, settings, server_id, offset) = {
            let job = slot.job.read();
            (
                job.id,
                job.job_type,
                job.settings.clone(),
                job.server_id.clone(),
                job.entities_processed,
            )
        };

        if job_type == JobType::FullSync && settings.enable_backup && !slot.backed_up.swap(true, Ordering::SeqCst) {
            self.pre_sync_backup(&slot, job_id).await;
        }

        let mut position = offset.min(slot.keys.len());
        while position < slot.keys.len() {
            if slot.cancel.swap(false, Ordering::SeqCst) {
                self.pause(&slot);
                return;
            }

            let end = (position + settings.batch_size).min(slot.keys.len());
            let batch = &slot.keys[position..end];
            let outcomes = self.run_batch(&slot, job_type, &settings, &server_id, batch).await;

            let progress = {
                let mut job = slot.job.write();
                for outcome in outcomes {
                    job.record_processed();
                    if outcome.conflict_raised {
                        job.conflicts += 1;
                    }
                    if let Some(error) = outcome.error {
                        job.record_error(error);
                    }
                }
                SyncEvent::job_progress(&job)
            };
            self.core.events.emit(progress);
            position = end;

            if let Some(delay) = self.core.config.batch_delay() {
                tokio::time::sleep(delay).await;
            }
        }

        self.finish(&slot);
    }

    async fn run_batch(
        &self,
        slot: &JobSlot,
        job_type: JobType,
        settings: &SyncSettings,
        server_id: &str,
        batch: &[SnapshotKey],
    ) -> Vec<EntityOutcome> {
        let parallelism = self.core.config.max_concurrency.max(1);
        match job_type {
            JobType::FullSync | JobType::IncrementalSync => {
                // re-read once per batch so a dropped server stops the job's traffic
                match self.core.registry.get(server_id).filter(ServerConnection::is_usable) {
                    Some(server) => {
                        let server = &server;
                        stream::iter(batch.to_vec())
                            .map(|key| async move { self.core.sync_entity(server, &key, settings).await })
                            .buffered(parallelism)
                            .collect()
                            .await
                    }
                    None => {
                        let message = format!("server {} is unavailable", server_id);
                        stream::iter(batch.to_vec())
                            .then(|key| {
                                let message = message.clone();
                                async move { self.core.fail_entity(&key, ErrorType::Network, message).await }
                            })
                            .collect()
                            .await
                    }
                }
            }
            JobType::ConflictResolution => {
                stream::iter(batch.to_vec())
                    .map(|key| async move { self.core.resolve_open_conflict(&key, settings).await })
                    .buffered(parallelism)
                    .collect()
                    .await
            }
            JobType::Backup => {
                let mut outcomes = Vec::with_capacity(batch.len());
                for key in batch {
                    match self.core.capture_entry(key).await {
                        Ok(entry) => {
                            slot.captured.lock().push(entry);
                            outcomes.push(EntityOutcome::default());
                        }
                        Err(e) => outcomes.push(
                            self.core
                                .fail_entity(key, e.error_type(), e.to_string())
                                .await,
                        ),
                    }
                }
                outcomes
            }
            JobType::Restore => {
                let mut outcomes = Vec::with_capacity(batch.len());
                for key in batch {
                    let restored = match slot.source.as_ref().and_then(|archive| archive.entry(key)) {
                        Some(entry) => self.core.restore_entry(entry).await,
                        None => Err(EngineError::EntityNotFound(key.to_string())),
                    };
                    match restored {
                        Ok(()) => outcomes.push(EntityOutcome::default()),
                        Err(e) => outcomes.push(self.restore_failure(key, &e)),
                    }
                }
                outcomes
            }
        }
    }

    fn restore_failure(&self, key: &SnapshotKey, error: &EngineError) -> EntityOutcome {
        warn!(entity = %key, %error, "restore skipped entity");
        EntityOutcome {
            conflict_raised: false,
            error: Some(SyncError::new(
                key.entity_id.clone(),
                key.entity_id.clone(),
                error.error_type(),
                error.to_string(),
                0,
            )),
        }
    }

    async fn pre_sync_backup(&self, slot: &JobSlot, job_id: Uuid) {
        let mut entries = Vec::with_capacity(slot.keys.len());
        for key in &slot.keys {
            match self.core.capture_entry(key).await {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(entity = %key, error = %e, "entity left out of pre-sync backup"),
            }
        }
        let archive = self.core.backups.store(BackupArchive::new(Some(job_id), entries));
        debug!(%job_id, backup_id = %archive.id, entities = archive.len(), "pre-sync backup taken");
        self.core.events.emit(SyncEvent::BackupCreated {
            backup_id: archive.id,
            entities: archive.len(),
            timestamp: Utc::now(),
        });
    }

    fn pause(&self, slot: &JobSlot) {
        let job = {
            let mut claims = self.claims.lock();
            let mut job = slot.job.write();
            if let Err(e) = job.transition(JobStatus::Paused) {
                error!(job_id = %job.id, error = %e, "failed to pause job");
            }
            claims.remove(&job.id);
            job.clone()
        };

        slot.status.send_replace(job.status);
        info!(
            job_id = %job.id,
            processed = job.entities_processed,
            total = job.entities_total,
            "job paused"
        );
        self.core.events.emit(SyncEvent::job_finished(&job));
    }

    fn finish(&self, slot: &JobSlot) {
        let archive = if slot.job.read().job_type == JobType::Backup {
            let entries = std::mem::take(&mut *slot.captured.lock());
            let job_id = slot.job.read().id;
            Some(self.core.backups.store(BackupArchive::new(Some(job_id), entries)))
        } else {
            None
        };

        let job = {
            let mut claims = self.claims.lock();
            let mut job = slot.job.write();
            if let Some(archive) = &archive {
                job.backup_id = Some(archive.id);
            }
            if let Err(e) = job.complete() {
                error!(job_id = %job.id, error = %e, "failed to complete job");
            }
            claims.remove(&job.id);
            job.clone()
        };

        if matches!(job.job_type, JobType::FullSync | JobType::IncrementalSync) {
            let mut boundaries = self.boundaries.write();
            let boundary = boundaries.entry(job.server_id.clone()).or_insert(job.start_time);
            if job.start_time > *boundary {
                *boundary = job.start_time;
            }
        }

        if let Some(archive) = archive {
            self.core.events.emit(SyncEvent::BackupCreated {
                backup_id: archive.id,
                entities: archive.len(),
                timestamp: Utc::now(),
            });
        }

        slot.status.send_replace(job.status);
        info!(
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            processed = job.entities_processed,
            conflicts = job.conflicts,
            errors = job.errors.len(),
            "job completed"
        );
        self.core.events.emit(SyncEvent::job_finished(&job));
    }
}

/// Reject keys already claimed by another job
fn check_overlap(
    claims: &HashMap<Uuid, BTreeSet<SnapshotKey>>,
    job_id: Uuid,
    keys: &[SnapshotKey],
) -> Result<()> {
    for (other, claimed) in claims.iter().filter(|(other, _)| **other != job_id) {
        let overlap = keys.iter().filter(|key| claimed.contains(*key)).count();
        if overlap > 0 {
            return Err(EngineError::AlreadyRunning {
                job_id: *other,
                overlap,
            });
        }
    }
    Ok(())
}
