//! Engine events for observers
//!
//! Every job lifecycle change, conflict and settings update is published on
//! a broadcast channel. An optional JSONL file sink keeps an append-only
//! trail of the same events.

use crate::job::{JobStatus, JobType, SyncJob};
use crate::types::{Conflict, ConflictType, EntityType, Resolution};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SyncEvent {
    JobStarted {
        job_id: Uuid,
        job_type: JobType,
        server_id: String,
        entities_total: usize,
        timestamp: DateTime<Utc>,
    },

    JobProgress {
        job_id: Uuid,
        progress: u8,
        entities_processed: usize,
        entities_total: usize,
        timestamp: DateTime<Utc>,
    },

    /// Completed, failed or paused
    JobFinished {
        job_id: Uuid,
        status: JobStatus,
        conflicts: u32,
        errors: usize,
        failure_reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    ConflictDetected {
        conflict_id: Uuid,
        entity_type: EntityType,
        entity_id: String,
        conflict_type: ConflictType,
        fields: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    ConflictResolved {
        conflict_id: Uuid,
        entity_id: String,
        resolution: Resolution,
        resolved_by: String,
        timestamp: DateTime<Utc>,
    },

    SettingsUpdated { timestamp: DateTime<Utc> },

    BackupCreated {
        backup_id: Uuid,
        entities: usize,
        timestamp: DateTime<Utc>,
    },
}

impl SyncEvent {
    pub fn job_started(job: &SyncJob) -> Self {
        SyncEvent::JobStarted {
            job_id: job.id,
            job_type: job.job_type,
            server_id: job.server_id.clone(),
            entities_total: job.entities_total,
            timestamp: Utc::now(),
        }
    }

    pub fn job_progress(job: &SyncJob) -> Self {
        SyncEvent::JobProgress {
            job_id: job.id,
            progress: job.progress,
            entities_processed: job.entities_processed,
            entities_total: job.entities_total,
            timestamp: Utc::now(),
        }
    }

    pub fn job_finished(job: &SyncJob) -> Self {
        SyncEvent::JobFinished {
            job_id: job.id,
            status: job.status,
            conflicts: job.conflicts,
            errors: job.errors.len(),
            failure_reason: job.failure_reason.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn conflict_detected(conflict: &Conflict) -> Self {
        SyncEvent::ConflictDetected {
            conflict_id: conflict.id,
            entity_type: conflict.entity_type,
            entity_id: conflict.entity_id.clone(),
            conflict_type: conflict.conflict_type,
            fields: conflict.conflict_fields.iter().map(|f| f.field.clone()).collect(),
            timestamp: Utc::now(),
        }
    }

    pub fn conflict_resolved(conflict: &Conflict) -> Option<Self> {
        Some(SyncEvent::ConflictResolved {
            conflict_id: conflict.id,
            entity_id: conflict.entity_id.clone(),
            resolution: conflict.resolution?,
            resolved_by: conflict.resolved_by.clone()?,
            timestamp: conflict.resolved_at?,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::JobStarted { .. } => "job_started",
            SyncEvent::JobProgress { .. } => "job_progress",
            SyncEvent::JobFinished { .. } => "job_finished",
            SyncEvent::ConflictDetected { .. } => "conflict_detected",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::SettingsUpdated { .. } => "settings_updated",
            SyncEvent::BackupCreated { .. } => "backup_created",
        }
    }
}

/// Fan-out of engine events to subscribers and an optional log file
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
    log_file_path: Option<PathBuf>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            log_file_path: None,
        }
    }

    /// Also append every event as one JSON line to `path`
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file_path = Some(path.into());
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: SyncEvent) {
        debug!(event = event.name(), "sync event");
        if let Some(path) = &self.log_file_path {
            self.log_to_file(path.clone(), &event);
        }
        let _ = self.sender.send(event);
    }

    fn log_to_file(&self, path: PathBuf, event: &SyncEvent) {
        let line = match serde_json::to_string(event) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                error!("Failed to serialize event {}: {}", event.name(), e);
                return;
            }
        };

        // Off the async workers; ordering between lines is best effort
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            if let Err(e) = append_line(&path, &line) {
                error!("Failed to write event to log file {}: {}", path.display(), e);
            }
            return;
        };
        handle.spawn_blocking(move || {
            if let Err(e) = append_line(&path, &line) {
                error!("Failed to write event to log file {}: {}", path.display(), e);
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.flush()
}
