//! Sync jobs, their state machine and per-entity error records

use crate::error::{EngineError, ErrorType, Result};
use crate::settings::SyncSettings;
use crate::store::EntityFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FullSync,
    IncrementalSync,
    ConflictResolution,
    Backup,
    Restore,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullSync => "full_sync",
            JobType::IncrementalSync => "incremental_sync",
            JobType::ConflictResolution => "conflict_resolution",
            JobType::Backup => "backup",
            JobType::Restore => "restore",
        }
    }

    /// Whether the job exchanges data with a remote server
    pub fn needs_server(&self) -> bool {
        matches!(
            self,
            JobType::FullSync | JobType::IncrementalSync | JobType::ConflictResolution
        )
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `pending -> running -> {completed, failed, paused}`, `paused -> running`.
    ///
    /// A pending job may also fail directly when it cannot start.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
        )
    }
}

/// A per-entity failure recorded on a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    pub id: Uuid,
    pub entity_id: String,
    pub entity_name: String,
    pub error_type: ErrorType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Retries spent before giving up
    pub retry_count: u32,
    pub resolved: bool,
}

impl SyncError {
    pub fn new(
        entity_id: impl Into<String>,
        entity_name: impl Into<String>,
        error_type: ErrorType,
        message: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            error_type,
            message: message.into(),
            timestamp: Utc::now(),
            retry_count,
            resolved: false,
        }
    }
}

/// Parameters of a job to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_type: JobType,
    pub server_id: String,
    #[serde(default)]
    pub filter: EntityFilter,
    /// Settings for this job; `None` snapshots the current settings
    #[serde(default)]
    pub settings: Option<SyncSettings>,
    /// Archive to restore from; `None` picks the newest one
    #[serde(default)]
    pub backup_id: Option<Uuid>,
}

impl JobRequest {
    pub fn new(job_type: JobType, server_id: impl Into<String>) -> Self {
        Self {
            job_type,
            server_id: server_id.into(),
            filter: EntityFilter::all(),
            settings: None,
            backup_id: None,
        }
    }

    pub fn with_filter(mut self, filter: EntityFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_backup(mut self, backup_id: Uuid) -> Self {
        self.backup_id = Some(backup_id);
        self
    }
}

/// One bounded synchronization pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    /// 0 to 100, never decreasing while running
    pub progress: u8,
    pub entities_total: usize,
    pub entities_processed: usize,
    pub conflicts: u32,
    pub errors: Vec<SyncError>,
    /// Settings in effect when the job started
    pub settings: SyncSettings,
    pub server_id: String,
    pub filter: EntityFilter,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Archive produced (backup) or consumed (restore) by this job
    pub backup_id: Option<Uuid>,
}

impl SyncJob {
    pub fn new(job_type: JobType, server_id: String, filter: EntityFilter, settings: SyncSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            entities_total: 0,
            entities_processed: 0,
            conflicts: 0,
            errors: Vec::new(),
            settings,
            server_id,
            filter,
            start_time: Utc::now(),
            end_time: None,
            failure_reason: None,
            backup_id: None,
        }
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition(format!(
                "job {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Count one processed entity and recompute progress
    pub fn record_processed(&mut self) {
        if self.entities_processed < self.entities_total {
            self.entities_processed += 1;
        }
        let progress = (100 * self.entities_processed / self.entities_total.max(1)) as u8;
        self.progress = self.progress.max(progress);
    }

    pub fn record_error(&mut self, error: SyncError) {
        self.errors.push(error);
    }

    /// Mark the job completed; an empty job reports full progress
    pub fn complete(&mut self) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        if self.entities_processed == self.entities_total {
            self.progress = 100;
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}
