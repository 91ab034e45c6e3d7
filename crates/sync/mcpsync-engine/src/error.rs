//! Error types for sync engine operations

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Category of a per-entity failure recorded on a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Network,
    Permission,
    Validation,
    Conflict,
    Timeout,
}

/// Failures reported by the entity transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Invalid entity data: {0}")]
    Validation(String),

    /// The remote moved past the version the push was based on
    #[error("Remote changed: expected version {expected}, found {actual}")]
    RemoteChanged { expected: String, actual: String },
}

impl TransportError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            TransportError::Network(_) => ErrorType::Network,
            TransportError::Timeout(_) => ErrorType::Timeout,
            TransportError::Permission(_) => ErrorType::Permission,
            TransportError::Validation(_) => ErrorType::Validation,
            TransportError::RemoteChanged { .. } => ErrorType::Conflict,
        }
    }

    /// Only transient failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Timeout(_))
    }
}

/// Operation-level engine errors, returned synchronously to the caller
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Sync already running for overlapping entities (job {job_id}, {overlap} shared entities)")]
    AlreadyRunning { job_id: Uuid, overlap: usize },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Ambiguous resolution for {entity_id}: local and remote timestamps are identical")]
    AmbiguousResolution { entity_id: String },

    #[error("Manual merge for conflict {0} requires a merged payload")]
    MissingMergedPayload(Uuid),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(Uuid),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(Uuid),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Category used when this error is recorded against an entity
    pub fn error_type(&self) -> ErrorType {
        match self {
            EngineError::Transport(err) => err.error_type(),
            EngineError::AmbiguousResolution { .. }
            | EngineError::MissingMergedPayload(_)
            | EngineError::InvalidSettings(_)
            | EngineError::InvalidTransition(_) => ErrorType::Validation,
            EngineError::AlreadyRunning { .. } => ErrorType::Conflict,
            _ => ErrorType::Validation,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
