//! # MCP Sync Engine
//!
//! Keeps entities of a local dashboard (projects, agents, tasks, documents,
//! specifications, YAML files) consistent with copies held on remote MCP
//! servers.
//!
//! ## Overview
//!
//! - **Snapshots**: last known local/remote version and status per entity
//! - **Detection**: version ordering plus a field-level diff classified by
//!   an importance table
//! - **Resolution**: manual decisions or an automatic policy
//!   (`local_wins`, `remote_wins`, `newest_wins`)
//! - **Jobs**: batched, bounded-parallel passes with retries, pause/resume
//!   and at most one job in flight per entity
//! - **Backups**: pre-sync archives and restore jobs
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcpsync_engine::{
//!     EntityDescriptor, EntityType, JobRequest, JobType, MemoryRepository, MemoryTransport,
//!     ServerConnection, ConnectionStatus, SyncEngine,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SyncEngine::builder(
//!         Arc::new(MemoryTransport::new()),
//!         Arc::new(MemoryRepository::new()),
//!     )
//!     .build()?;
//!
//!     engine.registry().register(
//!         ServerConnection::new("primary", "Primary", "https://mcp.example.test")
//!             .with_status(ConnectionStatus::Connected),
//!     );
//!     engine
//!         .track_entity(EntityDescriptor::new(EntityType::Agent, "a1", "Planner"))
//!         .await?;
//!
//!     let job = engine.start_job(JobRequest::new(JobType::FullSync, "primary")).await?;
//!     let job = engine.wait_for_job(job.id).await?;
//!     println!("{:?}: {} conflicts", job.status, job.conflicts);
//!     Ok(())
//! }
//! ```

pub mod auto_sync;
pub mod backup;
pub mod config;
pub mod conflicts;
pub mod detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
mod reconcile;
pub mod registry;
pub mod repository;
pub mod resolver;
pub mod retry;
mod scheduler;
pub mod schema;
pub mod settings;
pub mod store;
pub mod transport;
pub mod types;
pub mod version;

// Re-exports for convenience
pub use auto_sync::AutoSyncDriver;
pub use backup::{BackupArchive, BackupEntry, BackupInfo};
pub use crate::config::{load_config, AppConfig, EngineConfig, ServerEntry};
pub use conflicts::{ConflictLog, ConflictRecord};
pub use detector::{ConflictDetector, Detection, Divergence};
pub use engine::{EntityDescriptor, SyncEngine, SyncEngineBuilder};
pub use error::{EngineError, ErrorType, Result, TransportError};
pub use events::{EventBus, SyncEvent};
pub use job::{JobRequest, JobStatus, JobType, SyncError, SyncJob};
pub use registry::{
    ConnectionStatus, Credential, LivenessProber, ProbeReport, ServerConnection, ServerRegistry,
    StaticProber,
};
pub use repository::{EntityRepository, LocalEntity, MemoryRepository};
pub use resolver::{ConflictResolver, MergeAction, ResolutionPlan};
pub use retry::BackoffConfig;
pub use schema::{FieldRole, FieldSchema, FieldSpec, ImportanceTable};
pub use settings::{ResolutionPolicy, SettingsHandle, SyncFilters, SyncSettings};
pub use store::{EntityFilter, KeyLocks, MemorySnapshotStore, SnapshotStore};
pub use transport::{EntityTransport, MemoryTransport, PushRequest, RemoteEntity};
pub use types::{
    Conflict, ConflictField, ConflictType, DataType, EntityPayload, EntitySnapshot, EntityType,
    Importance, Replica, Resolution, SnapshotKey, SyncDirection, SyncStatus,
};
pub use version::Version;
