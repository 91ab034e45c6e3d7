//! Common test utilities and fixtures for mcpsync-engine

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use mcpsync_engine::{
    BackoffConfig, ConnectionStatus, EngineConfig, EntityDescriptor, EntityPayload, EntitySnapshot,
    EntityType, JobRequest, LocalEntity, MemoryRepository, MemorySnapshotStore, MemoryTransport,
    RemoteEntity, Replica, ServerConnection, SnapshotKey, SnapshotStore, SyncEngine, SyncJob,
    SyncSettings,
};
use std::sync::Arc;
use std::time::Duration;

pub const SERVER: &str = "primary";

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn agent_key(id: &str) -> SnapshotKey {
    SnapshotKey::new(EntityType::Agent, id)
}

pub fn agent(goal: &str, tools: &[&str]) -> EntityPayload {
    EntityPayload::new()
        .with("name", "Planner")
        .with("goal", goal)
        .with("tools", serde_json::json!(tools))
}

/// Engine wired to in-memory collaborators and one connected server
pub struct SyncTestFixture {
    pub engine: SyncEngine,
    pub transport: Arc<MemoryTransport>,
    pub repository: Arc<MemoryRepository>,
}

impl SyncTestFixture {
    pub fn new() -> Self {
        Self::build(SyncSettings::default(), MemoryTransport::new(), EngineConfig::default())
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        Self::build(settings, MemoryTransport::new(), EngineConfig::default())
    }

    /// Every transport call takes `latency`; entities run one at a time
    pub fn slow(settings: SyncSettings, latency: Duration) -> Self {
        let config = EngineConfig {
            max_concurrency: 1,
            ..EngineConfig::default()
        };
        Self::build(settings, MemoryTransport::new().with_latency(latency), config)
    }

    pub fn build(settings: SyncSettings, transport: MemoryTransport, config: EngineConfig) -> Self {
        Self::build_with_store(settings, transport, config, Arc::new(MemorySnapshotStore::new()))
    }

    pub fn build_with_store(
        settings: SyncSettings,
        transport: MemoryTransport,
        config: EngineConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let transport = Arc::new(transport);
        let repository = Arc::new(MemoryRepository::new());
        let config = EngineConfig {
            backoff: BackoffConfig::immediate(),
            ..config
        };

        let engine = SyncEngine::builder(transport.clone(), repository.clone())
            .config(config)
            .settings(settings)
            .store(store)
            .build()
            .expect("Failed to build engine");
        engine.registry().register(
            ServerConnection::new(SERVER, "Primary", "https://mcp.example.test")
                .with_status(ConnectionStatus::Connected),
        );

        Self {
            engine,
            transport,
            repository,
        }
    }

    pub fn put_local(&self, key: &SnapshotKey, version: u64, at: i64, payload: EntityPayload) {
        self.repository.put(
            key.clone(),
            LocalEntity {
                entity_name: key.entity_id.clone(),
                replica: Replica::new(version, ts(at), payload),
                has_local_edits: false,
            },
        );
    }

    pub fn put_remote(&self, key: &SnapshotKey, version: u64, at: i64, payload: EntityPayload) {
        self.put_remote_on(SERVER, key, version, at, payload);
    }

    pub fn put_remote_on(&self, server_id: &str, key: &SnapshotKey, version: u64, at: i64, payload: EntityPayload) {
        self.transport.put_remote(
            server_id,
            key.clone(),
            RemoteEntity {
                entity_name: key.entity_id.clone(),
                replica: Replica::new(version, ts(at), payload),
            },
        );
    }

    pub async fn track(&self, key: &SnapshotKey) -> EntitySnapshot {
        self.engine
            .track_entity(EntityDescriptor::new(key.entity_type, key.entity_id.clone(), key.entity_id.clone()))
            .await
            .expect("Failed to track entity")
    }

    /// Seed both sides of an entity and track it
    pub async fn seed(
        &self,
        key: &SnapshotKey,
        local: (u64, i64, EntityPayload),
        remote: (u64, i64, EntityPayload),
    ) -> EntitySnapshot {
        self.put_local(key, local.0, local.1, local.2);
        self.put_remote(key, remote.0, remote.1, remote.2);
        self.track(key).await
    }

    /// Register another connected server
    pub fn connect(&self, server_id: &str) {
        self.engine.registry().register(
            ServerConnection::new(server_id, server_id, format!("https://{}.example.test", server_id))
                .with_status(ConnectionStatus::Connected),
        );
    }

    /// Seed `count` identical agents `a0..` and return their keys
    pub async fn seed_synced_agents(&self, count: usize) -> Vec<SnapshotKey> {
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            let key = agent_key(&format!("a{}", i));
            self.seed(&key, (1, 100, agent("plan", &[])), (1, 100, agent("plan", &[])))
                .await;
            keys.push(key);
        }
        keys
    }

    pub async fn snapshot(&self, key: &SnapshotKey) -> EntitySnapshot {
        self.engine
            .get_sync_state(key.entity_type, &key.entity_id)
            .await
            .expect("Failed to read snapshot")
            .expect("Snapshot missing")
    }

    /// Start a job and wait for it to stop
    pub async fn run(&self, request: JobRequest) -> SyncJob {
        let job = self.engine.start_job(request).await.expect("Failed to start job");
        self.engine.wait_for_job(job.id).await.expect("Failed to wait for job")
    }
}
