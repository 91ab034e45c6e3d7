//! Transport call contracts checked against a mocked transport

mod common;

use async_trait::async_trait;
use common::{agent, agent_key, ts, SERVER};
use mcpsync_engine::{
    BackoffConfig, ConnectionStatus, EngineConfig, EntityDescriptor, EntityTransport, EntityType,
    ErrorType, JobRequest, JobStatus, JobType, LocalEntity, MemoryRepository, PushRequest, RemoteEntity,
    Replica, ServerConnection, SnapshotKey, SyncEngine, SyncSettings, SyncStatus, TransportError,
    Version,
};
use mockall::mock;
use std::sync::Arc;

mock! {
    pub Transport {}

    #[async_trait]
    impl EntityTransport for Transport {
        async fn fetch_remote(
            &self,
            server: &ServerConnection,
            key: &SnapshotKey,
        ) -> Result<Option<RemoteEntity>, TransportError>;

        async fn push_local(
            &self,
            server: &ServerConnection,
            key: &SnapshotKey,
            request: PushRequest,
        ) -> Result<Version, TransportError>;
    }
}

async fn engine_with(transport: MockTransport, repository: Arc<MemoryRepository>) -> SyncEngine {
    let engine = SyncEngine::builder(Arc::new(transport), repository)
        .config(EngineConfig {
            backoff: BackoffConfig::immediate(),
            ..EngineConfig::default()
        })
        .settings(SyncSettings {
            enable_backup: false,
            ..SyncSettings::default()
        })
        .build()
        .expect("Failed to build engine");
    engine.registry().register(
        ServerConnection::new(SERVER, "Primary", "https://mcp.example.test")
            .with_status(ConnectionStatus::Connected),
    );
    engine
        .track_entity(EntityDescriptor::new(EntityType::Agent, "a1", "Planner"))
        .await
        .expect("Failed to track entity");
    engine
}

fn local_repository(version: u64) -> Arc<MemoryRepository> {
    let repository = Arc::new(MemoryRepository::new());
    repository.put(
        agent_key("a1"),
        LocalEntity {
            entity_name: "Planner".into(),
            replica: Replica::new(version, ts(100), agent("plan", &["search"])),
            has_local_edits: false,
        },
    );
    repository
}

#[tokio::test]
async fn new_entity_is_created_with_its_local_version() {
    let mut transport = MockTransport::new();
    transport
        .expect_fetch_remote()
        .withf(|server, key| server.id == SERVER && *key == agent_key("a1"))
        .times(1)
        .returning(|_, _| Ok(None));
    transport
        .expect_push_local()
        .withf(|_, key, request| {
            *key == agent_key("a1")
                && request.expected_remote_version.is_none()
                && request.proposed_version == Version::counter(2)
                && request.payload == agent("plan", &["search"])
        })
        .times(1)
        .returning(|_, _, request| Ok(request.proposed_version));

    let engine = engine_with(transport, local_repository(2)).await;
    let job = engine
        .start_job(JobRequest::new(JobType::FullSync, SERVER))
        .await
        .unwrap();
    let job = engine.wait_for_job(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.errors.is_empty());
    let snapshot = engine.get_sync_state(EntityType::Agent, "a1").await.unwrap().unwrap();
    assert_eq!(snapshot.status, SyncStatus::Synced);
    assert_eq!(snapshot.remote_version, Some(Version::counter(2)));
}

#[tokio::test]
async fn permission_errors_are_not_retried() {
    let mut transport = MockTransport::new();
    transport
        .expect_fetch_remote()
        .times(1)
        .returning(|_, _| Err(TransportError::Permission("token revoked".into())));
    transport.expect_push_local().never();

    let engine = engine_with(transport, local_repository(2)).await;
    let job = engine
        .start_job(JobRequest::new(JobType::FullSync, SERVER))
        .await
        .unwrap();
    let job = engine.wait_for_job(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].error_type, ErrorType::Permission);
    assert_eq!(job.errors[0].retry_count, 0);
    let snapshot = engine.get_sync_state(EntityType::Agent, "a1").await.unwrap().unwrap();
    assert_eq!(snapshot.status, SyncStatus::Error);
}

#[tokio::test]
async fn network_errors_retry_until_success() {
    let mut transport = MockTransport::new();
    let mut seq = mockall::Sequence::new();
    transport
        .expect_fetch_remote()
        .times(2)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(TransportError::Network("connection reset".into())));
    transport
        .expect_fetch_remote()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| {
            Ok(Some(RemoteEntity {
                entity_name: "Planner".into(),
                replica: Replica::new(2u64, ts(100), agent("plan", &["search"])),
            }))
        });
    transport.expect_push_local().never();

    let engine = engine_with(transport, local_repository(2)).await;
    let job = engine
        .start_job(JobRequest::new(JobType::FullSync, SERVER))
        .await
        .unwrap();
    let job = engine.wait_for_job(job.id).await.unwrap();

    assert!(job.errors.is_empty());
    let snapshot = engine.get_sync_state(EntityType::Agent, "a1").await.unwrap().unwrap();
    assert_eq!(snapshot.status, SyncStatus::Synced);
}
