//! Job lifecycle: overlap, progress, pause/resume, server loss, backups

mod common;

use common::{agent, agent_key, ts, SyncTestFixture, SERVER};
use mcpsync_engine::{
    AutoSyncDriver, ConnectionStatus, EngineError, EntityFilter, ErrorType, JobRequest, JobStatus,
    JobType, ProbeReport, ResolutionPolicy, SyncEvent, SyncSettings, SyncStatus,
};
use std::time::Duration;
use uuid::Uuid;

fn batched(batch_size: usize) -> SyncSettings {
    SyncSettings {
        batch_size,
        enable_backup: false,
        ..SyncSettings::default()
    }
}

#[tokio::test]
async fn overlapping_job_is_rejected() {
    let fixture = SyncTestFixture::slow(batched(1), Duration::from_millis(200));
    fixture.seed_synced_agents(3).await;

    let first = fixture
        .engine
        .start_job(JobRequest::new(JobType::FullSync, SERVER))
        .await
        .unwrap();
    let second = fixture
        .engine
        .start_job(JobRequest::new(JobType::IncrementalSync, SERVER))
        .await;

    match second {
        Err(EngineError::AlreadyRunning { job_id, overlap }) => {
            assert_eq!(job_id, first.id);
            assert_eq!(overlap, 3);
        }
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }
    assert_eq!(
        fixture.engine.wait_for_job(first.id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn disjoint_jobs_run_concurrently() {
    let fixture = SyncTestFixture::slow(batched(1), Duration::from_millis(50));
    fixture.seed_synced_agents(2).await;

    let first = fixture
        .engine
        .start_job(JobRequest::new(JobType::FullSync, SERVER).with_filter(EntityFilter::for_ids(["a0"])))
        .await
        .unwrap();
    let second = fixture
        .engine
        .start_job(JobRequest::new(JobType::FullSync, SERVER).with_filter(EntityFilter::for_ids(["a1"])))
        .await
        .unwrap();

    let first = fixture.engine.wait_for_job(first.id).await.unwrap();
    let second = fixture.engine.wait_for_job(second.id).await.unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(first.entities_total, 1);
    assert_eq!(fixture.engine.list_jobs().len(), 2);
}

#[tokio::test]
async fn progress_never_decreases_and_ends_at_100() {
    let fixture = SyncTestFixture::with_settings(batched(2));
    fixture.seed_synced_agents(5).await;
    let mut events = fixture.engine.subscribe();

    let job = fixture.run(JobRequest::new(JobType::FullSync, SERVER)).await;
    assert_eq!(job.progress, 100);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::JobProgress { job_id, progress, .. } = event {
            if job_id == job.id {
                seen.push(progress);
            }
        }
    }
    // batches of 2, 2, 1
    assert_eq!(seen, vec![40, 80, 100]);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn empty_job_completes_at_full_progress() {
    let fixture = SyncTestFixture::new();
    let job = fixture.run(JobRequest::new(JobType::FullSync, SERVER)).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.entities_total, 0);
    assert_eq!(job.progress, 100);
}

#[tokio::test]
async fn cancel_pauses_at_batch_boundary_and_resume_finishes() {
    let fixture = SyncTestFixture::slow(batched(1), Duration::from_millis(30));
    let keys = fixture.seed_synced_agents(5).await;

    let job = fixture
        .engine
        .start_job(JobRequest::new(JobType::FullSync, SERVER))
        .await
        .unwrap();
    fixture.engine.cancel_job(job.id).unwrap();

    let paused = fixture.engine.wait_for_job(job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert!(paused.entities_processed < 5);
    assert!(paused.end_time.is_none());

    // claims are released while paused
    let other = fixture
        .engine
        .start_job(JobRequest::new(JobType::Backup, SERVER))
        .await
        .unwrap();
    fixture.engine.wait_for_job(other.id).await.unwrap();

    let resumed = fixture.engine.resume_job(job.id).unwrap();
    assert_eq!(resumed.status, JobStatus::Running);
    let done = fixture.engine.wait_for_job(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.entities_processed, 5);
    assert_eq!(done.progress, 100);

    for key in &keys {
        assert_eq!(fixture.snapshot(key).await.status, SyncStatus::Synced);
    }
    assert!(matches!(
        fixture.engine.resume_job(job.id),
        Err(EngineError::InvalidTransition(_))
    ));
    assert!(matches!(
        fixture.engine.cancel_job(job.id),
        Err(EngineError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn unusable_server_fails_job_at_start() {
    let fixture = SyncTestFixture::new();
    fixture.seed_synced_agents(2).await;
    fixture
        .engine
        .registry()
        .apply_probe(SERVER, ProbeReport::down(ConnectionStatus::Disconnected))
        .unwrap();

    let job = fixture.run(JobRequest::new(JobType::FullSync, SERVER)).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.entities_processed, 0);
    assert!(job.failure_reason.unwrap().contains(SERVER));
    assert!(job.end_time.is_some());

    let unknown = fixture.run(JobRequest::new(JobType::FullSync, "nowhere")).await;
    assert_eq!(unknown.status, JobStatus::Failed);
}

#[tokio::test]
async fn server_lost_mid_job_records_network_errors() {
    let fixture = SyncTestFixture::slow(batched(1), Duration::from_millis(100));
    let keys = fixture.seed_synced_agents(3).await;

    let job = fixture
        .engine
        .start_job(JobRequest::new(JobType::FullSync, SERVER))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    fixture
        .engine
        .registry()
        .apply_probe(SERVER, ProbeReport::down(ConnectionStatus::Error))
        .unwrap();

    let job = fixture.engine.wait_for_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.entities_processed, 3);
    assert_eq!(job.errors.len(), 2);
    assert!(job.errors.iter().all(|e| e.error_type == ErrorType::Network));
    assert_eq!(fixture.snapshot(&keys[0]).await.status, SyncStatus::Synced);
    assert_eq!(fixture.snapshot(&keys[2]).await.status, SyncStatus::Error);
}

#[tokio::test]
async fn running_job_keeps_settings_it_started_with() {
    let fixture = SyncTestFixture::slow(batched(1), Duration::from_millis(50));
    let key = agent_key("a1");
    fixture
        .seed(&key, (3, 100, agent("local", &[])), (3, 100, agent("remote", &[])))
        .await;

    let job = fixture
        .engine
        .start_job(JobRequest::new(JobType::FullSync, SERVER))
        .await
        .unwrap();
    fixture
        .engine
        .update_settings(SyncSettings {
            conflict_resolution: ResolutionPolicy::RemoteWins,
            ..SyncSettings::default()
        })
        .unwrap();

    let job = fixture.engine.wait_for_job(job.id).await.unwrap();
    assert_eq!(job.settings.conflict_resolution, ResolutionPolicy::Manual);
    assert_eq!(fixture.engine.list_conflicts(Some(false)).len(), 1);
    assert_eq!(
        fixture.engine.settings().conflict_resolution,
        ResolutionPolicy::RemoteWins
    );
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    let fixture = SyncTestFixture::new();
    let result = fixture.engine.update_settings(SyncSettings {
        batch_size: 0,
        ..SyncSettings::default()
    });
    assert!(matches!(result, Err(EngineError::InvalidSettings(_))));
    assert_eq!(fixture.engine.settings().batch_size, 50);
}

#[tokio::test]
async fn incremental_sync_only_visits_entities_changed_since_last_pass() {
    let fixture = SyncTestFixture::new();
    let keys = fixture.seed_synced_agents(3).await;
    let full = fixture.run(JobRequest::new(JobType::FullSync, SERVER)).await;
    assert_eq!(full.entities_total, 3);
    assert!(fixture.engine.last_sync(SERVER).is_some());

    let later = chrono::Utc::now() + chrono::Duration::seconds(5);
    assert!(fixture.repository.edit(&keys[1], agent("revised", &[]), later));
    fixture.track(&keys[1]).await;

    let incremental = fixture.run(JobRequest::new(JobType::IncrementalSync, SERVER)).await;
    assert_eq!(incremental.status, JobStatus::Completed);
    assert_eq!(incremental.entities_total, 1);
    assert_eq!(incremental.conflicts, 0);

    // a one-sided local edit is pushed, not reported as a conflict
    assert!(fixture.engine.list_conflicts(None).is_empty());
    let snapshot = fixture.snapshot(&keys[1]).await;
    assert_eq!(snapshot.status, SyncStatus::Synced);
    assert_eq!(snapshot.local_version.to_string(), "2");
    assert_eq!(
        fixture.transport.remote(SERVER, &keys[1]).unwrap().replica.payload,
        agent("revised", &[])
    );
}

#[tokio::test]
async fn pushed_entities_are_not_revisited_by_the_next_incremental_pass() {
    let fixture = SyncTestFixture::new();
    let pushed = agent_key("a1");
    let created = agent_key("a2");
    fixture
        .seed(&pushed, (2, 100, agent("local", &[])), (1, 100, agent("remote", &[])))
        .await;
    fixture.put_local(&created, 1, 100, agent("new", &[]));
    fixture.track(&created).await;

    let full = fixture.run(JobRequest::new(JobType::FullSync, SERVER)).await;
    assert_eq!(full.status, JobStatus::Completed);
    assert_eq!(fixture.transport.push_count(), 2);
    assert_eq!(fixture.transport.remote(SERVER, &pushed).unwrap().replica.timestamp, ts(100));

    let incremental = fixture.run(JobRequest::new(JobType::IncrementalSync, SERVER)).await;
    assert_eq!(incremental.status, JobStatus::Completed);
    assert_eq!(incremental.entities_total, 0);
}

#[tokio::test]
async fn conflict_resolution_job_needs_automatic_policy() {
    let fixture = SyncTestFixture::new();
    let key = agent_key("a1");
    fixture
        .seed(&key, (3, 100, agent("local", &[])), (3, 200, agent("remote", &[])))
        .await;
    fixture.run(JobRequest::new(JobType::FullSync, SERVER)).await;

    let manual = fixture.run(JobRequest::new(JobType::ConflictResolution, SERVER)).await;
    assert_eq!(manual.status, JobStatus::Failed);

    let automatic = fixture
        .run(
            JobRequest::new(JobType::ConflictResolution, SERVER).with_settings(SyncSettings {
                conflict_resolution: ResolutionPolicy::NewestWins,
                ..SyncSettings::default()
            }),
        )
        .await;
    assert_eq!(automatic.status, JobStatus::Completed);
    assert_eq!(automatic.entities_total, 1);
    assert!(fixture.engine.list_conflicts(Some(false)).is_empty());
    assert_eq!(
        fixture.repository.get(&key).unwrap().replica.payload,
        agent("remote", &[])
    );
}

#[tokio::test]
async fn full_sync_backup_can_be_restored() {
    let fixture = SyncTestFixture::new();
    let key = agent_key("a1");
    fixture
        .seed(&key, (1, 100, agent("old", &[])), (2, 200, agent("new", &[])))
        .await;

    let job = fixture.run(JobRequest::new(JobType::FullSync, SERVER)).await;
    assert_eq!(job.status, JobStatus::Completed);
    let backups = fixture.engine.list_backups();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].job_id, Some(job.id));
    assert_eq!(fixture.repository.get(&key).unwrap().replica.payload, agent("new", &[]));

    let restore = fixture.run(JobRequest::new(JobType::Restore, SERVER)).await;
    assert_eq!(restore.status, JobStatus::Completed);
    assert_eq!(restore.backup_id, Some(backups[0].id));

    let local = fixture.repository.get(&key).unwrap();
    assert_eq!(local.replica.payload, agent("old", &[]));
    let snapshot = fixture.snapshot(&key).await;
    assert_eq!(snapshot.status, SyncStatus::RemoteNewer);
}

#[tokio::test]
async fn restore_skips_entities_with_open_conflicts() {
    let fixture = SyncTestFixture::new();
    let key = agent_key("a1");
    fixture
        .seed(&key, (3, 100, agent("local", &[])), (3, 200, agent("remote", &[])))
        .await;

    let backup = fixture.run(JobRequest::new(JobType::Backup, SERVER)).await;
    assert_eq!(backup.status, JobStatus::Completed);
    let backup_id = backup.backup_id.unwrap();
    fixture
        .run(JobRequest::new(JobType::FullSync, SERVER).with_settings(batched(10)))
        .await;
    assert_eq!(fixture.engine.list_conflicts(Some(false)).len(), 1);

    let restore = fixture
        .run(JobRequest::new(JobType::Restore, SERVER).with_backup(backup_id))
        .await;
    assert_eq!(restore.status, JobStatus::Completed);
    assert_eq!(restore.errors.len(), 1);
    assert_eq!(restore.errors[0].error_type, ErrorType::Validation);
    assert_eq!(fixture.snapshot(&key).await.status, SyncStatus::Conflict);

    let missing = fixture
        .engine
        .start_job(JobRequest::new(JobType::Restore, SERVER).with_backup(Uuid::new_v4()))
        .await;
    assert!(matches!(missing, Err(EngineError::BackupNotFound(_))));
}

#[tokio::test]
async fn restore_without_archives_fails() {
    let fixture = SyncTestFixture::new();
    let job = fixture.run(JobRequest::new(JobType::Restore, SERVER)).await;
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn unknown_job_is_reported() {
    let fixture = SyncTestFixture::new();
    assert!(matches!(
        fixture.engine.get_job(Uuid::new_v4()),
        Err(EngineError::JobNotFound(_))
    ));
    assert!(matches!(
        fixture.engine.wait_for_job(Uuid::new_v4()).await,
        Err(EngineError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn auto_sync_driver_starts_full_then_incremental() {
    let fixture = SyncTestFixture::with_settings(batched(10));
    fixture.seed_synced_agents(2).await;
    let driver = AutoSyncDriver::new(fixture.engine.clone(), vec![SERVER.to_string()]);

    assert!(driver.tick().await.unwrap().is_empty());

    fixture
        .engine
        .update_settings(SyncSettings {
            auto_sync: true,
            ..batched(10)
        })
        .unwrap();
    let first = driver.tick().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].job_type, JobType::FullSync);
    assert_eq!(first[0].status, JobStatus::Completed);

    let second = driver.tick().await.unwrap();
    assert_eq!(second[0].job_type, JobType::IncrementalSync);
}

#[tokio::test]
async fn auto_sync_driver_covers_every_connected_server() {
    let settings = SyncSettings {
        auto_sync: true,
        ..batched(10)
    };
    let fixture = SyncTestFixture::with_settings(settings);
    fixture.seed_synced_agents(3).await;
    fixture.connect("secondary");
    let driver = AutoSyncDriver::new(
        fixture.engine.clone(),
        vec![SERVER.to_string(), "secondary".to_string()],
    );

    let jobs = driver.tick().await.unwrap();
    let servers: Vec<&str> = jobs.iter().map(|job| job.server_id.as_str()).collect();
    assert_eq!(servers, vec![SERVER, "secondary"]);
    assert!(jobs.iter().all(|job| job.status == JobStatus::Completed));
    assert!(fixture.engine.last_sync("secondary").is_some());

    // the secondary server had none of the entities; its pass created them
    let key = agent_key("a0");
    assert_eq!(
        fixture.transport.remote("secondary", &key).unwrap().replica.payload,
        agent("plan", &[])
    );
}
