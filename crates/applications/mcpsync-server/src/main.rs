//! Sync daemon: loads configuration, seeds the in-memory stores, runs a
//! full pass per server and then keeps auto sync going until ctrl-c.

mod fixture;

use anyhow::Context;
use fixture::Seed;
use mcpsync_engine::{
    load_config, AutoSyncDriver, ConnectionStatus, JobRequest, JobType, MemoryRepository,
    MemoryTransport, SyncEngine, SyncEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("MCPSYNC_LOG_FORMAT").as_deref() == Ok("json") {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

/// Mirror engine events into the log
fn spawn_event_logger(engine: &SyncEngine) {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::JobFinished {
                    job_id,
                    status,
                    conflicts,
                    errors,
                    failure_reason,
                    ..
                }) => {
                    info!(%job_id, ?status, conflicts, errors, ?failure_reason, "job finished");
                }
                Ok(SyncEvent::ConflictDetected {
                    conflict_id,
                    entity_id,
                    conflict_type,
                    fields,
                    ..
                }) => {
                    warn!(%conflict_id, %entity_id, ?conflict_type, ?fields, "conflict needs attention");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    info!("Starting MCP sync server");

    let config_path = std::env::var_os("MCPSYNC_CONFIG").map(PathBuf::from);
    let config = load_config(config_path.as_deref()).context("loading configuration")?;

    let repository = Arc::new(MemoryRepository::new());
    let transport = Arc::new(MemoryTransport::new());
    let engine = SyncEngine::builder(transport.clone(), repository.clone())
        .config(config.engine.clone())
        .settings(config.sync.clone())
        .build()
        .context("building sync engine")?;
    spawn_event_logger(&engine);

    let mut server_ids = Vec::with_capacity(config.servers.len());
    for entry in config.servers {
        server_ids.push(entry.id.clone());
        engine
            .registry()
            .register(entry.into_connection().with_status(ConnectionStatus::Connected));
    }
    info!(servers = server_ids.len(), "servers registered");

    if let Some(path) = std::env::var_os("MCPSYNC_FIXTURE").map(PathBuf::from) {
        let seeded = Seed::load(&path)?
            .apply(&engine, &repository, &transport)
            .await?;
        info!(entities = seeded, path = %path.display(), "seed loaded");
    }

    for server_id in &server_ids {
        let job = engine
            .start_job(JobRequest::new(JobType::FullSync, server_id.clone()))
            .await?;
        let job = engine.wait_for_job(job.id).await?;
        info!(
            server = %server_id,
            status = ?job.status,
            processed = job.entities_processed,
            conflicts = job.conflicts,
            errors = job.errors.len(),
            "initial sync done"
        );
    }

    let driver = AutoSyncDriver::new(engine.clone(), server_ids);
    driver
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await;

    info!("MCP sync server shutdown gracefully");
    Ok(())
}
