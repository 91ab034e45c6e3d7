//! Periodic sync passes driven by the `auto_sync` setting

use crate::engine::SyncEngine;
use crate::error::{EngineError, Result};
use crate::job::{JobRequest, JobType, SyncJob};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runs one pass per server every `sync_interval` minutes.
///
/// The first pass against a server is a full sync, later ones are
/// incremental. Settings are re-read before every tick.
#[derive(Debug, Clone)]
pub struct AutoSyncDriver {
    engine: SyncEngine,
    server_ids: Vec<String>,
}

impl AutoSyncDriver {
    pub fn new(engine: SyncEngine, server_ids: Vec<String>) -> Self {
        Self { engine, server_ids }
    }

    /// Run the passes due now and return the finished jobs.
    ///
    /// Passes run one server at a time: every pass claims the same tracked
    /// entities, so a second server can only start once the first is done.
    /// Disconnected servers and servers whose entities are held by another
    /// job are skipped.
    pub async fn tick(&self) -> Result<Vec<SyncJob>> {
        let settings = self.engine.settings();
        if !settings.auto_sync {
            debug!("auto sync disabled");
            return Ok(Vec::new());
        }

        let mut finished = Vec::new();
        for server_id in &self.server_ids {
            if !self.engine.registry().is_usable(server_id) {
                debug!(server = %server_id, "server not connected, pass skipped");
                continue;
            }
            let job_type = match self.engine.last_sync(server_id) {
                Some(_) => JobType::IncrementalSync,
                None => JobType::FullSync,
            };
            let job = match self.engine.start_job(JobRequest::new(job_type, server_id.clone())).await {
                Ok(job) => job,
                Err(EngineError::AlreadyRunning { job_id, .. }) => {
                    debug!(server = %server_id, %job_id, "entities busy, pass skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let job = self.engine.wait_for_job(job.id).await?;
            debug!(server = %server_id, status = ?job.status, "auto sync pass done");
            finished.push(job);
        }
        Ok(finished)
    }

    /// Tick until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(servers = self.server_ids.len(), "auto sync started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                ticked = self.tick() => {
                    if let Err(e) = ticked {
                        warn!(error = %e, "auto sync tick failed");
                    }
                }
            }

            let interval = Duration::from_secs(self.engine.settings().sync_interval.max(1) * 60);
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("auto sync stopped");
    }
}
