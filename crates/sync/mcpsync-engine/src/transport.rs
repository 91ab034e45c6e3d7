//! Entity payload transport boundary
//!
//! The engine never speaks a wire protocol itself. Implementations of
//! [`EntityTransport`] move entity replicas to and from one server; the
//! in-memory [`MemoryTransport`] backs tests and fixture-driven runs.

use crate::error::TransportError;
use crate::registry::ServerConnection;
use crate::types::{EntityPayload, Replica, SnapshotKey};
use crate::version::Version;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Remote view of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub entity_name: String,
    pub replica: Replica,
}

/// A write of a local payload to a remote server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub entity_name: String,
    pub payload: EntityPayload,
    /// Remote version the payload was based on; `None` creates the entity
    pub expected_remote_version: Option<Version>,
    /// Version the caller wants the remote to carry after the write
    pub proposed_version: Version,
    /// When the payload was written on the pushing side
    pub timestamp: DateTime<Utc>,
}

/// Moves entity replicas between the engine and remote servers
#[async_trait]
pub trait EntityTransport: Send + Sync {
    /// Fetch the remote replica; `Ok(None)` if the server does not know the entity
    async fn fetch_remote(
        &self,
        server: &ServerConnection,
        key: &SnapshotKey,
    ) -> Result<Option<RemoteEntity>, TransportError>;

    /// Write a payload, returning the new remote version.
    ///
    /// Fails with [`TransportError::RemoteChanged`] when the remote is no
    /// longer at `expected_remote_version`.
    async fn push_local(
        &self,
        server: &ServerConnection,
        key: &SnapshotKey,
        request: PushRequest,
    ) -> Result<Version, TransportError>;
}

type ServerKey = (String, SnapshotKey);

/// In-memory transport with scriptable failures and latency
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    entities: Arc<DashMap<ServerKey, RemoteEntity>>,
    fetch_failures: Arc<DashMap<ServerKey, VecDeque<TransportError>>>,
    push_failures: Arc<DashMap<ServerKey, VecDeque<TransportError>>>,
    fetch_calls: Arc<DashMap<ServerKey, u64>>,
    push_count: Arc<AtomicU64>,
    latency: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed or overwrite the remote replica of an entity
    pub fn put_remote(&self, server_id: &str, key: SnapshotKey, entity: RemoteEntity) {
        self.entities.insert((server_id.to_string(), key), entity);
    }

    pub fn remote(&self, server_id: &str, key: &SnapshotKey) -> Option<RemoteEntity> {
        self.entities
            .get(&(server_id.to_string(), key.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Queue failures returned by the next fetches of `key`, in order
    pub fn fail_fetches(&self, server_id: &str, key: SnapshotKey, errors: impl IntoIterator<Item = TransportError>) {
        self.fetch_failures
            .entry((server_id.to_string(), key))
            .or_default()
            .extend(errors);
    }

    /// Queue failures returned by the next pushes of `key`, in order
    pub fn fail_pushes(&self, server_id: &str, key: SnapshotKey, errors: impl IntoIterator<Item = TransportError>) {
        self.push_failures
            .entry((server_id.to_string(), key))
            .or_default()
            .extend(errors);
    }

    /// Number of fetch attempts made for `key`
    pub fn fetch_calls(&self, server_id: &str, key: &SnapshotKey) -> u64 {
        self.fetch_calls
            .get(&(server_id.to_string(), key.clone()))
            .map_or(0, |count| *count)
    }

    pub fn push_count(&self) -> u64 {
        self.push_count.load(Ordering::Relaxed)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn next_failure(queue: &DashMap<ServerKey, VecDeque<TransportError>>, key: &ServerKey) -> Option<TransportError> {
        queue.get_mut(key).and_then(|mut errors| errors.pop_front())
    }
}

#[async_trait]
impl EntityTransport for MemoryTransport {
    async fn fetch_remote(
        &self,
        server: &ServerConnection,
        key: &SnapshotKey,
    ) -> Result<Option<RemoteEntity>, TransportError> {
        let server_key = (server.id.clone(), key.clone());
        *self.fetch_calls.entry(server_key.clone()).or_insert(0) += 1;
        self.simulate_latency().await;

        if let Some(err) = Self::next_failure(&self.fetch_failures, &server_key) {
            return Err(err);
        }
        Ok(self.entities.get(&server_key).map(|entry| entry.value().clone()))
    }

    async fn push_local(
        &self,
        server: &ServerConnection,
        key: &SnapshotKey,
        request: PushRequest,
    ) -> Result<Version, TransportError> {
        let server_key = (server.id.clone(), key.clone());
        self.simulate_latency().await;

        if let Some(err) = Self::next_failure(&self.push_failures, &server_key) {
            return Err(err);
        }

        let entry = self.entities.entry(server_key);
        let current = match &entry {
            Entry::Occupied(existing) => Some(existing.get().replica.version.clone()),
            Entry::Vacant(_) => None,
        };

        if current != request.expected_remote_version {
            return Err(TransportError::RemoteChanged {
                expected: request
                    .expected_remote_version
                    .map_or_else(|| "none".to_string(), |v| v.to_string()),
                actual: current.map_or_else(|| "none".to_string(), |v| v.to_string()),
            });
        }

        let version = match current {
            Some(current) if request.proposed_version <= current => current.next(),
            _ => request.proposed_version,
        };

        let stored = RemoteEntity {
            entity_name: request.entity_name,
            replica: Replica {
                version: version.clone(),
                timestamp: request.timestamp,
                payload: request.payload,
            },
        };
        entry.insert(stored);

        self.push_count.fetch_add(1, Ordering::Relaxed);
        Ok(version)
    }
}
