//! Registry of configured remote servers and their liveness

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reachability of a remote server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
    Connecting,
}

/// Opaque credential handed to the transport; never printed
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A configured remote endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConnection {
    pub id: String,
    pub name: String,
    pub url: String,
    pub status: ConnectionStatus,
    pub last_ping: Option<DateTime<Utc>>,
    /// Round-trip latency in milliseconds from the last probe
    pub latency: Option<u64>,
    pub version: String,
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing)]
    pub credential: Option<Credential>,
}

impl ServerConnection {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            status: ConnectionStatus::Connecting,
            last_ping: None,
            latency: None,
            version: String::new(),
            capabilities: BTreeSet::new(),
            credential: None,
        }
    }

    pub fn with_status(mut self, status: ConnectionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn is_usable(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Result of one liveness probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub status: ConnectionStatus,
    pub latency: Option<u64>,
    pub version: Option<String>,
    pub capabilities: Option<BTreeSet<String>>,
    pub at: DateTime<Utc>,
}

impl ProbeReport {
    pub fn connected(latency: u64) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            latency: Some(latency),
            version: None,
            capabilities: None,
            at: Utc::now(),
        }
    }

    pub fn down(status: ConnectionStatus) -> Self {
        Self {
            status,
            latency: None,
            version: None,
            capabilities: None,
            at: Utc::now(),
        }
    }
}

/// External liveness prober
#[async_trait]
pub trait LivenessProber: Send + Sync {
    async fn probe(&self, server: &ServerConnection) -> ProbeReport;
}

/// Prober answering from a fixed table; unknown servers are reported down
#[derive(Debug, Clone, Default)]
pub struct StaticProber {
    reports: Arc<RwLock<HashMap<String, ProbeReport>>>,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, server_id: impl Into<String>, report: ProbeReport) {
        self.reports.write().insert(server_id.into(), report);
    }
}

#[async_trait]
impl LivenessProber for StaticProber {
    async fn probe(&self, server: &ServerConnection) -> ProbeReport {
        self.reports
            .read()
            .get(&server.id)
            .cloned()
            .unwrap_or_else(|| ProbeReport::down(ConnectionStatus::Disconnected))
    }
}

/// Server connections keyed by id
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Arc<RwLock<BTreeMap<String, ServerConnection>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a configured server
    pub fn register(&self, server: ServerConnection) {
        debug!(server_id = %server.id, url = %server.url, "registered server");
        self.servers.write().insert(server.id.clone(), server);
    }

    pub fn list(&self) -> Vec<ServerConnection> {
        self.servers.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<ServerConnection> {
        self.servers.read().get(id).cloned()
    }

    pub fn is_usable(&self, id: &str) -> bool {
        self.servers
            .read()
            .get(id)
            .is_some_and(ServerConnection::is_usable)
    }

    /// Record a probe result; this is the prober's write path
    pub fn apply_probe(&self, id: &str, report: ProbeReport) -> Result<()> {
        let mut servers = self.servers.write();
        let server = servers
            .get_mut(id)
            .ok_or_else(|| EngineError::ServerNotFound(id.to_string()))?;

        if server.status != report.status {
            if report.status == ConnectionStatus::Connected {
                debug!(server_id = id, "server reachable");
            } else {
                warn!(server_id = id, status = ?report.status, "server not reachable");
            }
        }

        server.status = report.status;
        server.latency = report.latency;
        server.last_ping = Some(report.at);
        if let Some(version) = report.version {
            server.version = version;
        }
        if let Some(capabilities) = report.capabilities {
            server.capabilities = capabilities;
        }
        Ok(())
    }

    /// Probe every server once and record the results
    pub async fn refresh_all(&self, prober: &dyn LivenessProber) {
        for server in self.list() {
            let report = prober.probe(&server).await;
            // the server may have been removed concurrently; nothing to update then
            let _ = self.apply_probe(&server.id, report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_usable_only_when_connected() {
        let registry = ServerRegistry::new();
        registry.register(ServerConnection::new("s1", "primary", "https://a").with_status(ConnectionStatus::Connected));
        registry.register(ServerConnection::new("s2", "backup", "https://b"));

        assert!(registry.is_usable("s1"));
        assert!(!registry.is_usable("s2"));
        assert!(!registry.is_usable("missing"));
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_apply_probe_updates_liveness() {
        let registry = ServerRegistry::new();
        registry.register(ServerConnection::new("s1", "primary", "https://a"));

        let mut report = ProbeReport::connected(42);
        report.version = Some("1.2.0".into());
        registry.apply_probe("s1", report).unwrap();

        let server = registry.get("s1").unwrap();
        assert_eq!(server.status, ConnectionStatus::Connected);
        assert_eq!(server.latency, Some(42));
        assert_eq!(server.version, "1.2.0");
        assert!(server.last_ping.is_some());

        assert!(matches!(
            registry.apply_probe("nope", ProbeReport::connected(1)),
            Err(EngineError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_all_with_static_prober() {
        let registry = ServerRegistry::new();
        registry.register(ServerConnection::new("s1", "a", "https://a").with_status(ConnectionStatus::Connected));
        registry.register(ServerConnection::new("s2", "b", "https://b"));

        let prober = StaticProber::new();
        prober.set("s2", ProbeReport::connected(10));
        registry.refresh_all(&prober).await;

        assert!(!registry.is_usable("s1"));
        assert!(registry.is_usable("s2"));
    }

    #[test]
    fn test_credential_is_redacted() {
        let server = ServerConnection::new("s1", "a", "https://a").with_credential(Credential::new("token-123"));
        let debug = format!("{:?}", server);
        assert!(!debug.contains("token-123"));
        let json = serde_json::to_string(&server).unwrap();
        assert!(!json.contains("token-123"));
    }
}
