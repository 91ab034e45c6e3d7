//! Engine configuration
//!
//! Values come from an optional TOML file overlaid with `MCPSYNC_`
//! environment variables (nested keys use `__`, e.g.
//! `MCPSYNC_SYNC__BATCH_SIZE=10`).

use crate::error::{EngineError, Result};
use crate::registry::{Credential, ServerConnection};
use crate::retry::BackoffConfig;
use crate::settings::SyncSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime tuning of the engine itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Entities processed in parallel inside one batch
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Bound on a single remote call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Pause between batches
    #[serde(default)]
    pub batch_delay_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// JSONL event trail
    #[serde(default)]
    pub event_log_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            request_timeout_ms: default_request_timeout_ms(),
            backoff: BackoffConfig::default(),
            batch_delay_ms: 0,
            event_capacity: default_event_capacity(),
            event_log_path: None,
        }
    }
}

impl EngineConfig {
    /// Create configuration from flat environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("MCPSYNC_MAX_CONCURRENCY") {
            config.max_concurrency = n;
        }
        if let Some(ms) = env_parse::<u64>("MCPSYNC_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("MCPSYNC_BATCH_DELAY_MS") {
            config.batch_delay_ms = ms;
        }
        if let Ok(path) = std::env::var("MCPSYNC_EVENT_LOG") {
            config.event_log_path = Some(PathBuf::from(path));
        }

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn batch_delay(&self) -> Option<Duration> {
        (self.batch_delay_ms > 0).then(|| Duration::from_millis(self.batch_delay_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config("max_concurrency must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(EngineError::Config("request_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// A remote server declared in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Name of the environment variable holding the credential
    #[serde(default)]
    pub credential_env: Option<String>,
}

impl ServerEntry {
    pub fn into_connection(self) -> ServerConnection {
        let credential = self
            .credential_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .map(Credential::new);

        let mut server = ServerConnection::new(self.id, self.name, self.url).with_capabilities(self.capabilities);
        server.credential = credential;
        server
    }
}

/// Everything a deployment configures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.sync.validate()
    }
}

/// Load configuration from `path` (if any) and the environment
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("MCPSYNC")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let app: AppConfig = builder.build()?.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn default_max_concurrency() -> usize {
    4
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_event_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ResolutionPolicy;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert!(config.batch_delay().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[engine]
max_concurrency = 2
request_timeout_ms = 500

[sync]
batch_size = 10
conflict_resolution = "newest_wins"

[[servers]]
id = "primary"
name = "Primary"
url = "https://mcp.example.test"
capabilities = ["agents", "documents"]
"#
        )
        .unwrap();

        let app = load_config(Some(file.path())).unwrap();
        assert_eq!(app.engine.max_concurrency, 2);
        assert_eq!(app.sync.batch_size, 10);
        assert_eq!(app.sync.conflict_resolution, ResolutionPolicy::NewestWins);
        // unspecified values keep their defaults
        assert_eq!(app.sync.retry_attempts, 3);

        let server = app.servers[0].clone().into_connection();
        assert_eq!(server.id, "primary");
        assert!(server.capabilities.contains("agents"));
        assert!(!server.is_usable());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[sync]\nbatch_size = 0").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }
}
