// Engine configuration file: `~/.loam/config.toml`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::retry::RetryPolicy;
use crate::scheduler::Schedule;

/// Root directory for Loam state: `~/.loam/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".loam"))
}

/// Path to the config file: `~/.loam/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Account the outbox submits to.
    pub account_id: Option<String>,
    /// Acting user for local writes.
    pub user_id: Option<String>,
    /// Central service base URL (e.g. `https://api.loam.dev`).
    pub server_url: Option<String>,
    /// Bearer token for the central service.
    pub token: Option<String>,
    /// Local database file. Defaults to `~/.loam/loam.db`.
    pub database_path: Option<PathBuf>,
    pub outbox: OutboxConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            user_id: None,
            server_url: None,
            token: None,
            database_path: None,
            outbox: OutboxConfig::default(),
            sync: SyncConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `~/.loam/config.toml`, falling back to defaults when the
    /// file is missing.
    pub fn load() -> Result<Self, ConfigError> {
        match global_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => global_dir().map(|dir| dir.join("loam.db")).ok_or(ConfigError::NoHomeDir),
        }
    }

    /// Check that everything the daemon needs to talk to the server is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("account_id", &self.account_id),
            ("user_id", &self.user_id),
            ("server_url", &self.server_url),
            ("token", &self.token),
        ] {
            if value.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::Missing(name));
            }
        }
        if let Some(url) = &self.server_url {
            validate_server_url(url)?;
        }
        if self.outbox.batch_size == 0 || self.sync.page_size == 0 {
            return Err(ConfigError::Invalid("batch_size and page_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutboxConfig {
    /// Mutations per submitted batch.
    pub batch_size: u32,
    /// Transport failures before a mutation is marked failed.
    pub max_retries: u32,
    pub interval_secs: u64,
    pub debounce_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { batch_size: 50, max_retries: 10, interval_secs: 60, debounce_ms: 100 }
    }
}

impl OutboxConfig {
    pub fn schedule(&self) -> Schedule {
        Schedule {
            interval: Duration::from_secs(self.interval_secs),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Items requested per pull.
    pub page_size: u32,
    pub interval_secs: u64,
    pub debounce_ms: u64,
    /// Roots to pull. Empty means every root present locally.
    pub roots: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { page_size: 100, interval_secs: 60, debounce_ms: 100, roots: Vec::new() }
    }
}

impl SyncConfig {
    pub fn schedule(&self) -> Schedule {
        Schedule {
            interval: Duration::from_secs(self.interval_secs),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_backoff_ms: policy.base_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// https is required; plain http is allowed only for loopback testing.
pub fn validate_server_url(value: &str) -> Result<(), ConfigError> {
    let parsed =
        Url::parse(value).map_err(|error| ConfigError::InvalidUrl(format!("invalid server_url `{value}`: {error}")))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(ConfigError::InvalidUrl(
            "server_url must use https (http is allowed only for localhost testing)".into(),
        )),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(std::io::Error),
    #[error("config parse error: {0}")]
    Parse(toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(toml::ser::Error),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("{0}")]
    InvalidUrl(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("could not determine home directory")]
    NoHomeDir,
}
