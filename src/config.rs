//! Daemon and client configuration.

use crate::privilege::Grant;
use crate::protocol::VMGR_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Worker pool bounds.
pub const DEFAULT_WORKERS: usize = 6;
pub const MAX_WORKERS: usize = 100;
/// Idle timeout on an open list cursor.
pub const DEFAULT_LIST_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `0.0.0.0:5013`.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Worker pool size; clamped to [1, 100].
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds an open list cursor may sit idle before the server ends it.
    #[serde(default = "default_list_idle_secs")]
    pub list_idle_timeout_secs: u64,
    /// Optional JSON snapshot the store loads at boot and rewrites on commit.
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
    /// Privilege grants (uid, optional gid, level).
    #[serde(default)]
    pub grants: Vec<Grant>,
}

fn default_bind() -> String {
    format!("0.0.0.0:{VMGR_PORT}")
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_list_idle_secs() -> u64 {
    DEFAULT_LIST_IDLE_TIMEOUT.as_secs()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: DEFAULT_WORKERS,
            list_idle_timeout_secs: default_list_idle_secs(),
            snapshot: None,
            grants: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&raw)?;
        if config.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        config.workers = config.workers.min(MAX_WORKERS);
        // A relative snapshot path is relative to the config file location.
        if let Some(snapshot) = &config.snapshot {
            if snapshot.is_relative() {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                config.snapshot = Some(base.join(snapshot));
            }
        }
        Ok(config)
    }

    pub fn list_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.list_idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Sleep between reconnect attempts on `EVMGRNACT`.
    #[serde(default = "default_retry_secs")]
    pub retry_interval_secs: u64,
    /// `None` retries forever, the historical behaviour.
    #[serde(default)]
    pub max_retries: Option<usize>,
}

fn default_port() -> u16 {
    VMGR_PORT
}

fn default_retry_secs() -> u64 {
    60
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            retry_interval_secs: default_retry_secs(),
            max_retries: None,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn server_config_defaults_fill_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmgrd.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "bind: \"127.0.0.1:0\"").unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.list_idle_timeout(), DEFAULT_LIST_IDLE_TIMEOUT);
        assert!(config.snapshot.is_none());
    }

    #[test]
    fn relative_snapshot_resolves_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmgrd.yaml");
        std::fs::write(&path, "snapshot: state/vmgr.json\n").unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(
            config.snapshot.unwrap(),
            dir.path().join("state/vmgr.json")
        );
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmgrd.yaml");
        std::fs::write(&path, "workers: 0\n").unwrap();
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
