use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Delay between registration and the first staleness scan (5 s).
pub const DEFAULT_SCAN_DELAY_MS: u64 = 5_000;

/// Heartbeat age after which a session is presumed dead (10 s).
pub const DEFAULT_MAX_AGE_MS: u64 = 10_000;

/// Period of the background heartbeat. Must stay well below the max age.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 3_000;

/// How often the file-backed broadcast polls its signal file.
pub const DEFAULT_SIGNAL_POLL_MS: u64 = 500;

/// Base name shared by the registry database, session stores, and signal file.
pub const DEFAULT_STORE_NAME: &str = "archive-io";

/// Content label used when a sink is not given one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// How long SQLite waits on a lock held by a sibling context.
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Configuration for the session registry and its durable storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding the registry database and per-session stores.
    pub storage_dir: PathBuf,
    /// Base name of every file the registry creates.
    pub name: String,
    pub scan_delay_ms: u64,
    pub max_age_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub signal_poll_ms: u64,
}

impl RegistryConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    pub fn scan_delay(&self) -> Duration {
        Duration::from_millis(self.scan_delay_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn signal_poll(&self) -> Duration {
        Duration::from_millis(self.signal_poll_ms)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.storage_dir.join(format!("{}.db", self.name))
    }

    pub fn signal_path(&self) -> PathBuf {
        self.storage_dir.join(format!("{}.signal", self.name))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            storage_dir: std::env::temp_dir().join(DEFAULT_STORE_NAME),
            name: DEFAULT_STORE_NAME.to_string(),
            scan_delay_ms: DEFAULT_SCAN_DELAY_MS,
            max_age_ms: DEFAULT_MAX_AGE_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            signal_poll_ms: DEFAULT_SIGNAL_POLL_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{"storage_dir": "/tmp/x", "max_age_ms": 2000}"#).unwrap();
        assert_eq!(config.max_age(), Duration::from_secs(2));
        assert_eq!(config.scan_delay(), Duration::from_secs(5));
        assert_eq!(config.name, DEFAULT_STORE_NAME);
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/tmp/x").join("archive-io.db")
        );
    }
}
