//! Coordinator configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::protocol::DEFAULT_MAX_PAYLOAD;
use crate::bridge::transport::WELL_KNOWN_CHANNEL;
use crate::registry::DEFAULT_CAPACITY;

pub const ENV_RUNTIME_DIR: &str = "PROCWATCH_RUNTIME_DIR";
pub const ENV_CAPACITY: &str = "PROCWATCH_CAPACITY";
pub const ENV_RETENTION_SECS: &str = "PROCWATCH_RETENTION_SECS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory holding the well-known channel and per-worker channels.
    pub runtime_dir: PathBuf,
    /// File name of the well-known channel inside `runtime_dir`.
    pub channel_name: String,
    /// Fixed registry capacity.
    pub capacity: usize,
    pub max_payload: usize,
    /// How long a freshly bound worker channel waits for its client.
    pub worker_connect_timeout: Duration,
    /// Finished entries older than this are dropped. `None` keeps everything.
    pub retention: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            channel_name: WELL_KNOWN_CHANNEL.to_string(),
            capacity: DEFAULT_CAPACITY,
            max_payload: DEFAULT_MAX_PAYLOAD,
            worker_connect_timeout: Duration::from_secs(30),
            retention: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `PROCWATCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_RUNTIME_DIR).filter(|v| !v.is_empty()) {
            config.runtime_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_CAPACITY) {
            config.capacity = parse_number(ENV_CAPACITY, &value)? as usize;
        }
        if let Some(value) = lookup(ENV_RETENTION_SECS) {
            let secs = parse_number(ENV_RETENTION_SECS, &value)?;
            config.retention = (secs > 0).then(|| Duration::from_secs(secs));
        }

        Ok(config)
    }

    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_worker_connect_timeout(mut self, timeout: Duration) -> Self {
        self.worker_connect_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    pub fn channel_path(&self) -> PathBuf {
        self.runtime_dir.join(&self.channel_name)
    }
}

pub fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir().join("procwatch")
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.channel_name, "monitor.sock");
        assert_eq!(config.retention, None);
        assert!(config.channel_path().ends_with("procwatch/monitor.sock"));
    }

    #[test]
    fn env_overrides() {
        let config = CoordinatorConfig::from_lookup(lookup(&[
            (ENV_RUNTIME_DIR, "/run/pw"),
            (ENV_CAPACITY, "16"),
            (ENV_RETENTION_SECS, "600"),
        ]))
        .unwrap();

        assert_eq!(config.channel_path(), PathBuf::from("/run/pw/monitor.sock"));
        assert_eq!(config.capacity, 16);
        assert_eq!(config.retention, Some(Duration::from_secs(600)));
    }

    #[test]
    fn zero_retention_disables_expiry() {
        let config =
            CoordinatorConfig::from_lookup(lookup(&[(ENV_RETENTION_SECS, "0")])).unwrap();
        assert_eq!(config.retention, None);
    }

    #[test]
    fn invalid_capacity_is_reported() {
        let err = CoordinatorConfig::from_lookup(lookup(&[(ENV_CAPACITY, "lots")])).unwrap_err();
        assert!(err.to_string().contains(ENV_CAPACITY));
    }

    #[test]
    fn builder_pattern() {
        let config = CoordinatorConfig::new("/tmp/x")
            .with_channel_name("queue.sock")
            .with_capacity(3)
            .with_max_payload(512)
            .with_worker_connect_timeout(Duration::from_millis(250))
            .with_retention(Some(Duration::from_secs(5)));

        assert_eq!(config.channel_path(), PathBuf::from("/tmp/x/queue.sock"));
        assert_eq!(config.capacity, 3);
        assert_eq!(config.max_payload, 512);
        assert_eq!(config.worker_connect_timeout, Duration::from_millis(250));
        assert_eq!(config.retention, Some(Duration::from_secs(5)));
    }
}
