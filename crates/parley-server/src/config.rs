//! Server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use parley_telemetry::LogSettings;
use serde::{Deserialize, Serialize};

/// Environment variable prefix; nested keys use `__` (`PARLEY_RETRY__MAX_ATTEMPTS`).
pub const ENV_PREFIX: &str = "PARLEY_";

/// Bounded retry with exponential backoff for transient storage failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Configuration for the parley server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Outbound frames buffered per connection before it is considered dead.
    pub max_send_queue: usize,
    /// Ping / idle sweep interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close sessions without any client activity for this long.
    pub idle_timeout_secs: u64,
    /// Close connections that have not sent `auth` within this window.
    pub auth_timeout_secs: u64,
    /// Messages per `backlog` frame.
    pub backlog_page_size: u32,
    /// Default `limit` for history requests.
    pub default_page_size: u32,
    /// Upper clamp for history `limit`.
    pub max_page_size: u32,
    /// Max message body length in bytes after trimming.
    pub max_body_len: usize,
    /// Capacity of the dispatcher queue.
    pub dispatch_queue: usize,
    pub retry: RetryPolicy,
    pub log: LogSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            database_path: PathBuf::from("parley.db"),
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            auth_timeout_secs: 10,
            backlog_page_size: 100,
            default_page_size: 50,
            max_page_size: 200,
            max_body_len: 4000,
            dispatch_queue: 1024,
            retry: RetryPolicy::default(),
            log: LogSettings::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config load failed: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Defaults, then the optional JSON file, then `PARLEY_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Json::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        let config: ServerConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_send_queue", self.max_send_queue as u64),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("auth_timeout_secs", self.auth_timeout_secs),
            ("backlog_page_size", u64::from(self.backlog_page_size)),
            ("default_page_size", u64::from(self.default_page_size)),
            ("max_page_size", u64::from(self.max_page_size)),
            ("max_body_len", self.max_body_len as u64),
            ("dispatch_queue", self.dispatch_queue as u64),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.default_page_size > self.max_page_size {
            return Err(ConfigError::Invalid(
                "default_page_size must not exceed max_page_size".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Clamp a requested history limit into `[1, max_page_size]`.
    pub fn page_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.max_body_len, 4000);
        assert_eq!(cfg.default_page_size, 50);
        assert_eq!(cfg.max_page_size, 200);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn page_limit_clamps() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.page_limit(None), 50);
        assert_eq!(cfg.page_limit(Some(0)), 1);
        assert_eq!(cfg.page_limit(Some(10_000)), 200);
        assert_eq!(cfg.page_limit(Some(7)), 7);
    }

    #[test]
    fn retry_delay_backs_off_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.json");
        std::fs::write(
            &path,
            r#"{"port": 4100, "max_body_len": 12, "retry": {"max_attempts": 7}}"#,
        )
        .unwrap();
        let cfg = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.port, 4100);
        assert_eq!(cfg.max_body_len, 12);
        assert_eq!(cfg.retry.max_attempts, 7);
        assert_eq!(cfg.retry.base_delay_ms, 50);
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let cfg = ServerConfig::load(None).unwrap();
        assert_eq!(cfg.backlog_page_size, 100);
    }

    #[test]
    fn zero_values_are_rejected() {
        let cfg = ServerConfig {
            max_send_queue: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn default_page_above_max_is_rejected() {
        let cfg = ServerConfig {
            default_page_size: 500,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserialize_partial_json() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"host":"0.0.0.0"}"#).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.idle_timeout_secs, 90);
    }
}
