//! Server configuration.
//!
//! Resolution order: built-in defaults, then the JSON file named by
//! `DASH_CONFIG` (if set), then individual `DASH_*` environment variables.
//! The result is validated before use.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::DEFAULT_LOG_FILTER;
use crate::retry::BackoffPolicy;
use crate::scheduler::{DEFAULT_POOL_SIZE, DEFAULT_QUEUE_SIZE};
use crate::{Error, Result};

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "DASH_CONFIG";

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_register_retry_limit() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_port_min() -> u16 {
    10000
}

fn default_port_max() -> u16 {
    10999
}

fn default_port_gap() -> u16 {
    port_pool::DEFAULT_PORT_GAP
}

fn default_media_base_path() -> PathBuf {
    PathBuf::from("./media")
}

fn default_segment_window_secs() -> u64 {
    60
}

fn default_segment_cleanup_interval_ms() -> u64 {
    10_000
}

fn default_session_limit_secs() -> u64 {
    3600
}

fn default_dir_limit_secs() -> u64 {
    3600
}

fn default_session_check_interval_ms() -> u64 {
    5_000
}

fn default_log_retention_days() -> i64 {
    7
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

/// Sizes of the schedule units created by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            queue_size: default_queue_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed for camera registration.
    #[serde(default = "default_register_retry_limit")]
    pub register_retry_limit: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            register_retry_limit: default_register_retry_limit(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
        .with_jitter(self.jitter)
    }
}

/// RTP port range handed out to camera sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    #[serde(default = "default_port_gap")]
    pub port_gap: u16,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            port_min: default_port_min(),
            port_max: default_port_max(),
            port_gap: default_port_gap(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Root directory holding one DASH output directory per camera.
    #[serde(default = "default_media_base_path")]
    pub media_base_path: PathBuf,
    /// Segments older than this are deleted.
    #[serde(default = "default_segment_window_secs")]
    pub segment_window_secs: u64,
    #[serde(default = "default_segment_cleanup_interval_ms")]
    pub segment_cleanup_interval_ms: u64,
    /// Sessions older than this are torn down.
    #[serde(default = "default_session_limit_secs")]
    pub session_limit_secs: u64,
    #[serde(default = "default_session_check_interval_ms")]
    pub session_check_interval_ms: u64,
    /// Media directories of no open session are deleted once untouched
    /// for this long.
    #[serde(default = "default_dir_limit_secs")]
    pub dir_limit_secs: u64,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            media_base_path: default_media_base_path(),
            segment_window_secs: default_segment_window_secs(),
            segment_cleanup_interval_ms: default_segment_cleanup_interval_ms(),
            session_limit_secs: default_session_limit_secs(),
            session_check_interval_ms: default_session_check_interval_ms(),
            dir_limit_secs: default_dir_limit_secs(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl CleanupConfig {
    pub fn segment_window(&self) -> Duration {
        Duration::from_secs(self.segment_window_secs)
    }

    pub fn segment_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.segment_cleanup_interval_ms)
    }

    pub fn session_limit(&self) -> Duration {
        Duration::from_secs(self.session_limit_secs)
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_millis(self.session_check_interval_ms)
    }

    pub fn dir_limit(&self) -> Duration {
        Duration::from_secs(self.dir_limit_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            filter: default_log_filter(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub resource: ResourceConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(format!("Invalid value for {}: {} ({})", key, raw, e))),
        None => Ok(None),
    }
}

impl ServerConfig {
    /// Load from the process environment (after `.env`), then validate.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with a custom variable lookup.
    pub fn load_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply `DASH_*` overrides found through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(lookup, "DASH_POOL_SIZE")? {
            self.scheduler.pool_size = v;
        }
        if let Some(v) = parse_var(lookup, "DASH_QUEUE_SIZE")? {
            self.scheduler.queue_size = v;
        }
        if let Some(v) = parse_var(lookup, "DASH_REGISTER_RETRY_LIMIT")? {
            self.retry.register_retry_limit = v;
        }
        if let Some(v) = parse_var(lookup, "DASH_BASE_BACKOFF_MS")? {
            self.retry.base_backoff_ms = v;
        }
        if let Some(v) = parse_var(lookup, "DASH_MAX_BACKOFF_MS")? {
            self.retry.max_backoff_ms = v;
        }
        if let Some(v) = parse_var(lookup, "DASH_PORT_MIN")? {
            self.resource.port_min = v;
        }
        if let Some(v) = parse_var(lookup, "DASH_PORT_MAX")? {
            self.resource.port_max = v;
        }
        if let Some(v) = parse_var(lookup, "DASH_PORT_GAP")? {
            self.resource.port_gap = v;
        }
        if let Some(v) = lookup("DASH_MEDIA_BASE_PATH") {
            self.cleanup.media_base_path = PathBuf::from(v);
        }
        if let Some(v) = parse_var(lookup, "DASH_SEGMENT_WINDOW_SECS")? {
            self.cleanup.segment_window_secs = v;
        }
        if let Some(v) = parse_var(lookup, "DASH_SESSION_LIMIT_SECS")? {
            self.cleanup.session_limit_secs = v;
        }
        if let Some(v) = parse_var(lookup, "DASH_DIR_LIMIT_SECS")? {
            self.cleanup.dir_limit_secs = v;
        }
        if let Some(v) = lookup("DASH_LOG_DIR") {
            self.log.dir = v;
        }
        if let Some(v) = lookup("DASH_LOG_FILTER") {
            self.log.filter = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let resource = &self.resource;
        if resource.port_min == 0 {
            return Err(Error::config("port_min must be greater than zero"));
        }
        if resource.port_min > resource.port_max {
            return Err(Error::config(format!(
                "port_min {} is greater than port_max {}",
                resource.port_min, resource.port_max
            )));
        }
        if resource.port_gap == 0 {
            return Err(Error::config("port_gap must be greater than zero"));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::config(format!(
                "base_backoff_ms {} exceeds max_backoff_ms {}",
                self.retry.base_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.cleanup.segment_cleanup_interval_ms == 0
            || self.cleanup.session_check_interval_ms == 0
        {
            return Err(Error::config("cleanup intervals must be greater than zero"));
        }
        if self.log.dir.trim().is_empty() {
            return Err(Error::config("log dir must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.pool_size, 5);
        assert_eq!(config.resource.port_gap, 2);
        assert_eq!(config.retry.register_retry_limit, 3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"resource": {"port_min": 20000, "port_max": 20100}}"#)
                .unwrap();
        assert_eq!(config.resource.port_min, 20000);
        assert_eq!(config.resource.port_gap, 2);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dash.json");
        std::fs::write(&path, r#"{"scheduler": {"pool_size": 2}}"#).unwrap();
        let path_str = path.to_string_lossy().to_string();

        let config = ServerConfig::load_with(lookup_from(&[
            (CONFIG_PATH_ENV, path_str.as_str()),
            ("DASH_QUEUE_SIZE", "64"),
            ("DASH_DIR_LIMIT_SECS", "120"),
            ("DASH_LOG_FILTER", "dash_server=debug"),
        ]))
        .unwrap();

        assert_eq!(config.scheduler.pool_size, 2);
        assert_eq!(config.scheduler.queue_size, 64);
        assert_eq!(config.cleanup.dir_limit(), Duration::from_secs(120));
        assert_eq!(config.log.filter, "dash_server=debug");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let err = ServerConfig::load_with(lookup_from(&[("DASH_PORT_MIN", "abc")])).unwrap_err();
        assert!(err.to_string().contains("DASH_PORT_MIN"));
    }

    #[test]
    fn test_validation_rejects_inverted_range() {
        let err = ServerConfig::load_with(lookup_from(&[
            ("DASH_PORT_MIN", "30000"),
            ("DASH_PORT_MAX", "20000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_backoff_policy_from_config() {
        let retry = RetryConfig {
            base_backoff_ms: 10,
            max_backoff_ms: 50,
            ..RetryConfig::default()
        };
        let policy = retry.backoff_policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(9), Duration::from_millis(50));
    }
}
