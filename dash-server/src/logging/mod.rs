//! Logging setup with a reloadable filter and daily log files.
//!
//! This module provides:
//! - Runtime log level changes via `tracing_subscriber::reload`
//! - Daily rolling log files under the configured directory
//! - A retention job deleting log files past the retention window
//! - Local timezone timestamps

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, Utc};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::config::LogConfig;
use crate::scheduler::{JobResult, JobTask};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "dash_server=info,port_pool=info";

/// Prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "dash-server.log";

/// Formats timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive, e.g. `"dash_server=debug"`.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::Other(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| crate::Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Delete rolled log files (`dash-server.log.YYYY-MM-DD`) older than
/// `retention_days`. Returns the number of deleted files.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff_ts = (Utc::now() - chrono::Duration::days(retention_days)).timestamp();
    let prefix = format!("{LOG_FILE_PREFIX}.");

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(prefix.as_str()))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };
        let file_ts = file_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);

        if file_ts < cutoff_ts {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete old log file");
            } else {
                deleted_count += 1;
                debug!(path = %path.display(), "Deleted old log file");
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Periodic job running [`cleanup_old_logs`].
#[derive(Debug, Clone)]
pub struct LogRetentionTask {
    log_dir: PathBuf,
    retention_days: i64,
}

impl LogRetentionTask {
    pub fn new(log_dir: impl Into<PathBuf>, retention_days: i64) -> Self {
        Self {
            log_dir: log_dir.into(),
            retention_days,
        }
    }
}

#[async_trait]
impl JobTask for LogRetentionTask {
    async fn run(&self) -> JobResult {
        cleanup_old_logs(&self.log_dir, self.retention_days).await?;
        Ok(())
    }
}

/// Install the global subscriber: console plus a daily rolling file.
///
/// Keep the returned guard alive for the lifetime of the process.
pub fn init_logging(config: &LogConfig) -> crate::Result<(Arc<LoggingConfig>, WorkerGuard)> {
    let log_path = PathBuf::from(&config.dir);
    std::fs::create_dir_all(&log_path)?;

    let file_appender = tracing_appender::rolling::daily(&log_path, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| crate::Error::config(format!("Invalid log filter: {}", e)))?,
    };
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    let logging = Arc::new(LoggingConfig {
        handle: filter_handle,
        log_dir: log_path,
    });

    Ok((logging, guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("dash_server=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_old_logs() {
        let dir = TempDir::new().unwrap();
        let old = format!("{LOG_FILE_PREFIX}.2000-01-01");
        let today = format!("{LOG_FILE_PREFIX}.{}", Utc::now().format("%Y-%m-%d"));
        for name in [old.as_str(), today.as_str(), "unrelated.log.2000-01-01"] {
            std::fs::write(dir.path().join(name), b"log").unwrap();
        }

        let deleted = cleanup_old_logs(dir.path(), 7).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(!dir.path().join(&old).exists());
        assert!(dir.path().join(&today).exists());
        assert!(dir.path().join("unrelated.log.2000-01-01").exists());
    }

    #[tokio::test]
    async fn test_retention_task_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let task = LogRetentionTask::new(dir.path().join("missing"), 7);
        assert!(task.run().await.is_err());
    }
}
