//! Periodic cleanup jobs for media sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::manager::SessionManager;
use super::registry::CameraRegistry;
use crate::scheduler::{JobResult, JobTask, ScheduleManager};

/// Deletes DASH segments older than a sliding window from one output
/// directory. Initialization segments and manifests are kept.
#[derive(Debug, Clone)]
pub struct SegmentCleanupTask {
    dash_path: PathBuf,
    window: Duration,
}

impl SegmentCleanupTask {
    pub fn new(dash_path: impl Into<PathBuf>, window: Duration) -> Self {
        Self {
            dash_path: dash_path.into(),
            window,
        }
    }

    pub fn dash_path(&self) -> &Path {
        &self.dash_path
    }

    fn is_protected(path: &Path) -> bool {
        let is_manifest = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mpd"));
        let is_init = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains("init"));
        is_manifest || is_init
    }

    /// Delete stale segments. Returns the number of deleted files.
    pub async fn sweep(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dash_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("DASH directory {} not created yet", self.dash_path.display());
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut deleted = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if !metadata.is_file() || Self::is_protected(&path) {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < self.window {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete segment"),
            }
        }

        if deleted > 0 {
            debug!(
                "Deleted {} old segments from {}",
                deleted,
                self.dash_path.display()
            );
        }
        Ok(deleted)
    }
}

#[async_trait]
impl JobTask for SegmentCleanupTask {
    async fn run(&self) -> JobResult {
        self.sweep().await?;
        Ok(())
    }
}

/// Tears down sessions that have outlived their limit, together with the
/// camera's schedule unit, and deletes stale media directories that belong to
/// no open session.
#[derive(Debug, Clone)]
pub struct LongSessionRemover {
    sessions: Arc<SessionManager>,
    schedule_manager: Arc<ScheduleManager>,
    session_limit: Duration,
    media_dir: Option<(PathBuf, Duration)>,
}

impl LongSessionRemover {
    pub fn new(
        sessions: Arc<SessionManager>,
        schedule_manager: Arc<ScheduleManager>,
        session_limit: Duration,
    ) -> Self {
        Self {
            sessions,
            schedule_manager,
            session_limit,
            media_dir: None,
        }
    }

    /// Also delete directories under `media_base_path` untouched for
    /// `dir_limit`.
    pub fn with_media_dir(
        mut self,
        media_base_path: impl Into<PathBuf>,
        dir_limit: Duration,
    ) -> Self {
        self.media_dir = Some((media_base_path.into(), dir_limit));
        self
    }

    /// Close expired sessions and stop their camera units. Returns the
    /// closed camera ids.
    pub async fn sweep(&self) -> Vec<String> {
        let expired = self.sessions.expired(Utc::now(), self.session_limit);
        let mut closed = Vec::with_capacity(expired.len());

        for camera_id in expired {
            self.schedule_manager
                .stop_all(&CameraRegistry::unit_key(&camera_id))
                .await;
            if self.sessions.close(&camera_id).is_some() {
                closed.push(camera_id);
            }
        }

        if !closed.is_empty() {
            info!("Removed {} long sessions: {:?}", closed.len(), closed);
        }
        closed
    }

    /// Delete stale media directories. Returns the number of deleted
    /// directories.
    pub async fn sweep_media_dirs(&self) -> std::io::Result<usize> {
        let Some((base, dir_limit)) = &self.media_dir else {
            return Ok(0);
        };
        let mut entries = match tokio::fs::read_dir(base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut deleted = 0;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if name.to_str().is_some_and(|name| self.sessions.contains(name)) {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < *dir_limit {
                continue;
            }

            let path = entry.path();
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    warn!(
                        path = %path.display(),
                        age_secs = age.as_secs(),
                        "Deleted stale media directory"
                    );
                    deleted += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete media directory")
                }
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl JobTask for LongSessionRemover {
    async fn run(&self) -> JobResult {
        self.sweep().await;
        self.sweep_media_dirs().await?;
        Ok(())
    }
}
