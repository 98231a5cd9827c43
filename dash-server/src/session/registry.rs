//! Camera registration workflow.
//!
//! Registering a camera opens its session, creates the camera's schedule
//! unit and drives the registration call through the retry manager. On
//! success the unit also hosts the segment cleanup job for the camera's DASH
//! directory. Unregistering tears all of it down again.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use super::cleanup::SegmentCleanupTask;
use super::manager::{SessionManager, StreamSession};
use crate::config::{CleanupConfig, SchedulerConfig};
use crate::retry::{RetryError, RetryManager, RetryStatus, RetryableOperation};
use crate::scheduler::{Job, JobResult, ScheduleManager};
use crate::{Error, Result};

/// Name of the per-camera segment cleanup job.
pub const SEGMENT_CLEANUP_JOB: &str = "segment-cleanup";

/// Transport to the media gateway that cameras are registered with.
#[async_trait]
pub trait RegistrationClient: Send + Sync {
    async fn register(&self, session: &StreamSession) -> JobResult;
    async fn unregister(&self, session: &StreamSession) -> JobResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraStatus {
    Registering,
    Registered,
    /// Registered, but the session was torn down for outliving its limit.
    Expired,
    Unreachable,
    Unregistering,
    Unregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationKind {
    Register,
    Unregister,
}

struct RegistrationOperation {
    name: String,
    kind: RegistrationKind,
    session: StreamSession,
    client: Arc<dyn RegistrationClient>,
}

#[async_trait]
impl RetryableOperation for RegistrationOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, attempt: u32) -> JobResult {
        info!(
            "[{}] attempt {} for session {}",
            self.name, attempt, self.session.id
        );
        match self.kind {
            RegistrationKind::Register => self.client.register(&self.session).await,
            RegistrationKind::Unregister => self.client.unregister(&self.session).await,
        }
    }
}

/// Registers cameras and owns their per-camera schedule units.
pub struct CameraRegistry {
    sessions: Arc<SessionManager>,
    schedule_manager: Arc<ScheduleManager>,
    retry_manager: Arc<RetryManager>,
    client: Arc<dyn RegistrationClient>,
    scheduler_config: SchedulerConfig,
    cleanup_config: CleanupConfig,
    retry_limit: u32,
    statuses: DashMap<String, CameraStatus>,
}

impl CameraRegistry {
    pub fn new(
        sessions: Arc<SessionManager>,
        schedule_manager: Arc<ScheduleManager>,
        retry_manager: Arc<RetryManager>,
        client: Arc<dyn RegistrationClient>,
        scheduler_config: SchedulerConfig,
        cleanup_config: CleanupConfig,
        retry_limit: u32,
    ) -> Self {
        Self {
            sessions,
            schedule_manager,
            retry_manager,
            client,
            scheduler_config,
            cleanup_config,
            retry_limit,
            statuses: DashMap::new(),
        }
    }

    /// Schedule unit key of a camera.
    pub fn unit_key(camera_id: &str) -> String {
        format!("camera:{camera_id}")
    }

    pub fn status(&self, camera_id: &str) -> Option<CameraStatus> {
        let status = *self.statuses.get(camera_id)?;
        Some(self.reconcile(camera_id, status))
    }

    /// A registered camera whose session is gone was expired by the
    /// long-session remover.
    fn reconcile(&self, camera_id: &str, status: CameraStatus) -> CameraStatus {
        if status == CameraStatus::Registered && !self.sessions.contains(camera_id) {
            CameraStatus::Expired
        } else {
            status
        }
    }

    fn set_status(&self, camera_id: &str, status: CameraStatus) {
        self.statuses.insert(camera_id.to_string(), status);
    }

    fn operation(
        &self,
        kind: RegistrationKind,
        session: &StreamSession,
    ) -> Arc<dyn RetryableOperation> {
        let verb = match kind {
            RegistrationKind::Register => "register",
            RegistrationKind::Unregister => "unregister",
        };
        Arc::new(RegistrationOperation {
            name: format!("{verb}:{}", session.camera_id),
            kind,
            session: session.clone(),
            client: self.client.clone(),
        })
    }

    /// Register `camera_id`, retrying the gateway call with backoff.
    ///
    /// Returns `Registered` or `Unreachable`. An unreachable camera leaves
    /// no session or schedule unit behind.
    pub async fn register(&self, camera_id: &str) -> Result<CameraStatus> {
        let session = self.sessions.open(camera_id, None)?;
        let unit_key = Self::unit_key(camera_id);

        if let Err(e) = self.schedule_manager.get_or_create(
            &unit_key,
            self.scheduler_config.pool_size,
            self.scheduler_config.queue_size,
        ) {
            self.sessions.close(camera_id);
            return Err(e.into());
        }
        self.set_status(camera_id, CameraStatus::Registering);

        let outcome = match self.retry_manager.submit(
            &unit_key,
            self.operation(RegistrationKind::Register, &session),
            i64::from(self.retry_limit),
        ) {
            Ok(mut handle) => Ok(handle.wait().await),
            Err(RetryError::AlreadyActive(name)) => {
                info!("Registration {} already in progress", name);
                return Ok(CameraStatus::Registering);
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(RetryStatus::Succeeded) => {
                if let Err(e) = self.start_segment_cleanup(camera_id, &unit_key) {
                    warn!("Camera {} cleanup job not started: {}", camera_id, e);
                    self.teardown(camera_id, &unit_key).await;
                    self.set_status(camera_id, CameraStatus::Unreachable);
                    return Err(e);
                }
                self.set_status(camera_id, CameraStatus::Registered);
                info!(
                    "Camera {} registered (rtp {}, session {})",
                    camera_id, session.rtp_port, session.id
                );
                Ok(CameraStatus::Registered)
            }
            Ok(status) => {
                warn!("Camera {} unreachable ({})", camera_id, status);
                self.teardown(camera_id, &unit_key).await;
                self.set_status(camera_id, CameraStatus::Unreachable);
                Ok(CameraStatus::Unreachable)
            }
            Err(e) => {
                self.teardown(camera_id, &unit_key).await;
                self.set_status(camera_id, CameraStatus::Unreachable);
                Err(e.into())
            }
        }
    }

    /// Unregister `camera_id` and release its session and schedule unit.
    ///
    /// Teardown happens even if the gateway never acknowledges.
    pub async fn unregister(&self, camera_id: &str) -> Result<CameraStatus> {
        let session = self
            .sessions
            .get(camera_id)
            .ok_or_else(|| Error::not_found("session", camera_id))?;
        let unit_key = Self::unit_key(camera_id);
        self.set_status(camera_id, CameraStatus::Unregistering);

        // The cleanup job is done once the camera goes away
        if let Some(unit) = self.schedule_manager.get(&unit_key) {
            unit.stop_by_name(SEGMENT_CLEANUP_JOB);
        }

        let status = match self.retry_manager.submit(
            &unit_key,
            self.operation(RegistrationKind::Unregister, &session),
            i64::from(self.retry_limit),
        ) {
            Ok(mut handle) => handle.wait().await,
            Err(e) => {
                warn!("Failed to submit unregistration of {}: {}", camera_id, e);
                RetryStatus::Failed
            }
        };
        if status != RetryStatus::Succeeded {
            warn!(
                "Gateway did not acknowledge unregistration of {} ({})",
                camera_id, status
            );
        }

        self.teardown(camera_id, &unit_key).await;
        self.set_status(camera_id, CameraStatus::Unregistered);
        info!("Camera {} unregistered", camera_id);
        Ok(CameraStatus::Unregistered)
    }

    fn start_segment_cleanup(&self, camera_id: &str, unit_key: &str) -> Result<()> {
        if self
            .schedule_manager
            .get(unit_key)
            .is_some_and(|unit| unit.contains_job(SEGMENT_CLEANUP_JOB))
        {
            return Ok(());
        }
        let dash_path = self.cleanup_config.media_base_path.join(camera_id);
        let job = Job::builder(SEGMENT_CLEANUP_JOB)
            .initial_delay(self.cleanup_config.segment_cleanup_interval())
            .interval(self.cleanup_config.segment_cleanup_interval())
            .build(Arc::new(SegmentCleanupTask::new(
                dash_path,
                self.cleanup_config.segment_window(),
            )));
        self.schedule_manager.start_job(unit_key, &job)?;
        Ok(())
    }

    async fn teardown(&self, camera_id: &str, unit_key: &str) {
        self.schedule_manager.stop_all(unit_key).await;
        self.sessions.close(camera_id);
    }

    pub fn registered_cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .statuses
            .iter()
            .filter(|entry| {
                self.reconcile(entry.key(), *entry.value()) == CameraStatus::Registered
            })
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}
