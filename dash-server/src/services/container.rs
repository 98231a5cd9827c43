//! Service container for dependency injection.
//!
//! The ServiceContainer holds references to all application services
//! and manages their lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use port_pool::PortPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::ServerConfig;
use crate::logging::LogRetentionTask;
use crate::retry::RetryManager;
use crate::scheduler::{Job, ScheduleManager};
use crate::session::{CameraRegistry, LongSessionRemover, RegistrationClient, SessionManager};

/// Key of the schedule unit hosting server-wide housekeeping jobs.
pub const MAINTENANCE_UNIT: &str = "maintenance";

/// Workers of the maintenance unit.
const MAINTENANCE_POOL_SIZE: usize = 2;

/// Interval of the log retention job (daily).
const LOG_RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Resolved configuration.
    pub config: Arc<ServerConfig>,
    /// RTP port pool shared by all sessions.
    pub port_pool: Arc<PortPool>,
    /// Schedule unit registry.
    pub schedule_manager: Arc<ScheduleManager>,
    /// Retry orchestration.
    pub retry_manager: Arc<RetryManager>,
    /// Active camera sessions.
    pub session_manager: Arc<SessionManager>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        info!("Initializing service container");

        let resource = &config.resource;
        let port_pool = Arc::new(PortPool::new(
            resource.port_min,
            resource.port_max,
            resource.port_gap,
        )?);
        let schedule_manager = Arc::new(ScheduleManager::new());
        let retry_manager =
            RetryManager::new(schedule_manager.clone(), config.retry.backoff_policy());
        let session_manager = Arc::new(SessionManager::new(port_pool.clone()));

        Ok(Self {
            config: Arc::new(config),
            port_pool,
            schedule_manager,
            retry_manager,
            session_manager,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Fill the port pool and start the housekeeping jobs.
    pub fn start(&self) -> Result<()> {
        self.port_pool.init_resource();

        let cleanup = &self.config.cleanup;
        self.schedule_manager.get_or_create(
            MAINTENANCE_UNIT,
            MAINTENANCE_POOL_SIZE,
            self.config.scheduler.queue_size,
        )?;

        let remover = Job::builder("long-session-remover")
            .initial_delay(cleanup.session_check_interval())
            .interval(cleanup.session_check_interval())
            .build(Arc::new(
                LongSessionRemover::new(
                    self.session_manager.clone(),
                    self.schedule_manager.clone(),
                    cleanup.session_limit(),
                )
                .with_media_dir(&cleanup.media_base_path, cleanup.dir_limit()),
            ));
        self.schedule_manager.start_job(MAINTENANCE_UNIT, &remover)?;

        let retention = Job::builder("log-retention")
            .interval(LOG_RETENTION_INTERVAL)
            .priority(-1)
            .build(Arc::new(LogRetentionTask::new(
                PathBuf::from(&self.config.log.dir),
                cleanup.log_retention_days,
            )));
        self.schedule_manager.start_job(MAINTENANCE_UNIT, &retention)?;

        info!("Services started");
        Ok(())
    }

    /// Build a camera registry wired to this container's services.
    pub fn camera_registry(&self, client: Arc<dyn RegistrationClient>) -> CameraRegistry {
        CameraRegistry::new(
            self.session_manager.clone(),
            self.schedule_manager.clone(),
            self.retry_manager.clone(),
            client,
            self.config.scheduler.clone(),
            self.config.cleanup.clone(),
            self.config.retry.register_retry_limit,
        )
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stop every schedule unit, close sessions and release the port pool.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.cancellation_token.cancel();

        if tokio::time::timeout(DEFAULT_SHUTDOWN_TIMEOUT, self.schedule_manager.finish())
            .await
            .is_err()
        {
            warn!(
                "Schedule units did not stop within {:?}",
                DEFAULT_SHUTDOWN_TIMEOUT
            );
        }

        let closed = self.session_manager.close_all();
        self.port_pool.release_resource();
        info!("Services shut down ({} sessions closed)", closed);
    }
}
