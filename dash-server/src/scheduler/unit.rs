use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::error::ScheduleError;
use super::job::Job;
use super::job_scheduler::JobScheduler;

/// Worker count used when a non-positive pool size is requested.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Live-job capacity used when a non-positive queue size is requested.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

/// A named scheduling domain owning one [`JobScheduler`].
///
/// The scheduler's hosted table is the single record of which jobs the unit
/// runs, so jobs that complete on their own drop out of [`job_names`].
///
/// [`job_names`]: ScheduleUnit::job_names
pub struct ScheduleUnit {
    key: String,
    created_at: DateTime<Utc>,
    scheduler: JobScheduler,
}

impl ScheduleUnit {
    pub fn new(
        key: impl Into<String>,
        pool_size: usize,
        queue_size: usize,
    ) -> Result<Self, ScheduleError> {
        let key = key.into();
        let pool_size = if pool_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            pool_size
        };
        let queue_size = if queue_size == 0 {
            DEFAULT_QUEUE_SIZE
        } else {
            queue_size
        };

        let scheduler = JobScheduler::new(key.clone(), pool_size, queue_size)?;
        debug!("Created schedule unit {} ({} workers)", key, pool_size);

        Ok(Self {
            key,
            created_at: Utc::now(),
            scheduler,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pool_size(&self) -> usize {
        self.scheduler.pool_size()
    }

    pub fn queue_size(&self) -> usize {
        self.scheduler.queue_size()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_stopped(&self) -> bool {
        self.scheduler.is_stopped()
    }

    /// Admit `job` into this unit.
    pub fn start(&self, job: &Arc<Job>) -> Result<(), ScheduleError> {
        self.scheduler.schedule(job)
    }

    /// Cancel `job`. Returns `false` if it is not hosted here.
    pub fn stop(&self, job: &Arc<Job>) -> bool {
        if job.schedule_unit_key().as_deref() != Some(self.key.as_str()) {
            return false;
        }
        self.scheduler.cancel(job)
    }

    pub fn stop_by_name(&self, name: &str) -> bool {
        self.scheduler.cancel_by_name(name)
    }

    /// Cancel every hosted job and shut the worker pool down.
    pub async fn stop_all(&self) {
        let jobs = self.scheduler.job_count();
        self.scheduler.stop().await;
        info!("Stopped schedule unit {} ({} jobs)", self.key, jobs);
    }

    pub fn job_count(&self) -> usize {
        self.scheduler.job_count()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.scheduler.job_names()
    }

    pub fn contains_job(&self, name: &str) -> bool {
        self.scheduler.contains(name)
    }

    pub fn get_job(&self, name: &str) -> Option<Arc<Job>> {
        self.scheduler.get(name)
    }
}

impl fmt::Display for ScheduleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ScheduleUnit({}, pool={}, queue={}, jobs={})",
            self.key,
            self.pool_size(),
            self.queue_size(),
            self.job_count()
        )
    }
}

impl fmt::Debug for ScheduleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleUnit")
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
