//! Job scheduling.
//!
//! - [`Job`]: scheduling metadata plus a [`JobTask`]
//! - [`JobScheduler`]: timer and worker pool hosting jobs
//! - [`ScheduleUnit`]: a named scheduler with job bookkeeping
//! - [`ScheduleManager`]: registry of units

mod error;
mod job;
mod job_scheduler;
mod manager;
mod unit;

pub use error::ScheduleError;
pub use job::{Job, JobBuilder, JobConfig, JobError, JobResult, JobState, JobTask, task_fn};
pub use job_scheduler::JobScheduler;
pub use manager::ScheduleManager;
pub use unit::{DEFAULT_POOL_SIZE, DEFAULT_QUEUE_SIZE, ScheduleUnit};
