//! Job definitions.
//!
//! A [`Job`] pairs scheduling metadata (delay, interval, priority, run-count
//! bound) with a [`JobTask`] capability that does the actual work. Jobs are
//! built detached with [`Job::builder`] and become scheduled once a
//! [`ScheduleUnit`](super::ScheduleUnit) admits them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::ScheduleError;

/// Error returned by a single job invocation.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job failed: {0}")]
    Failed(String),
    #[error("Job skipped: {0}")]
    Skipped(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn skipped(msg: impl Into<String>) -> Self {
        Self::Skipped(msg.into())
    }
}

/// Result of a single job invocation.
pub type JobResult = std::result::Result<(), JobError>;

/// The work a job performs on each fire.
#[async_trait]
pub trait JobTask: Send + Sync {
    async fn run(&self) -> JobResult;
}

struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> JobTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn run(&self) -> JobResult {
        (self.0)().await
    }
}

/// Wrap an async closure into a [`JobTask`].
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn JobTask>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(FnTask(f))
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Constructed, not yet admitted anywhere.
    Detached,
    /// Admitted to a schedule unit and firing.
    Scheduled,
    /// Reached its run-count bound.
    Completed,
    /// Stopped explicitly or by its unit.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Detached => "DETACHED",
            JobState::Scheduled => "SCHEDULED",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling metadata of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Unique within the hosting schedule unit.
    pub name: String,
    /// Delay before the first fire.
    pub initial_delay: Duration,
    /// Period between fires. Zero makes the job one-shot.
    pub interval: Duration,
    /// Tie-breaker for coincident fire times. Higher runs first.
    pub priority: i32,
    /// Number of fires before completion. Zero means unbounded.
    pub total_run_count: u32,
    /// Keep firing past `total_run_count`.
    pub repeat: bool,
}

/// Builder for [`Job`].
#[derive(Debug, Clone)]
pub struct JobBuilder {
    config: JobConfig,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: JobConfig {
                name: name.into(),
                initial_delay: Duration::ZERO,
                interval: Duration::ZERO,
                priority: 0,
                total_run_count: 0,
                repeat: false,
            },
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.config.priority = priority;
        self
    }

    pub fn total_run_count(mut self, count: u32) -> Self {
        self.config.total_run_count = count;
        self
    }

    pub fn repeat(mut self, repeat: bool) -> Self {
        self.config.repeat = repeat;
        self
    }

    pub fn build(self, task: Arc<dyn JobTask>) -> Arc<Job> {
        Arc::new(Job::new(self.config, task))
    }
}

#[derive(Debug)]
struct JobSlot {
    state: JobState,
    /// Back-reference to the hosting unit. Never an ownership edge.
    schedule_unit_key: Option<String>,
    admission_seq: u64,
    running: bool,
}

/// Result of claiming a job's run slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunClaim {
    Started,
    /// A previous run has not returned yet.
    Busy,
    /// The job was cancelled or completed.
    Terminal,
}

/// A unit of recurring or one-shot work.
pub struct Job {
    config: JobConfig,
    task: Arc<dyn JobTask>,
    slot: Mutex<JobSlot>,
    fire_count: AtomicU32,
}

impl Job {
    pub fn new(config: JobConfig, task: Arc<dyn JobTask>) -> Self {
        Self {
            config,
            task,
            slot: Mutex::new(JobSlot {
                state: JobState::Detached,
                schedule_unit_key: None,
                admission_seq: 0,
                running: false,
            }),
            fire_count: AtomicU32::new(0),
        }
    }

    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name)
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn initial_delay(&self) -> Duration {
        self.config.initial_delay
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn total_run_count(&self) -> u32 {
        self.config.total_run_count
    }

    pub fn is_repeat(&self) -> bool {
        self.config.repeat
    }

    /// Maximum number of fires, or `None` when the job runs until cancelled.
    pub fn run_limit(&self) -> Option<u32> {
        if self.config.interval.is_zero() {
            Some(1)
        } else if !self.config.repeat && self.config.total_run_count > 0 {
            Some(self.config.total_run_count)
        } else {
            None
        }
    }

    pub fn state(&self) -> JobState {
        self.slot.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn schedule_unit_key(&self) -> Option<String> {
        self.slot.lock().schedule_unit_key.clone()
    }

    /// Number of fires executed so far, failed ones included.
    pub fn fire_count(&self) -> u32 {
        self.fire_count.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().running
    }

    pub(crate) fn task(&self) -> &Arc<dyn JobTask> {
        &self.task
    }

    pub(crate) fn admission_seq(&self) -> u64 {
        self.slot.lock().admission_seq
    }

    /// Detached -> Scheduled, stamping the owning unit key.
    pub(crate) fn attach(&self, unit_key: &str, admission_seq: u64) -> Result<(), ScheduleError> {
        let mut slot = self.slot.lock();
        match slot.state {
            JobState::Detached => {
                slot.state = JobState::Scheduled;
                slot.schedule_unit_key = Some(unit_key.to_string());
                slot.admission_seq = admission_seq;
                Ok(())
            }
            JobState::Scheduled => Err(ScheduleError::AlreadyAttached {
                job: self.config.name.clone(),
                unit: slot.schedule_unit_key.clone().unwrap_or_default(),
            }),
            JobState::Completed | JobState::Cancelled => {
                Err(ScheduleError::Terminal(self.config.name.clone()))
            }
        }
    }

    /// Scheduled -> Cancelled. Returns `false` if the job was not scheduled.
    pub(crate) fn cancel(&self) -> bool {
        self.finish(JobState::Cancelled)
    }

    /// Scheduled -> Completed. Returns `false` if the job was not scheduled.
    pub(crate) fn complete(&self) -> bool {
        self.finish(JobState::Completed)
    }

    fn finish(&self, terminal: JobState) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != JobState::Scheduled {
            return false;
        }
        slot.state = terminal;
        slot.schedule_unit_key = None;
        true
    }

    pub(crate) fn record_fire(&self) -> u32 {
        self.fire_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn is_exhausted(&self, fired: u32) -> bool {
        self.run_limit().is_some_and(|limit| fired >= limit)
    }

    /// Claim the run slot. Checked under the same lock as [`cancel`], so a
    /// cancelled job never starts another run.
    ///
    /// [`cancel`]: Job::cancel
    pub(crate) fn begin_run(&self) -> RunClaim {
        let mut slot = self.slot.lock();
        if slot.state != JobState::Scheduled {
            return RunClaim::Terminal;
        }
        if slot.running {
            return RunClaim::Busy;
        }
        slot.running = true;
        RunClaim::Started
    }

    pub(crate) fn end_run(&self) {
        self.slot.lock().running = false;
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("Job")
            .field("name", &self.config.name)
            .field("initial_delay", &self.config.initial_delay)
            .field("interval", &self.config.interval)
            .field("priority", &self.config.priority)
            .field("total_run_count", &self.config.total_run_count)
            .field("repeat", &self.config.repeat)
            .field("state", &slot.state)
            .field("schedule_unit_key", &slot.schedule_unit_key)
            .field("fire_count", &self.fire_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn JobTask> {
        task_fn(|| async { Ok(()) })
    }

    #[test]
    fn test_builder_defaults() {
        let job = Job::builder("noop").build(noop());
        assert_eq!(job.name(), "noop");
        assert_eq!(job.initial_delay(), Duration::ZERO);
        assert_eq!(job.interval(), Duration::ZERO);
        assert_eq!(job.priority(), 0);
        assert_eq!(job.state(), JobState::Detached);
        assert_eq!(job.schedule_unit_key(), None);
    }

    #[test]
    fn test_run_limit() {
        // Zero interval is one-shot regardless of the count
        let one_shot = Job::builder("a").total_run_count(5).build(noop());
        assert_eq!(one_shot.run_limit(), Some(1));

        let bounded = Job::builder("b")
            .interval(Duration::from_millis(10))
            .total_run_count(3)
            .build(noop());
        assert_eq!(bounded.run_limit(), Some(3));

        let repeating = Job::builder("c")
            .interval(Duration::from_millis(10))
            .total_run_count(3)
            .repeat(true)
            .build(noop());
        assert_eq!(repeating.run_limit(), None);

        let unbounded = Job::builder("d")
            .interval(Duration::from_millis(10))
            .build(noop());
        assert_eq!(unbounded.run_limit(), None);
    }

    #[test]
    fn test_attach_and_terminal_transitions() {
        let job = Job::builder("job").build(noop());

        job.attach("unit-a", 1).unwrap();
        assert_eq!(job.state(), JobState::Scheduled);
        assert_eq!(job.schedule_unit_key().as_deref(), Some("unit-a"));

        // A scheduled job cannot join a second unit
        assert!(matches!(
            job.attach("unit-b", 2),
            Err(ScheduleError::AlreadyAttached { .. })
        ));

        assert!(job.cancel());
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(job.schedule_unit_key(), None);

        // Terminal states stick
        assert!(!job.complete());
        assert!(matches!(job.attach("unit-a", 3), Err(ScheduleError::Terminal(_))));
    }

    #[test]
    fn test_run_guard() {
        let job = Job::builder("job").build(noop());
        // Detached jobs never run
        assert_eq!(job.begin_run(), RunClaim::Terminal);

        job.attach("unit", 0).unwrap();
        assert_eq!(job.begin_run(), RunClaim::Started);
        assert!(job.is_running());
        assert_eq!(job.begin_run(), RunClaim::Busy);
        job.end_run();
        assert_eq!(job.begin_run(), RunClaim::Started);

        // Cancelling mid-run lets the run finish but blocks the next one
        assert!(job.cancel());
        job.end_run();
        assert_eq!(job.begin_run(), RunClaim::Terminal);
        assert!(!job.is_running());
    }

    #[test]
    fn test_no_run_starts_after_cancel() {
        use std::sync::atomic::AtomicBool;

        for _ in 0..200 {
            let job = Job::builder("job").build(noop());
            job.attach("unit", 0).unwrap();
            let cancelled = AtomicBool::new(false);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let cancelled_before = cancelled.load(Ordering::SeqCst);
                        if job.begin_run() == RunClaim::Started {
                            assert!(!cancelled_before, "run started after cancel");
                            job.end_run();
                        }
                    }
                });
                scope.spawn(|| {
                    job.cancel();
                    cancelled.store(true, Ordering::SeqCst);
                });
            });

            assert_eq!(job.begin_run(), RunClaim::Terminal);
        }
    }

    #[tokio::test]
    async fn test_task_fn_runs_closure() {
        let task = task_fn(|| async { Err(JobError::failed("boom")) });
        let err = task.run().await.unwrap_err();
        assert_eq!(err.to_string(), "Job failed: boom");
    }
}
