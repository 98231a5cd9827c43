//! Timer-driven job scheduler backed by a fixed pool of tokio workers.
//!
//! One timer task keeps a deadline heap and moves due fires onto a ready
//! heap; `pool_size` worker tasks drain the ready heap. A job is re-armed
//! only after its run returns, so a single job never overlaps itself even
//! when its run outlasts its interval.

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::error::ScheduleError;
use super::job::{Job, RunClaim};

/// A pending fire of a job.
struct Fire {
    at: Instant,
    priority: i32,
    seq: u64,
    job: Arc<Job>,
}

impl Fire {
    fn new(job: Arc<Job>, at: Instant) -> Self {
        Self {
            at,
            priority: job.priority(),
            seq: job.admission_seq(),
            job,
        }
    }
}

// BinaryHeap pops the greatest entry: earliest deadline, then highest
// priority, then earliest admission.
impl Ord for Fire {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Fire {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Fire {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Fire {}

/// State shared between the scheduler handle and its tasks.
struct SchedulerShared {
    owner: String,
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    timers: Mutex<BinaryHeap<Fire>>,
    ready: Mutex<BinaryHeap<Fire>>,
    timer_notify: Notify,
    ready_notify: Notify,
    stopped: AtomicBool,
}

impl SchedulerShared {
    fn arm(&self, job: Arc<Job>, at: Instant) {
        self.timers.lock().push(Fire::new(job, at));
        self.timer_notify.notify_one();
    }

    /// Move every due fire onto the ready heap.
    fn release_due(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut timers = self.timers.lock();
            while timers.peek().is_some_and(|fire| fire.at <= now) {
                if let Some(fire) = timers.pop() {
                    due.push(fire);
                }
            }
        }

        let mut released = 0usize;
        {
            let mut ready = self.ready.lock();
            for fire in due {
                if fire.job.is_terminal() {
                    continue;
                }
                ready.push(fire);
                released += 1;
            }
        }

        // Workers register interest before popping, so waking every waiter
        // cannot lose a fire.
        if released > 0 {
            self.ready_notify.notify_waiters();
        }
    }

    /// Drop the hosted-table entry for `job` if it is still the registered one.
    fn forget(&self, job: &Arc<Job>) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.get(job.name()) {
            Some(hosted) if Arc::ptr_eq(hosted, job) => jobs.remove(job.name()).is_some(),
            _ => false,
        }
    }

    fn purge_fires(&self, job: &Arc<Job>) {
        self.timers.lock().retain(|fire| !Arc::ptr_eq(&fire.job, job));
        self.ready.lock().retain(|fire| !Arc::ptr_eq(&fire.job, job));
    }

    async fn execute(&self, fire: Fire, worker: usize) {
        let job = fire.job;
        match job.begin_run() {
            RunClaim::Started => {}
            RunClaim::Terminal => return,
            RunClaim::Busy => {
                warn!(
                    "[{}] Job {} is still running, dropping overlapping fire",
                    self.owner,
                    job.name()
                );
                return;
            }
        }

        trace!("[{}] worker {} firing job {}", self.owner, worker, job.name());
        let outcome = AssertUnwindSafe(job.task().run()).catch_unwind().await;
        job.end_run();

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[{}] Job {} run failed: {}", self.owner, job.name(), e);
            }
            Err(panic) => {
                error!(
                    "[{}] Job {} panicked: {}",
                    self.owner,
                    job.name(),
                    panic_message(panic.as_ref())
                );
            }
        }

        let fired = job.record_fire();

        if job.is_terminal() {
            // Cancelled while running
            self.forget(&job);
            return;
        }

        if job.is_exhausted(fired) {
            if job.complete() {
                debug!(
                    "[{}] Job {} completed after {} fires",
                    self.owner,
                    job.name(),
                    fired
                );
            }
            self.forget(&job);
            return;
        }

        let next = deadline_after(fire.at, job.interval()).max(Instant::now());
        self.arm(job, next);
    }
}

/// Deadlines this far out never fire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay).unwrap_or_else(|| base + FAR_FUTURE)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn run_timer(shared: Arc<SchedulerShared>, token: CancellationToken) {
    debug!("[{}] timer started", shared.owner);

    loop {
        let next_at = shared.timers.lock().peek().map(|fire| fire.at);

        match next_at {
            Some(at) => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shared.timer_notify.notified() => {
                        // Heap changed, recompute the next deadline
                    }
                    _ = tokio::time::sleep_until(at) => shared.release_due(),
                }
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shared.timer_notify.notified() => {}
                }
            }
        }
    }

    debug!("[{}] timer shutting down", shared.owner);
}

async fn run_worker(shared: Arc<SchedulerShared>, token: CancellationToken, index: usize) {
    debug!("[{}] worker {} started", shared.owner, index);

    loop {
        if token.is_cancelled() {
            break;
        }

        let notified = shared.ready_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = shared.ready.lock().pop();
        match next {
            Some(fire) => shared.execute(fire, index).await,
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = &mut notified => {}
                }
            }
        }
    }

    debug!("[{}] worker {} shutting down", shared.owner, index);
}

/// Timer plus worker pool hosting the jobs of one schedule unit.
pub struct JobScheduler {
    shared: Arc<SchedulerShared>,
    pool_size: usize,
    queue_size: usize,
    next_seq: AtomicU64,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl JobScheduler {
    /// Start a scheduler with `pool_size` workers hosting at most
    /// `queue_size` live jobs. Must be called from within a tokio runtime.
    pub fn new(
        owner: impl Into<String>,
        pool_size: usize,
        queue_size: usize,
    ) -> Result<Self, ScheduleError> {
        let owner = owner.into();
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| ScheduleError::NoRuntime(owner.clone()))?;

        let shared = Arc::new(SchedulerShared {
            owner,
            jobs: Mutex::new(HashMap::new()),
            timers: Mutex::new(BinaryHeap::new()),
            ready: Mutex::new(BinaryHeap::new()),
            timer_notify: Notify::new(),
            ready_notify: Notify::new(),
            stopped: AtomicBool::new(false),
        });
        let cancellation_token = CancellationToken::new();

        let mut join_set = JoinSet::new();
        join_set.spawn_on(
            run_timer(shared.clone(), cancellation_token.clone()),
            &handle,
        );
        for i in 0..pool_size {
            join_set.spawn_on(
                run_worker(shared.clone(), cancellation_token.clone(), i),
                &handle,
            );
        }

        debug!(
            "[{}] Started job scheduler with {} workers (capacity {})",
            shared.owner, pool_size, queue_size
        );

        Ok(Self {
            shared,
            pool_size,
            queue_size,
            next_seq: AtomicU64::new(0),
            cancellation_token,
            tasks: Mutex::new(Some(join_set)),
        })
    }

    pub fn owner(&self) -> &str {
        &self.shared.owner
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Admit `job` and arm its first fire after `initial_delay`.
    pub fn schedule(&self, job: &Arc<Job>) -> Result<(), ScheduleError> {
        {
            let mut jobs = self.shared.jobs.lock();
            if self.is_stopped() {
                return Err(ScheduleError::Stopped(self.shared.owner.clone()));
            }
            if jobs.len() >= self.queue_size {
                warn!(
                    "[{}] Rejecting job {}: unit is full ({} jobs)",
                    self.shared.owner,
                    job.name(),
                    self.queue_size
                );
                return Err(ScheduleError::QueueFull {
                    unit: self.shared.owner.clone(),
                    capacity: self.queue_size,
                });
            }
            if jobs.contains_key(job.name()) {
                return Err(ScheduleError::DuplicateJob {
                    unit: self.shared.owner.clone(),
                    job: job.name().to_string(),
                });
            }

            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            job.attach(&self.shared.owner, seq)?;
            jobs.insert(job.name().to_string(), job.clone());
        }

        let first = deadline_after(Instant::now(), job.initial_delay());
        self.shared.arm(job.clone(), first);

        debug!(
            "[{}] Scheduled job {} (delay {:?}, interval {:?}, priority {})",
            self.shared.owner,
            job.name(),
            job.initial_delay(),
            job.interval(),
            job.priority()
        );
        Ok(())
    }

    /// Cancel `job`. A run already in progress finishes but is not re-armed.
    pub fn cancel(&self, job: &Arc<Job>) -> bool {
        let removed = self.shared.forget(job);
        let cancelled = job.cancel();
        if removed || cancelled {
            self.shared.purge_fires(job);
            debug!("[{}] Cancelled job {}", self.shared.owner, job.name());
        }
        removed || cancelled
    }

    pub fn cancel_by_name(&self, name: &str) -> bool {
        match self.get(name) {
            Some(job) => self.cancel(&job),
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Job>> {
        self.shared.jobs.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shared.jobs.lock().contains_key(name)
    }

    /// Number of live (scheduled) jobs.
    pub fn job_count(&self) -> usize {
        self.shared.jobs.lock().len()
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.jobs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every job and wait for the workers to exit.
    ///
    /// In-progress runs are allowed to finish. Calling this more than once
    /// is harmless.
    pub async fn stop(&self) {
        let jobs: Vec<Arc<Job>> = {
            let mut jobs = self.shared.jobs.lock();
            self.shared.stopped.store(true, Ordering::Release);
            jobs.drain().map(|(_, job)| job).collect()
        };

        for job in &jobs {
            job.cancel();
        }
        self.shared.timers.lock().clear();
        self.shared.ready.lock().clear();
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        let Some(mut join_set) = join_set else {
            return;
        };

        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                error!("[{}] Scheduler task panicked: {}", self.shared.owner, e);
            }
        }

        info!(
            "[{}] Job scheduler stopped ({} jobs cancelled)",
            self.shared.owner,
            jobs.len()
        );
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("owner", &self.shared.owner)
            .field("pool_size", &self.pool_size)
            .field("queue_size", &self.queue_size)
            .field("jobs", &self.job_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
