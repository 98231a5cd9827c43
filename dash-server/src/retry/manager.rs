//! Retry orchestration on top of schedule units.
//!
//! [`RetryManager::submit`] drives an operation to a terminal status: each
//! attempt is a one-shot [`Job`] on the caller's schedule unit, and a failed
//! attempt schedules the next one after the backoff delay until the retry
//! budget is spent.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::unit::{RetryDecision, RetryStatus, RetryUnit};
use crate::scheduler::{Job, JobError, JobResult, JobTask, ScheduleError, ScheduleManager};

/// Errors raised by the retry manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("Retry unit {name} already finished with status {status}")]
    AlreadyTerminal { name: String, status: RetryStatus },

    #[error("Retry unit {0} is already active")]
    AlreadyActive(String),

    #[error("Failed to schedule retry attempt: {0}")]
    Schedule(#[from] ScheduleError),
}

/// An operation that may be attempted several times.
#[async_trait]
pub trait RetryableOperation: Send + Sync {
    /// Unique name of the operation, used as the retry unit name.
    fn name(&self) -> &str;

    /// Run attempt number `attempt` (1-based).
    async fn attempt(&self, attempt: u32) -> JobResult;
}

/// Result of handling a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The next attempt was scheduled after `delay`.
    Rescheduled { attempt: u32, delay: Duration },
    /// The unit is not driven by the manager; its owner retries after `delay`.
    RetryAfter { attempt: u32, delay: Duration },
    /// The budget is spent and the unit is `Failed`.
    Exhausted { retries: u32 },
}

#[derive(Clone)]
struct RetryBinding {
    schedule_unit_key: String,
    operation: Arc<dyn RetryableOperation>,
}

struct RetryEntry {
    unit: Arc<RetryUnit>,
    binding: Option<RetryBinding>,
    status_tx: watch::Sender<RetryStatus>,
}

impl RetryEntry {
    fn new(unit: Arc<RetryUnit>, binding: Option<RetryBinding>) -> Self {
        let (status_tx, _) = watch::channel(unit.retry_status());
        Self {
            unit,
            binding,
            status_tx,
        }
    }
}

/// Handle to an operation submitted with [`RetryManager::submit`].
pub struct RetryHandle {
    unit: Arc<RetryUnit>,
    status_rx: watch::Receiver<RetryStatus>,
}

impl RetryHandle {
    pub fn unit(&self) -> &Arc<RetryUnit> {
        &self.unit
    }

    pub fn status(&self) -> RetryStatus {
        self.unit.retry_status()
    }

    /// Wait until the operation succeeds or exhausts its retries.
    ///
    /// If the unit is removed before finishing, returns its last status.
    pub async fn wait(&mut self) -> RetryStatus {
        match self.status_rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.unit.retry_status(),
        }
    }
}

/// One attempt of a submitted operation, run as a one-shot job.
struct RetryAttemptTask {
    manager: Weak<RetryManager>,
    unit: Arc<RetryUnit>,
    operation: Arc<dyn RetryableOperation>,
    attempt: u32,
}

#[async_trait]
impl JobTask for RetryAttemptTask {
    async fn run(&self) -> JobResult {
        let Some(manager) = self.manager.upgrade() else {
            return Err(JobError::skipped("retry manager dropped"));
        };
        if !manager.is_registered(&self.unit) {
            return Err(JobError::skipped(format!(
                "retry unit {} was released",
                self.unit.name()
            )));
        }

        match self.operation.attempt(self.attempt).await {
            Ok(()) => manager
                .on_success(&self.unit)
                .map_err(|e| JobError::failed(e.to_string())),
            Err(e) => {
                warn!(
                    "[{}] attempt {} failed: {}",
                    self.unit.name(),
                    self.attempt,
                    e
                );
                manager
                    .on_failure(&self.unit)
                    .map(|_| ())
                    .map_err(|e| JobError::failed(e.to_string()))
            }
        }
    }
}

/// Registry of retry units plus the scheduling of their attempts.
pub struct RetryManager {
    units: DashMap<String, RetryEntry>,
    schedule_manager: Arc<ScheduleManager>,
    backoff: BackoffPolicy,
    this: Weak<RetryManager>,
}

impl RetryManager {
    pub fn new(schedule_manager: Arc<ScheduleManager>, backoff: BackoffPolicy) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            units: DashMap::new(),
            schedule_manager,
            backoff,
            this: this.clone(),
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Register a unit under `name`. An existing unit is kept and returned.
    pub fn add_retry_unit(
        &self,
        name: &str,
        retry_count_limit: i64,
        cur_retry_count: i64,
    ) -> Arc<RetryUnit> {
        self.units
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Registered retry unit {} (limit {})", name, retry_count_limit);
                RetryEntry::new(
                    Arc::new(RetryUnit::new(name, retry_count_limit, cur_retry_count)),
                    None,
                )
            })
            .unit
            .clone()
    }

    pub fn get_retry_unit(&self, name: &str) -> Option<Arc<RetryUnit>> {
        self.units.get(name).map(|entry| entry.unit.clone())
    }

    pub fn remove_retry_unit(&self, name: &str) -> Option<Arc<RetryUnit>> {
        self.units.remove(name).map(|(_, entry)| {
            entry.status_tx.send_replace(entry.unit.retry_status());
            debug!("Removed retry unit {}", name);
            entry.unit
        })
    }

    pub fn retry_status(&self, name: &str) -> Option<RetryStatus> {
        self.units.get(name).map(|entry| entry.unit.retry_status())
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn is_registered(&self, unit: &Arc<RetryUnit>) -> bool {
        self.units
            .get(unit.name())
            .is_some_and(|entry| Arc::ptr_eq(&entry.unit, unit))
    }

    /// Run `operation` on the schedule unit `schedule_unit_key`, retrying
    /// failures up to `retry_count_limit` times after the first attempt.
    pub fn submit(
        &self,
        schedule_unit_key: &str,
        operation: Arc<dyn RetryableOperation>,
        retry_count_limit: i64,
    ) -> Result<RetryHandle, RetryError> {
        let name = operation.name().to_string();
        let unit = Arc::new(RetryUnit::new(&name, retry_count_limit, 0));
        let binding = RetryBinding {
            schedule_unit_key: schedule_unit_key.to_string(),
            operation,
        };

        let status_rx = match self.units.entry(name.clone()) {
            Entry::Occupied(_) => return Err(RetryError::AlreadyActive(name)),
            Entry::Vacant(vacant) => {
                let entry = RetryEntry::new(unit.clone(), Some(binding.clone()));
                let rx = entry.status_tx.subscribe();
                vacant.insert(entry);
                rx
            }
        };

        unit.begin_attempt();
        self.publish(&unit);

        if let Err(e) = self.schedule_attempt(&unit, &binding, 1, Duration::ZERO) {
            warn!("[{}] Failed to schedule first attempt: {}", name, e);
            unit.set_retry_status(RetryStatus::Failed);
            self.release(&unit);
            return Err(e.into());
        }

        info!(
            "[{}] Submitted on unit {} (retry limit {})",
            name,
            schedule_unit_key,
            unit.retry_count_limit()
        );
        Ok(RetryHandle { unit, status_rx })
    }

    /// Mark `unit` succeeded and release it.
    pub fn on_success(&self, unit: &Arc<RetryUnit>) -> Result<(), RetryError> {
        if !unit.record_success() {
            return Err(RetryError::AlreadyTerminal {
                name: unit.name().to_string(),
                status: unit.retry_status(),
            });
        }

        info!(
            "[{}] Succeeded after {} retries",
            unit.name(),
            unit.cur_retry_count()
        );
        self.release(unit);
        Ok(())
    }

    /// Record a failed attempt of `unit` and schedule the next one if the
    /// budget allows.
    pub fn on_failure(&self, unit: &Arc<RetryUnit>) -> Result<RetryOutcome, RetryError> {
        match unit.record_failure() {
            RetryDecision::Terminal(status) => Err(RetryError::AlreadyTerminal {
                name: unit.name().to_string(),
                status,
            }),
            RetryDecision::Exhausted { retries } => {
                warn!(
                    "[{}] Giving up after {} retries",
                    unit.name(),
                    retries
                );
                self.release(unit);
                Ok(RetryOutcome::Exhausted { retries })
            }
            RetryDecision::Retry { retry } => {
                let delay = self.backoff.delay_for(retry);
                let attempt = retry + 1;
                let binding = self.units.get(unit.name()).and_then(|entry| {
                    if Arc::ptr_eq(&entry.unit, unit) {
                        entry.binding.clone()
                    } else {
                        None
                    }
                });

                let Some(binding) = binding else {
                    debug!(
                        "[{}] retry {} due in {:?}",
                        unit.name(),
                        retry,
                        delay
                    );
                    return Ok(RetryOutcome::RetryAfter { attempt, delay });
                };

                if let Err(e) = self.schedule_attempt(unit, &binding, attempt, delay) {
                    warn!(
                        "[{}] Failed to schedule attempt {}: {}",
                        unit.name(),
                        attempt,
                        e
                    );
                    unit.set_retry_status(RetryStatus::Failed);
                    self.release(unit);
                    return Err(e.into());
                }

                info!(
                    "[{}] Retry {}/{} scheduled in {:?}",
                    unit.name(),
                    retry,
                    unit.retry_count_limit(),
                    delay
                );
                Ok(RetryOutcome::Rescheduled { attempt, delay })
            }
        }
    }

    fn schedule_attempt(
        &self,
        unit: &Arc<RetryUnit>,
        binding: &RetryBinding,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), ScheduleError> {
        let task = RetryAttemptTask {
            manager: self.this.clone(),
            unit: unit.clone(),
            operation: binding.operation.clone(),
            attempt,
        };
        let job = Job::builder(format!("{}#attempt-{}", unit.name(), attempt))
            .initial_delay(delay)
            .build(Arc::new(task));

        self.schedule_manager
            .start_job(&binding.schedule_unit_key, &job)
    }

    fn publish(&self, unit: &Arc<RetryUnit>) {
        if let Some(entry) = self.units.get(unit.name())
            && Arc::ptr_eq(&entry.unit, unit)
        {
            entry.status_tx.send_replace(unit.retry_status());
        }
    }

    /// Drop the registry entry of a finished unit and wake its waiters.
    fn release(&self, unit: &Arc<RetryUnit>) {
        if let Some((_, entry)) = self
            .units
            .remove_if(unit.name(), |_, entry| Arc::ptr_eq(&entry.unit, unit))
        {
            entry.status_tx.send_replace(unit.retry_status());
            debug!("Released retry unit {} ({})", unit.name(), unit.retry_status());
        }
    }
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("units", &self.units.len())
            .field("backoff", &self.backoff)
            .finish()
    }
}
