//! Per-operation retry state.
//!
//! The retry counter and status live in one `AtomicU64` (status in the high
//! half, count in the low half) so every transition is a single CAS and
//! readers never observe a torn pair.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Status of a retryable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStatus {
    /// Not attempted yet.
    Idle,
    /// An attempt is queued or running.
    Retrying,
    /// An attempt succeeded.
    Succeeded,
    /// Retries are exhausted.
    Failed,
}

impl RetryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RetryStatus::Succeeded | RetryStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetryStatus::Idle => "IDLE",
            RetryStatus::Retrying => "RETRYING",
            RetryStatus::Succeeded => "SUCCEEDED",
            RetryStatus::Failed => "FAILED",
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            RetryStatus::Idle => 0,
            RetryStatus::Retrying => 1,
            RetryStatus::Succeeded => 2,
            RetryStatus::Failed => 3,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits {
            1 => RetryStatus::Retrying,
            2 => RetryStatus::Succeeded,
            3 => RetryStatus::Failed,
            _ => RetryStatus::Idle,
        }
    }
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consistent view of a unit's counter and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySnapshot {
    pub cur_retry_count: u32,
    pub status: RetryStatus,
}

impl RetrySnapshot {
    fn pack(self) -> u64 {
        (self.status.to_bits() << 32) | u64::from(self.cur_retry_count)
    }

    fn unpack(bits: u64) -> Self {
        Self {
            cur_retry_count: (bits & u64::from(u32::MAX)) as u32,
            status: RetryStatus::from_bits(bits >> 32),
        }
    }
}

/// What a recorded failure means for the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry allowed. `retry` is the new counter value.
    Retry { retry: u32 },
    /// Budget spent, unit is now `Failed`.
    Exhausted { retries: u32 },
    /// Unit had already reached a terminal status.
    Terminal(RetryStatus),
}

fn clamp_count(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

/// Retry bookkeeping for one named operation.
pub struct RetryUnit {
    name: String,
    retry_count_limit: u32,
    state: AtomicU64,
}

impl RetryUnit {
    /// Negative inputs are clamped to zero. The initial count is capped at
    /// the limit.
    pub fn new(name: impl Into<String>, retry_count_limit: i64, cur_retry_count: i64) -> Self {
        let retry_count_limit = clamp_count(retry_count_limit);
        let cur_retry_count = clamp_count(cur_retry_count).min(retry_count_limit);
        let initial = RetrySnapshot {
            cur_retry_count,
            status: RetryStatus::Idle,
        };

        Self {
            name: name.into(),
            retry_count_limit,
            state: AtomicU64::new(initial.pack()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_count_limit(&self) -> u32 {
        self.retry_count_limit
    }

    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot::unpack(self.state.load(Ordering::Acquire))
    }

    pub fn cur_retry_count(&self) -> u32 {
        self.snapshot().cur_retry_count
    }

    pub fn retry_status(&self) -> RetryStatus {
        self.snapshot().status
    }

    pub fn is_terminal(&self) -> bool {
        self.retry_status().is_terminal()
    }

    /// Apply `f` atomically. `None` from `f` leaves the state untouched.
    fn transition<F>(&self, f: F) -> Result<(RetrySnapshot, RetrySnapshot), RetrySnapshot>
    where
        F: Fn(RetrySnapshot) -> Option<RetrySnapshot>,
    {
        let mut next = None;
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let candidate = f(RetrySnapshot::unpack(bits))?;
                next = Some(candidate);
                Some(candidate.pack())
            })
            .map(|prev| {
                let prev = RetrySnapshot::unpack(prev);
                let next = next.unwrap_or(prev);
                self.log_change(prev, next);
                (prev, next)
            })
            .map_err(RetrySnapshot::unpack)
    }

    fn log_change(&self, prev: RetrySnapshot, next: RetrySnapshot) {
        if prev.cur_retry_count != next.cur_retry_count {
            debug!(
                "[{}] retry count {} -> {} (limit {})",
                self.name, prev.cur_retry_count, next.cur_retry_count, self.retry_count_limit
            );
        }
        if prev.status != next.status {
            debug!("[{}] retry status {} -> {}", self.name, prev.status, next.status);
        }
    }

    /// Set the counter, clamped to `[0, limit]`.
    pub fn set_cur_retry_count(&self, count: i64) {
        let count = clamp_count(count).min(self.retry_count_limit);
        let _ = self.transition(|s| {
            Some(RetrySnapshot {
                cur_retry_count: count,
                ..s
            })
        });
    }

    pub fn set_retry_status(&self, status: RetryStatus) {
        let _ = self.transition(|s| Some(RetrySnapshot { status, ..s }));
    }

    /// `Idle -> Retrying`. Returns `false` for terminal units.
    pub fn begin_attempt(&self) -> bool {
        self.transition(|s| match s.status {
            RetryStatus::Idle => Some(RetrySnapshot {
                status: RetryStatus::Retrying,
                ..s
            }),
            RetryStatus::Retrying => Some(s),
            RetryStatus::Succeeded | RetryStatus::Failed => None,
        })
        .is_ok()
    }

    /// Record a failed attempt.
    ///
    /// While `cur < limit` the counter is incremented and another retry is
    /// allowed. A failure observed with `cur == limit` turns the unit
    /// `Failed`, so a limit of N allows N retries after the first attempt.
    pub fn record_failure(&self) -> RetryDecision {
        let limit = self.retry_count_limit;
        let result = self.transition(|s| {
            if s.status.is_terminal() {
                return None;
            }
            if s.cur_retry_count < limit {
                Some(RetrySnapshot {
                    cur_retry_count: s.cur_retry_count + 1,
                    status: RetryStatus::Retrying,
                })
            } else {
                Some(RetrySnapshot {
                    status: RetryStatus::Failed,
                    ..s
                })
            }
        });

        match result {
            Ok((_, next)) if next.status == RetryStatus::Failed => RetryDecision::Exhausted {
                retries: next.cur_retry_count,
            },
            Ok((_, next)) => RetryDecision::Retry {
                retry: next.cur_retry_count,
            },
            Err(current) => RetryDecision::Terminal(current.status),
        }
    }

    /// Record a successful attempt. Returns `false` for terminal units.
    pub fn record_success(&self) -> bool {
        self.transition(|s| {
            if s.status.is_terminal() {
                None
            } else {
                Some(RetrySnapshot {
                    status: RetryStatus::Succeeded,
                    ..s
                })
            }
        })
        .is_ok()
    }
}

impl fmt::Debug for RetryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("RetryUnit")
            .field("name", &self.name)
            .field("retry_count_limit", &self.retry_count_limit)
            .field("cur_retry_count", &snapshot.cur_retry_count)
            .field("status", &snapshot.status)
            .finish()
    }
}
