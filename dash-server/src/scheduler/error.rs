use thiserror::Error;

/// Errors raised while admitting jobs or managing schedule units.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Schedule unit {unit} is full ({capacity} jobs)")]
    QueueFull { unit: String, capacity: usize },

    #[error("Job {job} is already scheduled on unit {unit}")]
    DuplicateJob { unit: String, job: String },

    #[error("Job {job} is already attached to unit {unit}")]
    AlreadyAttached { job: String, unit: String },

    #[error("Job {0} is completed or cancelled")]
    Terminal(String),

    #[error("Schedule unit {0} is stopped")]
    Stopped(String),

    #[error("Schedule unit not found: {0}")]
    UnitNotFound(String),

    #[error("Schedule unit {unit} still hosts {jobs} jobs")]
    UnitBusy { unit: String, jobs: usize },

    #[error("No async runtime available to start the workers of {0}")]
    NoRuntime(String),
}
