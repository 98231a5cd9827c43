//! Registry of schedule units keyed by name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::error::ScheduleError;
use super::job::Job;
use super::unit::ScheduleUnit;

/// Owns every [`ScheduleUnit`] of the process.
///
/// Lookup and creation happen under one lock, so concurrent
/// [`get_or_create`](Self::get_or_create) calls for a key always observe the
/// same unit.
#[derive(Default)]
pub struct ScheduleManager {
    units: Mutex<HashMap<String, Arc<ScheduleUnit>>>,
}

impl ScheduleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the unit for `key`, creating it with the given sizes if absent.
    ///
    /// Sizes only apply on creation. Zero selects the defaults.
    pub fn get_or_create(
        &self,
        key: &str,
        pool_size: usize,
        queue_size: usize,
    ) -> Result<Arc<ScheduleUnit>, ScheduleError> {
        let mut units = self.units.lock();
        if let Some(unit) = units.get(key) {
            return Ok(unit.clone());
        }

        let unit = Arc::new(ScheduleUnit::new(key, pool_size, queue_size)?);
        units.insert(key.to_string(), unit.clone());
        info!(
            "Registered schedule unit {} ({} workers, capacity {})",
            key,
            unit.pool_size(),
            unit.queue_size()
        );
        Ok(unit)
    }

    pub fn get(&self, key: &str) -> Option<Arc<ScheduleUnit>> {
        self.units.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.units.lock().contains_key(key)
    }

    /// Admit `job` into the unit named `key`.
    pub fn start_job(&self, key: &str, job: &Arc<Job>) -> Result<(), ScheduleError> {
        let unit = self
            .get(key)
            .ok_or_else(|| ScheduleError::UnitNotFound(key.to_string()))?;
        unit.start(job)
    }

    /// Cancel `job` on the unit named `key`.
    pub fn stop_job(&self, key: &str, job: &Arc<Job>) -> bool {
        self.get(key).is_some_and(|unit| unit.stop(job))
    }

    /// Stop every job of the unit named `key` and drop the unit.
    ///
    /// Returns `false` when no such unit exists.
    pub async fn stop_all(&self, key: &str) -> bool {
        let unit = self.units.lock().remove(key);
        match unit {
            Some(unit) => {
                unit.stop_all().await;
                debug!("Removed schedule unit {}", key);
                true
            }
            None => false,
        }
    }

    /// Drop the unit named `key` if it hosts no jobs.
    pub async fn remove(&self, key: &str) -> Result<Arc<ScheduleUnit>, ScheduleError> {
        let unit = {
            let mut units = self.units.lock();
            let unit = units
                .get(key)
                .ok_or_else(|| ScheduleError::UnitNotFound(key.to_string()))?;
            let jobs = unit.job_count();
            if jobs > 0 {
                return Err(ScheduleError::UnitBusy {
                    unit: key.to_string(),
                    jobs,
                });
            }
            units.remove(key)
        };

        let unit = unit.ok_or_else(|| ScheduleError::UnitNotFound(key.to_string()))?;
        unit.stop_all().await;
        Ok(unit)
    }

    /// Number of live jobs hosted by the unit named `key`.
    pub fn active_job_count(&self, key: &str) -> usize {
        self.get(key).map_or(0, |unit| unit.job_count())
    }

    pub fn unit_count(&self) -> usize {
        self.units.lock().len()
    }

    pub fn unit_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.units.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> HashMap<String, Arc<ScheduleUnit>> {
        self.units.lock().clone()
    }

    /// Stop every unit and clear the registry.
    pub async fn finish(&self) {
        let units: Vec<Arc<ScheduleUnit>> = {
            let mut units = self.units.lock();
            units.drain().map(|(_, unit)| unit).collect()
        };

        let count = units.len();
        for unit in units {
            unit.stop_all().await;
        }
        info!("Schedule manager finished ({} units stopped)", count);
    }
}

impl std::fmt::Debug for ScheduleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleManager")
            .field("units", &self.unit_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobState, task_fn};
    use std::time::Duration;

    fn idle_job(name: &str) -> Arc<Job> {
        Job::builder(name)
            .initial_delay(Duration::from_secs(60))
            .build(task_fn(|| async { Ok(()) }))
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_unit() {
        let manager = ScheduleManager::new();
        let first = manager.get_or_create("cam-1", 2, 16).unwrap();
        // Sizes of later calls are ignored
        let second = manager.get_or_create("cam-1", 8, 4).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.pool_size(), 2);
        assert_eq!(manager.unit_count(), 1);

        manager.finish().await;
    }

    #[tokio::test]
    async fn test_start_job_on_missing_unit() {
        let manager = ScheduleManager::new();
        let err = manager.start_job("nope", &idle_job("a")).unwrap_err();
        assert_eq!(err, ScheduleError::UnitNotFound("nope".to_string()));
        assert!(!manager.stop_job("nope", &idle_job("a")));
    }

    #[tokio::test]
    async fn test_remove_requires_idle_unit() {
        let manager = ScheduleManager::new();
        manager.get_or_create("cam-1", 1, 16).unwrap();
        let job = idle_job("a");
        manager.start_job("cam-1", &job).unwrap();

        assert!(matches!(
            manager.remove("cam-1").await,
            Err(ScheduleError::UnitBusy { jobs: 1, .. })
        ));

        assert!(manager.stop_job("cam-1", &job));
        let removed = manager.remove("cam-1").await.unwrap();
        assert!(removed.is_stopped());
        assert!(!manager.contains("cam-1"));
    }

    #[tokio::test]
    async fn test_stop_all_removes_unit() {
        let manager = ScheduleManager::new();
        manager.get_or_create("cam-1", 1, 16).unwrap();
        manager.get_or_create("cam-2", 1, 16).unwrap();
        let job = idle_job("a");
        manager.start_job("cam-1", &job).unwrap();
        assert_eq!(manager.active_job_count("cam-1"), 1);

        assert!(manager.stop_all("cam-1").await);
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(manager.unit_keys(), vec!["cam-2".to_string()]);
        assert!(!manager.stop_all("cam-1").await);

        manager.finish().await;
        assert_eq!(manager.unit_count(), 0);
    }
}
