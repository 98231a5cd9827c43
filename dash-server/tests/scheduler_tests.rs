//! Scheduling behaviour across units, workers and timers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dash_server::scheduler::{Job, JobState, ScheduleError, ScheduleManager, task_fn};
use parking_lot::Mutex;

/// Tracks how many runs are in flight at once.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn slow_job(name: &str, interval: Duration, work: Duration, tracker: Arc<Concurrency>) -> Arc<Job> {
    Job::builder(name).interval(interval).build(task_fn(move || {
        let tracker = tracker.clone();
        async move {
            tracker.enter();
            tokio::time::sleep(work).await;
            tracker.exit();
            Ok(())
        }
    }))
}

#[tokio::test(start_paused = true)]
async fn test_priority_breaks_ties_for_coincident_fires() {
    let manager = ScheduleManager::new();
    manager.get_or_create("unit", 1, 16).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
        let order = order.clone();
        let job = Job::builder(name)
            .initial_delay(Duration::from_millis(10))
            .priority(priority)
            .build(task_fn(move || {
                let order = order.clone();
                async move {
                    order.lock().push(name);
                    Ok(())
                }
            }));
        manager.start_job("unit", &job).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*order.lock(), vec!["high", "mid", "low"]);

    manager.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_never_overlaps_itself() {
    let manager = ScheduleManager::new();
    let unit = manager.get_or_create("unit", 4, 16).unwrap();
    let tracker = Arc::new(Concurrency::default());

    // Run takes longer than the interval
    let job = slow_job(
        "slow",
        Duration::from_millis(5),
        Duration::from_millis(30),
        tracker.clone(),
    );
    unit.start(&job).unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    unit.stop(&job);

    assert_eq!(tracker.peak(), 1);
    assert!(job.fire_count() >= 2);

    manager.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_runs_jobs_in_parallel() {
    let manager = ScheduleManager::new();
    let unit = manager.get_or_create("unit", 2, 16).unwrap();
    let tracker = Arc::new(Concurrency::default());

    let a = slow_job("a", Duration::ZERO, Duration::from_millis(100), tracker.clone());
    let b = slow_job("b", Duration::ZERO, Duration::from_millis(100), tracker.clone());
    unit.start(&a).unwrap();
    unit.start(&b).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(tracker.peak(), 2);
    assert_eq!(a.state(), JobState::Completed);
    assert_eq!(b.state(), JobState::Completed);

    manager.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_yields_one_unit() {
    let manager = Arc::new(ScheduleManager::new());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.get_or_create("x", 5, 10).unwrap()
        }));
    }

    let mut units = Vec::new();
    for handle in handles {
        units.push(handle.await.unwrap());
    }

    assert_eq!(manager.unit_count(), 1);
    assert!(units.iter().all(|unit| Arc::ptr_eq(unit, &units[0])));
    assert_eq!(units[0].pool_size(), 5);

    manager.finish().await;
}

#[tokio::test]
async fn test_stop_all_lets_running_job_finish() {
    let manager = ScheduleManager::new();
    let unit = manager.get_or_create("unit", 1, 16).unwrap();
    let tracker = Arc::new(Concurrency::default());
    let finished = Arc::new(AtomicUsize::new(0));

    let job = {
        let finished = finished.clone();
        let tracker = tracker.clone();
        Job::builder("long")
            .interval(Duration::from_millis(10))
            .build(task_fn(move || {
                let finished = finished.clone();
                let tracker = tracker.clone();
                async move {
                    tracker.enter();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    tracker.exit();
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
    };
    unit.start(&job).unwrap();

    // Let the first run start, then stop mid-run
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(manager.stop_all("unit").await);

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(job.state(), JobState::Cancelled);
    assert!(matches!(unit.start(&job), Err(ScheduleError::Stopped(_))));

    // A cancelled job cannot be admitted anywhere else either
    let other = manager.get_or_create("other", 1, 16).unwrap();
    assert!(matches!(other.start(&job), Err(ScheduleError::Terminal(_))));

    manager.finish().await;
}
