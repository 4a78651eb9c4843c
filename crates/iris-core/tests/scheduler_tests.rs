//! Scheduler and Task Combinator Integration Tests
//!
//! Covers both scheduling policies under load and the join combinators
//! running on real worker threads.
//!
//! # Running Tests
//! ```bash
//! cargo test --test scheduler_tests
//! ```

mod common;

use common::{shared_scheduler, stealing_scheduler, wait_until, TIMEOUT};
use iris_core::{
    all_of, any_of, Scheduler, SchedulerConfig, SchedulerPolicy, Task, TaskError, TaskState, Value,
};
use crossbeam::channel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn sleeper(ms: u64, value: i64) -> Task {
    Task::new(move || {
        thread::sleep(Duration::from_millis(ms));
        Ok(value)
    })
}

fn failing(ms: u64, reason: &'static str) -> Task {
    Task::new(move || -> Result<(), iris_core::BoxError> {
        thread::sleep(Duration::from_millis(ms));
        Err(reason.into())
    })
}

// ===== Policy Tests =====

#[test]
fn test_work_stealing_runs_everything() {
    let scheduler = stealing_scheduler(4);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..2000 {
        let counter = Arc::clone(&counter);
        scheduler
            .spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    assert!(scheduler.wait_idle(TIMEOUT));
    assert_eq!(counter.load(Ordering::SeqCst), 2000);

    let stats = scheduler.stats();
    assert_eq!(stats.policy, SchedulerPolicy::WorkStealing);
    assert_eq!(stats.submitted, 2000);
    assert_eq!(stats.completed, 2000);
    assert!(stats.is_drained());
    let executed: u64 = stats.per_worker.iter().map(|w| w.executed).sum();
    assert_eq!(executed, 2000);
}

#[test]
fn test_work_stealing_concurrent_producers() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 1000;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let configs = [
        SchedulerConfig::work_stealing(1),
        SchedulerConfig::work_stealing(3),
        SchedulerConfig::work_stealing(8),
        SchedulerConfig::work_stealing(4).with_min_workers(1),
    ];
    for config in configs {
        common::init_tracing();
        let workers = config.workers;
        let scheduler = Scheduler::new(config).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let scheduler = scheduler.clone();
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        let counter = Arc::clone(&counter);
                        scheduler
                            .spawn(move || {
                                counter.fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(scheduler.wait_idle(TIMEOUT), "{} workers never went idle", workers);
        assert_eq!(counter.load(Ordering::SeqCst), TOTAL);
        let stats = scheduler.stats();
        assert_eq!(stats.submitted, TOTAL as u64, "{} workers", workers);
        assert_eq!(stats.completed, TOTAL as u64, "{} workers", workers);
        assert!(stats.is_drained());
        assert_eq!(stats.per_worker.len(), workers);
        let executed: u64 = stats.per_worker.iter().map(|w| w.executed).sum();
        assert_eq!(executed, TOTAL as u64);
        scheduler.shutdown();
    }
}

#[test]
fn test_nested_spawns_on_work_stealing() {
    let scheduler = stealing_scheduler(4);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let inner = scheduler.clone();
        let counter = Arc::clone(&counter);
        scheduler
            .spawn(move || {
                for _ in 0..20 {
                    let counter = Arc::clone(&counter);
                    inner
                        .spawn(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
            .unwrap();
    }

    assert!(wait_until(|| counter.load(Ordering::SeqCst) == 1000));
    assert!(scheduler.wait_idle(TIMEOUT));
    assert_eq!(scheduler.stats().completed, 1050);
}

#[test]
fn test_shared_queue_spreads_blocking_work() {
    let scheduler = shared_scheduler(4);
    let tasks: Vec<Task> = (0..4).map(|i| sleeper(50, i)).collect();
    let start = std::time::Instant::now();
    for task in &tasks {
        scheduler.submit(task).unwrap();
    }
    for task in &tasks {
        task.wait().unwrap();
    }
    // Four workers run the four sleeps side by side
    assert!(start.elapsed() < Duration::from_millis(190));
}

#[test]
fn test_policy_from_config() {
    let config = SchedulerConfig::work_stealing(2).with_thread_name("iris-test");
    let scheduler = Scheduler::new(config).unwrap();
    assert_eq!(scheduler.policy(), SchedulerPolicy::WorkStealing);
    assert_eq!(scheduler.worker_count(), 2);
    let task = scheduler
        .spawn(|| assert!(thread::current().name().unwrap_or("").starts_with("iris-test")))
        .unwrap();
    assert_eq!(task.wait(), Ok(Value::Unit));
}

#[test]
fn test_shutdown_rejects_new_work() {
    let scheduler = shared_scheduler(2);
    let done = scheduler.spawn(|| {}).unwrap();
    done.wait().unwrap();

    scheduler.shutdown();
    assert!(scheduler.is_shut_down());
    assert!(scheduler.spawn(|| {}).is_err());
}

// ===== Combinator Tests =====

#[test]
fn test_all_of_on_scheduler() {
    let scheduler = stealing_scheduler(4);
    let children: Vec<Task> = (0..8).map(|i| sleeper(5, i)).collect();
    let joined = all_of(children.clone());
    for child in &children {
        scheduler.submit(child).unwrap();
    }

    assert_eq!(joined.wait(), Ok(Value::Unit));
    assert_eq!(joined.state(), TaskState::Completed);
    let values: Vec<i64> = joined
        .children()
        .iter()
        .map(|c| c.result().and_then(|v| v.as_int()).unwrap())
        .collect();
    assert_eq!(values, (0..8).collect::<Vec<_>>());
}

#[test]
fn test_all_of_waits_for_every_child() {
    let scheduler = shared_scheduler(4);
    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let gated = Task::new(move || {
        release_rx.recv()?;
        Ok(1i64)
    });
    let bad = failing(1, "disk on fire");
    let joined = all_of([gated.clone(), bad.clone()]);
    scheduler.submit(&gated).unwrap();
    scheduler.submit(&bad).unwrap();

    assert_eq!(bad.wait(), Err(TaskError::Failed("disk on fire".into())));
    // The failure is recorded, but the sibling is still running
    assert!(joined.wait_timeout(Duration::from_millis(50)).is_none());
    assert_eq!(joined.state(), TaskState::Pending);
    assert!(!gated.is_finished());

    release_tx.send(()).unwrap();
    assert_eq!(
        joined.wait_timeout(TIMEOUT),
        Some(Err(TaskError::Failed("disk on fire".into())))
    );
    assert_eq!(gated.result(), Some(Value::Int(1)));
}

#[test]
fn test_any_of_first_success_wins() {
    let scheduler = shared_scheduler(4);
    let fast = sleeper(5, 1);
    let slow = sleeper(150, 2);
    let race = any_of([slow.clone(), fast.clone()]);
    scheduler.submit(&slow).unwrap();
    scheduler.submit(&fast).unwrap();

    assert_eq!(race.wait(), Ok(Value::Int(1)));
    assert_eq!(slow.wait(), Ok(Value::Int(2)));
    assert_eq!(race.result(), Some(Value::Int(1)));
}

#[test]
fn test_any_of_all_fail_reports_first_error() {
    let scheduler = shared_scheduler(2);
    let first = failing(1, "first");
    let second = failing(60, "second");
    let race = any_of([first.clone(), second.clone()]);
    scheduler.submit(&first).unwrap();
    scheduler.submit(&second).unwrap();

    assert_eq!(race.wait(), Err(TaskError::Failed("first".into())));
    assert!(second.is_finished());
}

#[test]
fn test_nested_combinators() {
    let scheduler = stealing_scheduler(4);
    let a = sleeper(5, 1);
    let b = sleeper(5, 2);
    let c = failing(5, "nope");
    let d = sleeper(10, 4);

    let joined = all_of([any_of([a.clone(), c.clone()]), any_of([b.clone(), d.clone()])]);
    for task in [&a, &b, &c, &d] {
        scheduler.submit(task).unwrap();
    }

    assert_eq!(joined.wait_timeout(TIMEOUT), Some(Ok(Value::Unit)));
    assert!(scheduler.submit(&joined).is_err());
}

// ===== Dependency Tests =====

#[test]
fn test_dependency_chain_runs_in_order() {
    let scheduler = stealing_scheduler(4);
    let order = Arc::new(Mutex::new(Vec::new()));
    let chain: Vec<Task> = (0..10)
        .map(|i| {
            let order = Arc::clone(&order);
            Task::from_fn(move || order.lock().push(i))
        })
        .collect();
    for pair in chain.windows(2) {
        assert!(pair[1].add_dependency(&pair[0]));
    }

    // Submitted back to front; dependencies still decide the order
    for task in chain.iter().rev() {
        scheduler.submit(task).unwrap();
    }
    assert!(chain[9].wait_timeout(TIMEOUT).is_some());
    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    assert!(scheduler.wait_idle(TIMEOUT));
    assert_eq!(scheduler.stats().completed, 10);
}

#[test]
fn test_cancelled_dependency_cancels_chain() {
    let scheduler = shared_scheduler(2);
    let root = Task::from_fn(|| {});
    let middle = Task::from_fn(|| {});
    let leaf = Task::from_fn(|| {});
    middle.add_dependency(&root);
    leaf.add_dependency(&middle);
    scheduler.submit(&leaf).unwrap();
    scheduler.submit(&middle).unwrap();

    assert!(root.cancel());
    assert_eq!(middle.wait_timeout(TIMEOUT), Some(Err(TaskError::Cancelled)));
    assert_eq!(leaf.wait_timeout(TIMEOUT), Some(Err(TaskError::Cancelled)));
    assert!(scheduler.wait_idle(TIMEOUT));
    let stats = scheduler.stats();
    assert_eq!(stats.cancelled, 2);
    assert_eq!(stats.blocked, 0);
    assert!(stats.is_drained());
}

#[test]
fn test_failed_dependency_still_releases() {
    let scheduler = shared_scheduler(2);
    let bad = failing(1, "upstream");
    let after = Task::new(|| Ok("ran"));
    after.add_dependency(&bad);
    scheduler.submit(&after).unwrap();
    scheduler.submit(&bad).unwrap();
    assert_eq!(after.wait_timeout(TIMEOUT), Some(Ok(Value::from("ran"))));
}

// ===== Global Scheduler Tests =====

#[test]
fn test_global_scheduler_runs_tasks() {
    common::init_tracing();
    let global = Scheduler::global();
    assert!(global.same_as(&Scheduler::global()));

    let task = global.spawn(|| {}).unwrap();
    assert_eq!(task.wait_timeout(TIMEOUT), Some(Ok(Value::Unit)));
    global.print_stat();
}
