//! Shared helpers for the iris-core integration tests

#![allow(dead_code)]

use iris_core::Scheduler;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

/// Generous upper bound for anything the tests wait on
pub const TIMEOUT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness (`RUST_LOG` to enable)
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Shared-queue scheduler with `workers` threads
pub fn shared_scheduler(workers: usize) -> Scheduler {
    init_tracing();
    Scheduler::with_workers(workers).expect("scheduler")
}

/// Work-stealing scheduler with `workers` threads
pub fn stealing_scheduler(workers: usize) -> Scheduler {
    init_tracing();
    Scheduler::work_stealing(workers).expect("scheduler")
}

/// Poll `condition` until it holds or [`TIMEOUT`] elapses
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
