//! Subcommand implementations

pub mod basic;
pub mod coordinator;

use anyhow::{bail, Context};
use clap::Args;
use iris_core::{Scheduler, SchedulerConfig, SchedulerPolicy};
use std::thread;
use std::time::{Duration, Instant};

/// How long a demo waits for its messages before giving up
const DEMO_TIMEOUT: Duration = Duration::from_secs(60);

/// Scheduler flags shared by every demo
#[derive(Debug, Clone, Args)]
pub struct SchedulerArgs {
    /// Worker threads (0 = one per CPU)
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,

    /// Worker threads to start with; the pool grows to --workers under load
    #[arg(long, value_name = "N")]
    pub min_workers: Option<usize>,

    /// Scheduling policy: shared-queue or work-stealing
    #[arg(short, long, default_value_t = SchedulerPolicy::WorkStealing)]
    pub policy: SchedulerPolicy,
}

impl SchedulerArgs {
    pub fn build(&self) -> anyhow::Result<Scheduler> {
        let config = SchedulerConfig {
            workers: self.workers,
            min_workers: self.min_workers,
            policy: self.policy,
            ..SchedulerConfig::default()
        };
        Scheduler::new(config).context("failed to create scheduler")
    }
}

/// Poll until `done` holds or the demo timeout elapses
pub fn wait_for(what: &str, mut done: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = Instant::now() + DEMO_TIMEOUT;
    while !done() {
        if Instant::now() >= deadline {
            bail!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Messages per second, guarding against a zero elapsed time
pub fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}
