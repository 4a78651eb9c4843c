//! Scheduler statistics

use super::config::SchedulerPolicy;
use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Worker index
    pub id: usize,

    /// Tasks retired by this worker
    pub executed: u64,

    /// Tasks this worker took from another worker's deque
    pub stolen: u64,
}

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Distribution policy
    pub policy: SchedulerPolicy,

    /// Maximum worker count
    pub workers: usize,

    /// Workers started on first use
    pub min_workers: usize,

    /// Worker threads currently alive
    pub live_workers: usize,

    /// Whether worker threads have been started
    pub started: bool,

    /// Tasks accepted for execution
    pub submitted: u64,

    /// Tasks that ran to completion, including failed ones
    pub completed: u64,

    /// Tasks that failed or panicked
    pub failed: u64,

    /// Tasks cancelled before they ran
    pub cancelled: u64,

    /// Tasks currently executing
    pub running: usize,

    /// Tasks accepted but not yet running, including blocked ones
    pub queued: usize,

    /// Queued tasks still waiting on dependencies
    pub blocked: usize,

    /// Per-worker counters
    pub per_worker: Vec<WorkerStats>,
}

impl SchedulerStats {
    /// Total steals across all workers
    pub fn total_stolen(&self) -> u64 {
        self.per_worker.iter().map(|w| w.stolen).sum()
    }

    /// Whether every accepted task has been retired
    pub fn is_drained(&self) -> bool {
        self.submitted == self.completed + self.cancelled
    }
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "scheduler ({}, {} of {} workers live)",
            self.policy, self.live_workers, self.workers
        )?;
        writeln!(f, "  submitted: {}", self.submitted)?;
        writeln!(f, "  completed: {}", self.completed)?;
        writeln!(f, "  failed:    {}", self.failed)?;
        writeln!(f, "  cancelled: {}", self.cancelled)?;
        writeln!(f, "  running:   {}", self.running)?;
        writeln!(f, "  queued:    {}", self.queued)?;
        write!(f, "  blocked:   {}", self.blocked)?;
        for worker in &self.per_worker {
            write!(
                f,
                "\n  worker {:>3}: executed {:>8}  stolen {:>8}",
                worker.id, worker.executed, worker.stolen
            )?;
        }
        Ok(())
    }
}

/// Live counters owned by one worker
#[derive(Default)]
pub(crate) struct WorkerCounters {
    executed: CachePadded<AtomicU64>,
    stolen: CachePadded<AtomicU64>,
}

impl WorkerCounters {
    pub(crate) fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stolen(&self) {
        self.stolen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, id: usize) -> WorkerStats {
        WorkerStats {
            id,
            executed: self.executed.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
        }
    }
}
