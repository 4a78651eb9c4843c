//! Task schedulers
//!
//! A [`Scheduler`] owns a pool of worker threads that run [`Task`](crate::Task)s.
//! Two policies are available: a single ready queue shared by every worker,
//! and per-worker LIFO deques with work stealing. Worker threads are started
//! lazily on the first submission. A process-wide default scheduler is
//! available through [`Scheduler::global`].

mod config;
#[allow(clippy::module_inception)]
mod scheduler;
mod stats;
mod worker;

pub use config::{SchedulerConfig, SchedulerPolicy};
pub use scheduler::Scheduler;
pub use stats::{SchedulerStats, WorkerStats};
