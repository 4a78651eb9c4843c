//! Scheduler configuration

use crate::error::SchedulerError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How ready tasks are distributed across workers
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerPolicy {
    /// One ready queue shared by all workers
    #[default]
    SharedQueue,
    /// A private LIFO deque per worker; idle workers steal from the others
    WorkStealing,
}

impl fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerPolicy::SharedQueue => write!(f, "shared-queue"),
            SchedulerPolicy::WorkStealing => write!(f, "work-stealing"),
        }
    }
}

impl FromStr for SchedulerPolicy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" | "shared-queue" => Ok(SchedulerPolicy::SharedQueue),
            "ws" | "stealing" | "work-stealing" => Ok(SchedulerPolicy::WorkStealing),
            other => Err(SchedulerError::InvalidConfig(format!(
                "unknown scheduler policy {:?}",
                other
            ))),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of worker threads (0 = number of CPUs)
    pub workers: usize,

    /// Worker threads started on first use; more are added, up to
    /// `workers`, while ready tasks find every worker busy. `None` starts
    /// all of them at once.
    pub min_workers: Option<usize>,

    /// Task distribution policy
    pub policy: SchedulerPolicy,

    /// Maximum queued tasks accepted by [`Scheduler::submit`](super::Scheduler::submit)
    pub max_queued: Option<usize>,

    /// How long an idle worker parks before re-checking for work
    pub idle_timeout: Duration,

    /// Worker thread name prefix
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            min_workers: None,
            policy: SchedulerPolicy::SharedQueue,
            max_queued: None,
            idle_timeout: Duration::from_millis(10),
            thread_name: "iris-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Environment variable holding the maximum worker count
    pub const WORKERS_ENV: &'static str = "IRIS_SCHED_MAX";

    /// Environment variable holding the minimum worker count
    pub const MIN_WORKERS_ENV: &'static str = "IRIS_SCHED_MIN";

    /// Environment variable holding the policy name
    pub const POLICY_ENV: &'static str = "IRIS_SCHED_POLICY";

    /// Shared-queue configuration with `workers` threads
    pub fn shared(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Work-stealing configuration with `workers` threads
    pub fn work_stealing(workers: usize) -> Self {
        Self {
            workers,
            policy: SchedulerPolicy::WorkStealing,
            ..Self::default()
        }
    }

    /// Start with `min` workers and grow towards `workers` under load
    pub fn with_min_workers(mut self, min: usize) -> Self {
        self.min_workers = Some(min);
        self
    }

    /// Bound the number of queued tasks accepted by `submit`
    pub fn with_max_queued(mut self, limit: usize) -> Self {
        self.max_queued = Some(limit);
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Defaults overridden by `IRIS_SCHED_MAX`, `IRIS_SCHED_MIN` and
    /// `IRIS_SCHED_POLICY`
    pub fn from_env() -> Result<Self, SchedulerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SchedulerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(Self::WORKERS_ENV) {
            config.workers = parse_count(Self::WORKERS_ENV, &raw)?;
        }
        if let Some(raw) = lookup(Self::MIN_WORKERS_ENV) {
            config.min_workers = Some(parse_count(Self::MIN_WORKERS_ENV, &raw)?);
        }
        if let Some(raw) = lookup(Self::POLICY_ENV) {
            config.policy = raw.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check for values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_queued == Some(0) {
            return Err(SchedulerError::InvalidConfig(
                "max_queued must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "idle_timeout must be non-zero".to_string(),
            ));
        }
        match self.min_workers {
            Some(0) => Err(SchedulerError::InvalidConfig(
                "min_workers must be at least 1".to_string(),
            )),
            Some(min) if min > self.effective_workers() => {
                Err(SchedulerError::InvalidConfig(format!(
                    "min_workers ({}) exceeds the maximum of {} workers",
                    min,
                    self.effective_workers()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Maximum worker count with 0 resolved to the number of CPUs
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Workers started on first use
    pub fn effective_min_workers(&self) -> usize {
        self.min_workers
            .unwrap_or(usize::MAX)
            .min(self.effective_workers())
    }
}

fn parse_count(var: &str, raw: &str) -> Result<usize, SchedulerError> {
    raw.trim().parse().map_err(|_| {
        SchedulerError::InvalidConfig(format!("{} must be a worker count, got {:?}", var, raw))
    })
}
