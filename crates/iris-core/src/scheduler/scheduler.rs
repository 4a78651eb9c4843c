//! Scheduler handle and shared pool state

use super::config::{SchedulerConfig, SchedulerPolicy};
use super::stats::{SchedulerStats, WorkerCounters};
use super::worker;
use crate::error::SchedulerError;
use crate::task::{Task, TaskState};
use crossbeam::utils::Backoff;
use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(1);

/// Process-wide default scheduler
static GLOBAL: Lazy<RwLock<Option<Scheduler>>> = Lazy::new(|| RwLock::new(None));

/// State shared between the scheduler handle and its worker threads
pub(super) struct Shared {
    /// Distinguishes schedulers in worker thread-locals
    pub(super) id: usize,
    pub(super) config: SchedulerConfig,
    /// Upper bound on worker threads
    workers: usize,
    /// Worker threads started on first use
    min_workers: usize,

    /// Global ready queue (the only queue under `SharedQueue`)
    pub(super) injector: Injector<Task>,

    /// Stealers for the per-worker deques (`WorkStealing` only)
    pub(super) stealers: OnceCell<Vec<Stealer<Task>>>,

    pub(super) counters: Vec<WorkerCounters>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Deques for workers not spawned yet, indexed by worker
    spare_deques: Mutex<Vec<Option<Deque<Task>>>>,
    /// Worker threads spawned so far; never exceeds `workers`
    spawned: AtomicUsize,
    started: AtomicBool,
    pub(super) shutdown: AtomicBool,
    live_workers: AtomicUsize,

    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    running: AtomicUsize,
    queued: AtomicUsize,
    blocked: AtomicUsize,

    /// Parked workers
    sleepers: AtomicUsize,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

impl Shared {
    pub(super) fn new(config: SchedulerConfig) -> Self {
        let workers = config.effective_workers();
        let min_workers = config.effective_min_workers();
        Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            workers,
            min_workers,
            injector: Injector::new(),
            stealers: OnceCell::new(),
            counters: (0..workers).map(|_| WorkerCounters::default()).collect(),
            threads: Mutex::new(Vec::new()),
            spare_deques: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            live_workers: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
        }
    }

    /// Spawn the first `min_workers` threads on first use
    fn ensure_started(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut threads = self.threads.lock();
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        // Every deque exists up front so the stealer list never changes
        if self.config.policy == SchedulerPolicy::WorkStealing {
            let deques: Vec<Deque<Task>> = (0..self.workers).map(|_| Deque::new_lifo()).collect();
            let _ = self.stealers.set(deques.iter().map(Deque::stealer).collect());
            *self.spare_deques.lock() = deques.into_iter().map(Some).collect();
        }

        for _ in 0..self.min_workers {
            if let Err(err) = self.spawn_worker(&mut threads) {
                self.signal_shutdown();
                return Err(err);
            }
        }

        self.started.store(true, Ordering::Release);
        debug!(
            scheduler = self.id,
            workers = self.min_workers,
            max_workers = self.workers,
            policy = %self.config.policy,
            "scheduler started"
        );
        Ok(())
    }

    /// Spawn the next worker; the caller holds the `threads` lock
    fn spawn_worker(
        self: &Arc<Self>,
        threads: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), SchedulerError> {
        let index = self.spawned.load(Ordering::SeqCst);
        debug_assert!(index < self.workers);
        let local = self
            .spare_deques
            .lock()
            .get_mut(index)
            .and_then(Option::take);

        let shared = Arc::clone(self);
        self.live_workers.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name, index))
            .spawn(move || worker::run(shared, index, local));
        match spawned {
            Ok(handle) => {
                threads.push(handle);
                self.spawned.store(index + 1, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.live_workers.fetch_sub(1, Ordering::SeqCst);
                warn!(
                    scheduler = self.id,
                    worker = index,
                    error = %err,
                    "failed to spawn worker thread"
                );
                Err(err.into())
            }
        }
    }

    /// Add a worker when a ready task finds every started worker busy
    fn grow(self: &Arc<Self>) {
        if self.spawned.load(Ordering::SeqCst) >= self.workers
            || self.sleepers.load(Ordering::SeqCst) > 0
            || !self.started.load(Ordering::Acquire)
        {
            return;
        }
        // Another thread is already starting or growing the pool
        let Some(mut threads) = self.threads.try_lock() else {
            return;
        };
        if self.shutdown.load(Ordering::SeqCst)
            || self.spawned.load(Ordering::SeqCst) >= self.workers
        {
            return;
        }
        if self.spawn_worker(&mut threads).is_ok() {
            trace!(
                scheduler = self.id,
                workers = self.spawned.load(Ordering::SeqCst),
                "added worker for backlog"
            );
        }
    }

    /// Queue a ready task: onto the caller's own deque when it is one of our
    /// work-stealing workers, otherwise onto the global queue
    fn push(self: &Arc<Self>, task: Task) {
        if let Err(task) = worker::push_local(self.id, task) {
            self.injector.push(task);
        }
        self.notify_one();
        self.grow();

        // Lost a race with shutdown after every worker already left
        if self.shutdown.load(Ordering::SeqCst) && self.live_workers.load(Ordering::SeqCst) == 0 {
            self.cancel_leftovers();
        }
    }

    /// Ready hook of every submitted task; runs once its dependencies
    /// are released, which is immediately for most tasks
    fn push_released(self: &Arc<Self>, task: Task) {
        self.blocked.fetch_sub(1, Ordering::SeqCst);
        trace!(scheduler = self.id, task = %task.id(), "task queued");
        self.push(task);
    }

    /// Execute a task taken from a queue and record its outcome
    pub(super) fn run_task(self: &Arc<Self>, index: usize, task: Task) {
        self.running.fetch_add(1, Ordering::SeqCst);
        self.queued.fetch_sub(1, Ordering::SeqCst);
        if self.has_visible_work() {
            self.grow();
        }

        match task.execute() {
            TaskState::Completed => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            TaskState::Failed => {
                debug!(task = %task.id(), error = ?task.error(), "task failed");
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            TaskState::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
            }
            TaskState::Pending | TaskState::Running => {}
        }
        self.counters[index].record_executed();
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Park the calling worker until work arrives or the idle timeout expires
    pub(super) fn park(&self) {
        let mut guard = self.idle_lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);
        if !self.has_visible_work() && !self.shutdown.load(Ordering::SeqCst) {
            self.idle_cv.wait_for(&mut guard, self.config.idle_timeout);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether any queue a worker can take from holds a task
    pub(super) fn has_visible_work(&self) -> bool {
        !self.injector.is_empty()
            || self
                .stealers
                .get()
                .is_some_and(|stealers| stealers.iter().any(|s| !s.is_empty()))
    }

    fn notify_one(&self) {
        atomic::fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = self.idle_lock.lock();
            self.idle_cv.notify_one();
        }
    }

    fn notify_all(&self) {
        let _guard = self.idle_lock.lock();
        self.idle_cv.notify_all();
    }

    pub(super) fn signal_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            debug!(scheduler = self.id, "scheduler shutting down");
        }
        self.notify_all();
    }

    pub(super) fn worker_exited(&self) {
        if self.live_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cancel_leftovers();
        }
    }

    /// Cancel tasks that no worker will pick up any more
    fn cancel_leftovers(&self) {
        let backoff = Backoff::new();
        let mut count = 0usize;
        loop {
            match self.injector.steal() {
                Steal::Success(task) => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    task.cancel();
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    count += 1;
                }
                Steal::Retry => backoff.spin(),
                Steal::Empty => break,
            }
        }
        if count > 0 {
            debug!(scheduler = self.id, count, "cancelled tasks left after shutdown");
        }
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            policy: self.config.policy,
            workers: self.workers,
            min_workers: self.min_workers,
            live_workers: self.live_workers.load(Ordering::SeqCst),
            started: self.started.load(Ordering::Acquire),
            submitted: self.submitted.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            blocked: self.blocked.load(Ordering::SeqCst),
            per_worker: self
                .counters
                .iter()
                .enumerate()
                .map(|(id, counters)| counters.snapshot(id))
                .collect(),
        }
    }
}

/// Owner side of a scheduler; dropping the last one stops the workers
struct Handle {
    shared: Arc<Shared>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.signal_shutdown();
    }
}

/// Thread-pool task scheduler
///
/// `Scheduler` is a cheap handle; clones share one pool. When the last
/// handle is dropped the workers drain their queues and exit in the
/// background. Call [`shutdown`](Self::shutdown) to wait for that.
#[derive(Clone)]
pub struct Scheduler {
    handle: Arc<Handle>,
}

impl Scheduler {
    /// Create a scheduler; worker threads start on the first submission
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    /// Shared-queue scheduler with `workers` threads (0 = number of CPUs)
    pub fn with_workers(workers: usize) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::shared(workers))
    }

    /// Work-stealing scheduler with `workers` threads (0 = number of CPUs)
    pub fn work_stealing(workers: usize) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::work_stealing(workers))
    }

    fn from_config(config: SchedulerConfig) -> Self {
        Self {
            handle: Arc::new(Handle {
                shared: Arc::new(Shared::new(config)),
            }),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    /// Get the configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared().config
    }

    /// Get the distribution policy
    pub fn policy(&self) -> SchedulerPolicy {
        self.shared().config.policy
    }

    /// Maximum number of worker threads
    pub fn worker_count(&self) -> usize {
        self.shared().workers
    }

    /// Worker threads spawned so far
    pub fn live_worker_count(&self) -> usize {
        self.shared().spawned.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same pool
    pub fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    /// Whether the calling thread is one of this scheduler's workers
    pub fn is_current(&self) -> bool {
        worker::current_worker(self.shared().id).is_some()
    }

    /// Submit a task for execution
    ///
    /// A task with unfinished dependencies is accepted and counted as
    /// queued, but only becomes runnable once they are released. Fails
    /// with [`SchedulerError::Exhausted`] when `max_queued` tasks are
    /// already waiting; the task is left untouched and may be resubmitted.
    pub fn submit(&self, task: &Task) -> Result<(), SchedulerError> {
        self.enqueue(task, true)
    }

    /// Submit without the `max_queued` bound; used for receiver dispatch,
    /// where the port is the buffer
    pub(crate) fn dispatch(&self, task: &Task) -> Result<(), SchedulerError> {
        self.enqueue(task, false)
    }

    /// Wrap a closure in a task and submit it
    pub fn spawn<F>(&self, f: F) -> Result<Task, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task::from_fn(f);
        self.submit(&task)?;
        Ok(task)
    }

    fn enqueue(&self, task: &Task, bounded: bool) -> Result<(), SchedulerError> {
        let shared = self.shared();
        if shared.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        match (bounded, shared.config.max_queued) {
            (true, Some(limit)) => {
                let reserved = shared.queued.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| {
                    (q < limit).then_some(q + 1)
                });
                if reserved.is_err() {
                    warn!(scheduler = shared.id, limit, "scheduler queue full, rejecting task");
                    return Err(SchedulerError::Exhausted { limit });
                }
            }
            _ => {
                shared.queued.fetch_add(1, Ordering::SeqCst);
            }
        }

        if let Err(err) = task.mark_scheduled().and_then(|()| shared.ensure_started()) {
            shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }

        shared.submitted.fetch_add(1, Ordering::SeqCst);
        shared.blocked.fetch_add(1, Ordering::SeqCst);
        let ready = Arc::clone(shared);
        if task.when_ready(move |task| ready.push_released(task)) {
            return Ok(());
        }
        trace!(
            scheduler = shared.id,
            task = %task.id(),
            dependencies = task.dependency_count(),
            "task waiting on dependencies"
        );
        Ok(())
    }

    /// Snapshot of the scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        self.shared().stats()
    }

    /// Alias of [`stats`](Self::stats)
    pub fn stat_snapshot(&self) -> SchedulerStats {
        self.stats()
    }

    /// Print the counters to stdout
    pub fn print_stat(&self) {
        println!("{}", self.stats());
    }

    /// Block until no task is queued or running
    ///
    /// Returns `false` if the timeout expires first. Tasks still waiting on
    /// dependencies count as queued. Must not be called from one of this
    /// scheduler's own workers.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let shared = self.shared();
        let deadline = Instant::now() + timeout;
        loop {
            if shared.queued.load(Ordering::SeqCst) == 0
                && shared.running.load(Ordering::SeqCst) == 0
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Whether shutdown has been requested
    pub fn is_shut_down(&self) -> bool {
        self.shared().shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work, let the workers drain their queues and join them
    ///
    /// Tasks that are still queued once every worker has exited are
    /// cancelled. When called from a worker of this scheduler, that worker
    /// is not joined.
    pub fn shutdown(&self) {
        let shared = self.shared();
        shared.signal_shutdown();

        let threads = std::mem::take(&mut *shared.threads.lock());
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(scheduler = shared.id, "worker thread panicked");
            }
        }
        shared.cancel_leftovers();
    }

    /// The process-wide default scheduler, created on first use
    ///
    /// Its configuration comes from [`SchedulerConfig::from_env`]; invalid
    /// environment values are logged and the defaults are used instead.
    pub fn global() -> Scheduler {
        if let Some(scheduler) = GLOBAL.read().as_ref() {
            return scheduler.clone();
        }
        let mut slot = GLOBAL.write();
        slot.get_or_insert_with(|| {
            let config = SchedulerConfig::from_env().unwrap_or_else(|err| {
                warn!(error = %err, "ignoring invalid scheduler environment");
                SchedulerConfig::default()
            });
            debug!(
                workers = config.workers,
                policy = %config.policy,
                "creating default scheduler"
            );
            Scheduler::from_config(config)
        })
        .clone()
    }

    /// Replace the process-wide default, returning the previous one
    pub fn set_global(scheduler: Scheduler) -> Option<Scheduler> {
        GLOBAL.write().replace(scheduler)
    }

    /// Shut down and forget the process-wide default
    ///
    /// A later call to [`global`](Self::global) creates a fresh scheduler.
    pub fn shutdown_global() {
        let previous = GLOBAL.write().take();
        if let Some(scheduler) = previous {
            scheduler.shutdown();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared();
        f.debug_struct("Scheduler")
            .field("id", &shared.id)
            .field("policy", &shared.config.policy)
            .field("workers", &shared.workers)
            .field("live_workers", &shared.spawned.load(Ordering::Relaxed))
            .field("shut_down", &shared.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crossbeam::channel;

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::with_workers(4).unwrap();
        assert_eq!(scheduler.worker_count(), 4);
        assert_eq!(scheduler.policy(), SchedulerPolicy::SharedQueue);
        assert!(!scheduler.stats().started);
    }

    #[test]
    fn test_scheduler_default_workers() {
        let scheduler = Scheduler::with_workers(0).unwrap();
        assert_eq!(scheduler.worker_count(), num_cpus::get());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Scheduler::new(SchedulerConfig::shared(1).with_max_queued(0));
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn test_spawn_and_wait() {
        let scheduler = Scheduler::with_workers(2).unwrap();
        let task = scheduler.spawn(|| {}).unwrap();
        assert!(task.wait_timeout(Duration::from_secs(5)).is_some());
        assert!(scheduler.stats().started);

        let task = Task::new(|| Ok(7));
        scheduler.submit(&task).unwrap();
        assert_eq!(task.wait(), Ok(crate::message::Value::Int(7)));
    }

    #[test]
    fn test_submit_twice_rejected() {
        let scheduler = Scheduler::with_workers(1).unwrap();
        let task = Task::from_fn(|| {});
        scheduler.submit(&task).unwrap();
        assert!(matches!(
            scheduler.submit(&task),
            Err(SchedulerError::AlreadySubmitted(_))
        ));
        task.wait().unwrap();
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert_eq!(scheduler.stats().submitted, 1);
    }

    #[test]
    fn test_composite_rejected() {
        let scheduler = Scheduler::with_workers(1).unwrap();
        let all = crate::task::all_of(vec![Task::from_fn(|| {})]);
        assert!(matches!(
            scheduler.submit(&all),
            Err(SchedulerError::Composite(_))
        ));
    }

    #[test]
    fn test_failed_and_panicked_tasks_counted() {
        let scheduler = Scheduler::with_workers(2).unwrap();
        let failing = Task::new(|| -> Result<(), BoxError> { Err("nope".into()) });
        let panicking = Task::from_fn(|| panic!("worker must survive"));
        scheduler.submit(&failing).unwrap();
        scheduler.submit(&panicking).unwrap();
        assert!(failing.wait().is_err());
        assert!(panicking.wait().is_err());

        let after = scheduler.spawn(|| {}).unwrap();
        assert!(after.wait().is_ok());

        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        let stats = scheduler.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 3);
    }

    #[test]
    fn test_max_queued_exhausted() {
        let scheduler = Scheduler::new(SchedulerConfig::shared(1).with_max_queued(2)).unwrap();
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let blocker = scheduler
            .spawn(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            let stats = scheduler.stats();
            stats.running == 1 && stats.queued == 0
        }));

        scheduler.spawn(|| {}).unwrap();
        scheduler.spawn(|| {}).unwrap();
        let rejected = Task::from_fn(|| {});
        assert!(matches!(
            scheduler.submit(&rejected),
            Err(SchedulerError::Exhausted { limit: 2 })
        ));

        release_tx.send(()).unwrap();
        blocker.wait().unwrap();
        assert!(scheduler.wait_idle(Duration::from_secs(5)));

        // The rejected task was left untouched and can be resubmitted
        scheduler.submit(&rejected).unwrap();
        assert!(rejected.wait().is_ok());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let scheduler = Scheduler::with_workers(1).unwrap();
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        scheduler
            .spawn(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        let queued: Vec<Task> = (0..10).map(|_| scheduler.spawn(|| {}).unwrap()).collect();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            release_tx.send(()).unwrap();
        });
        scheduler.shutdown();
        releaser.join().unwrap();

        assert!(queued.iter().all(|t| t.state() == TaskState::Completed));
        assert!(scheduler.is_shut_down());
        assert!(matches!(scheduler.spawn(|| {}), Err(SchedulerError::ShutDown)));
        let stats = scheduler.stats();
        assert_eq!(stats.submitted, 11);
        assert_eq!(stats.completed, 11);
    }

    #[test]
    fn test_work_stealing_runs_everything() {
        let scheduler = Scheduler::work_stealing(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let counter = counter.clone();
            scheduler
                .spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert!(scheduler.wait_idle(Duration::from_secs(10)));
        assert_eq!(counter.load(Ordering::SeqCst), 1000);

        let stats = scheduler.stats();
        assert_eq!(stats.submitted, 1000);
        assert_eq!(stats.completed, 1000);
        let executed: u64 = stats.per_worker.iter().map(|w| w.executed).sum();
        assert_eq!(executed, 1000);
    }

    #[test]
    fn test_nested_spawn_from_worker() {
        let scheduler = Scheduler::work_stealing(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = scheduler.clone();
        let count = counter.clone();
        scheduler
            .spawn(move || {
                assert!(inner.is_current());
                for _ in 0..100 {
                    let count = count.clone();
                    inner
                        .spawn(move || {
                            count.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(10), || counter.load(Ordering::SeqCst) == 100));
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert_eq!(scheduler.stats().completed, 101);
        assert!(!scheduler.is_current());
    }

    #[test]
    fn test_min_workers_start_small_and_grow() {
        let config = SchedulerConfig::shared(4).with_min_workers(1);
        let scheduler = Scheduler::new(config).unwrap();
        assert_eq!(scheduler.live_worker_count(), 0);

        let (release_tx, release_rx) = channel::unbounded::<()>();
        let blockers: Vec<Task> = (0..3)
            .map(|_| {
                let release = release_rx.clone();
                scheduler
                    .spawn(move || {
                        let _ = release.recv();
                    })
                    .unwrap()
            })
            .collect();

        // Three tasks block at once, so the pool must have grown to three
        assert!(wait_until(Duration::from_secs(10), || {
            scheduler.stats().running == 3
        }));
        let live = scheduler.live_worker_count();
        assert!((3..=4).contains(&live), "live workers: {}", live);
        assert_eq!(scheduler.stats().min_workers, 1);

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        for task in &blockers {
            assert!(task.wait().is_ok());
        }
        scheduler.shutdown();
        assert!(scheduler.live_worker_count() <= 4);
        assert_eq!(scheduler.stats().live_workers, 0);
    }

    #[test]
    fn test_growth_stops_at_max_workers() {
        let config = SchedulerConfig::work_stealing(2).with_min_workers(1);
        let scheduler = Scheduler::new(config).unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let tasks: Vec<Task> = (0..6)
            .map(|_| {
                let release = release_rx.clone();
                scheduler
                    .spawn(move || {
                        let _ = release.recv();
                    })
                    .unwrap()
            })
            .collect();

        assert!(wait_until(Duration::from_secs(10), || {
            scheduler.stats().running == 2
        }));
        assert_eq!(scheduler.live_worker_count(), 2);

        for _ in 0..6 {
            release_tx.send(()).unwrap();
        }
        for task in &tasks {
            assert!(task.wait().is_ok());
        }
        assert_eq!(scheduler.live_worker_count(), 2);
    }

    #[test]
    fn test_park_returns_when_peer_deque_has_work() {
        let mut config = SchedulerConfig::work_stealing(2);
        config.idle_timeout = Duration::from_secs(5);
        let shared = Shared::new(config);
        let deques = [Deque::new_lifo(), Deque::new_lifo()];
        let _ = shared
            .stealers
            .set(deques.iter().map(Deque::stealer).collect());
        assert!(!shared.has_visible_work());

        deques[1].push(Task::from_fn(|| {}));
        assert!(shared.has_visible_work());

        let start = Instant::now();
        shared.park();
        assert!(start.elapsed() < Duration::from_secs(1));

        deques[1].pop().unwrap();
        assert!(!shared.has_visible_work());
    }

    #[test]
    fn test_dependent_task_waits_for_dependency() {
        let scheduler = Scheduler::with_workers(2).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = order.clone();
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let first = Task::from_fn(move || {
            let _ = release_rx.recv();
            log.lock().push("first");
        });
        let log = order.clone();
        let second = Task::from_fn(move || log.lock().push("second"));
        assert!(second.add_dependency(&first));

        scheduler.submit(&second).unwrap();
        let stats = scheduler.stats();
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(second.state(), TaskState::Pending);

        scheduler.submit(&first).unwrap();
        release_tx.send(()).unwrap();
        assert!(second.wait().is_ok());
        assert_eq!(*order.lock(), vec!["first", "second"]);

        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        let stats = scheduler.stats();
        assert_eq!(stats.blocked, 0);
        assert_eq!(stats.completed, 2);
    }

    #[test]
    fn test_cancelled_dependency_retires_dependent() {
        let scheduler = Scheduler::with_workers(1).unwrap();
        let dependency = Task::from_fn(|| {});
        let dependent = Task::from_fn(|| panic!("must not run"));
        dependent.add_dependency(&dependency);
        scheduler.submit(&dependent).unwrap();

        dependency.cancel();
        assert_eq!(dependent.wait(), Err(crate::error::TaskError::Cancelled));
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        let stats = scheduler.stats();
        assert_eq!(stats.cancelled, 1);
        assert!(stats.is_drained());
    }

    #[test]
    fn test_global_is_shared() {
        let a = Scheduler::global();
        let b = Scheduler::global();
        assert!(a.same_as(&b));
    }

    #[test]
    fn test_stats_display_mentions_policy() {
        let scheduler = Scheduler::work_stealing(2).unwrap();
        let text = scheduler.stats().to_string();
        assert!(text.contains("work-stealing"));
    }
}
