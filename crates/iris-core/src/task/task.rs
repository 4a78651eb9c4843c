//! Task structure and completion state

use crate::error::{BoxError, TaskError};
use crate::message::Value;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created or queued, not yet running
    Pending,
    /// Currently executing on a worker
    Running,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled before it ran
    Cancelled,
}

impl TaskState {
    /// Whether the task has reached a final state
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

type Work = Box<dyn FnOnce() -> Result<Value, BoxError> + Send + 'static>;
type Observer = Box<dyn FnOnce(&Task) + Send + 'static>;
type ReadyHook = Box<dyn FnOnce(Task) + Send + 'static>;

struct Core {
    state: TaskState,
    result: Option<Value>,
    error: Option<TaskError>,
    observers: Vec<Observer>,
    /// Unfinished tasks this one waits for
    dependencies: Vec<TaskId>,
    /// Runs once `dependencies` is empty
    on_ready: Option<ReadyHook>,
    /// The ready hook has run; the dependency set is frozen
    launched: bool,
}

impl Core {
    fn outcome(&self) -> Result<Value, TaskError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(self.result.clone().unwrap_or_default()),
        }
    }
}

struct Inner {
    id: TaskId,
    work: Mutex<Option<Work>>,
    composite: bool,
    scheduled: AtomicBool,
    core: Mutex<Core>,
    done: Condvar,
    children: Vec<Task>,
}

/// A schedulable, awaitable unit of work
///
/// `Task` is a cheap handle; clones refer to the same task. A task runs at
/// most once. Its outcome is either a [`Value`] or a [`TaskError`].
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

/// Non-owning reference to a task, used by combinators to reach their parent
#[derive(Clone)]
pub(crate) struct WeakTask(Weak<Inner>);

impl WeakTask {
    pub(crate) fn upgrade(&self) -> Option<Task> {
        self.0.upgrade().map(|inner| Task { inner })
    }
}

impl Task {
    /// Create a task from a fallible closure
    ///
    /// The closure's error, or a panic inside it, fails the task.
    pub fn new<F, T>(work: F) -> Self
    where
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
        T: Into<Value>,
    {
        let work: Work = Box::new(move || work().map(Into::into));
        Self::build(Some(work), false, Vec::new())
    }

    /// Create a task from an infallible closure
    pub fn from_fn<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move || {
            work();
            Ok(())
        })
    }

    /// Create a composite task owning `children`
    pub(crate) fn composite(children: Vec<Task>) -> Self {
        Self::build(None, true, children)
    }

    fn build(work: Option<Work>, composite: bool, children: Vec<Task>) -> Self {
        Task {
            inner: Arc::new(Inner {
                id: TaskId::new(),
                work: Mutex::new(work),
                composite,
                scheduled: AtomicBool::new(false),
                core: Mutex::new(Core {
                    state: TaskState::Pending,
                    result: None,
                    error: None,
                    observers: Vec::new(),
                    dependencies: Vec::new(),
                    on_ready: None,
                    launched: false,
                }),
                done: Condvar::new(),
                children,
            }),
        }
    }

    /// Get the task ID
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Get the current state
    pub fn state(&self) -> TaskState {
        self.inner.core.lock().state
    }

    /// Whether the task has reached a final state
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Whether this task was built by a combinator
    pub fn is_composite(&self) -> bool {
        self.inner.composite
    }

    /// Get the result (if completed)
    pub fn result(&self) -> Option<Value> {
        self.inner.core.lock().result.clone()
    }

    /// Get the error (if failed or cancelled)
    pub fn error(&self) -> Option<TaskError> {
        self.inner.core.lock().error.clone()
    }

    /// Get the outcome, or `None` while the task is unfinished
    pub fn outcome(&self) -> Option<Result<Value, TaskError>> {
        let core = self.inner.core.lock();
        core.state.is_finished().then(|| core.outcome())
    }

    /// Child tasks of a composite
    pub fn children(&self) -> &[Task] {
        &self.inner.children
    }

    /// Cancel the task if it has not started
    ///
    /// Returns `false` if the task is already running or finished; running
    /// tasks are never interrupted. A task waiting on dependencies stops
    /// waiting and is handed to its scheduler, which records the
    /// cancellation.
    pub fn cancel(&self) -> bool {
        let cancelled = self.finish_if(
            |state| state == TaskState::Pending,
            TaskState::Cancelled,
            Err(TaskError::Cancelled),
        );
        if cancelled {
            self.inner.work.lock().take();
            let hook = {
                let mut core = self.inner.core.lock();
                core.dependencies.clear();
                core.launched = true;
                core.on_ready.take()
            };
            if let Some(hook) = hook {
                hook(self.clone());
            }
        }
        cancelled
    }

    /// Hold this task back until `dependency` has finished
    ///
    /// A submitted task is not queued while it has unfinished dependencies.
    /// If a dependency is cancelled, this task is cancelled too; a failed
    /// dependency only releases it. Returns `false`, changing nothing, if
    /// the task has started, has already been queued, or `dependency` is
    /// this task or is already listed.
    pub fn add_dependency(&self, dependency: &Task) -> bool {
        if dependency.id() == self.id() || !self.block_on(dependency.id()) {
            return false;
        }
        let dependent = self.clone();
        dependency.on_finish(move |dependency| {
            if dependency.state() == TaskState::Cancelled
                && dependent.depends_on(dependency.id())
            {
                tracing::trace!(
                    task = %dependent.id(),
                    dependency = %dependency.id(),
                    "dependency cancelled"
                );
                dependent.cancel();
            }
            dependent.release(dependency.id());
        });
        true
    }

    /// Stop waiting for `dependency`
    ///
    /// Returns `false` if it was not a pending dependency. Removing the last
    /// one lets a submitted task be queued.
    pub fn remove_dependency(&self, dependency: &Task) -> bool {
        self.release(dependency.id())
    }

    /// Whether `dependency` is still holding this task back
    pub fn depends_on(&self, dependency: TaskId) -> bool {
        self.inner.core.lock().dependencies.contains(&dependency)
    }

    /// Number of unfinished dependencies
    pub fn dependency_count(&self) -> usize {
        self.inner.core.lock().dependencies.len()
    }

    /// Register an observer that runs once when the task finishes
    ///
    /// Observers run on the finishing thread. If the task has already
    /// finished, `f` runs immediately on the calling thread.
    pub fn on_finish<F>(&self, f: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        {
            let mut core = self.inner.core.lock();
            if !core.state.is_finished() {
                core.observers.push(Box::new(f));
                return;
            }
        }
        f(self);
    }

    /// Register a callback for successful completion
    pub fn on_success<F>(&self, f: F)
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        self.on_finish(move |task| {
            if let Some(value) = task.result() {
                f(&value);
            }
        });
    }

    /// Register an errback for failure or cancellation
    pub fn on_failure<F>(&self, f: F)
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.on_finish(move |task| {
            if let Some(err) = task.error() {
                f(&err);
            }
        });
    }

    /// Block until this task finishes and return its outcome
    ///
    /// Calling this from a scheduler worker for a task queued on the same
    /// scheduler can deadlock a single-worker pool.
    pub fn wait(&self) -> Result<Value, TaskError> {
        let mut core = self.inner.core.lock();
        while !core.state.is_finished() {
            self.inner.done.wait(&mut core);
        }
        core.outcome()
    }

    /// Block until this task finishes, with a timeout
    ///
    /// Returns `None` if the task is still unfinished when the timeout expires.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value, TaskError>> {
        let deadline = Instant::now() + timeout;
        let mut core = self.inner.core.lock();
        while !core.state.is_finished() {
            if self.inner.done.wait_until(&mut core, deadline).timed_out() {
                break;
            }
        }
        core.state.is_finished().then(|| core.outcome())
    }

    /// Record `dependency` without observing it
    ///
    /// The caller arranges for [`release`](Self::release) to be called when
    /// the dependency finishes.
    pub(crate) fn block_on(&self, dependency: TaskId) -> bool {
        let mut core = self.inner.core.lock();
        if core.state != TaskState::Pending
            || core.launched
            || core.dependencies.contains(&dependency)
        {
            return false;
        }
        core.dependencies.push(dependency);
        true
    }

    /// Drop `dependency` from the set; runs the ready hook if it was the last
    pub(crate) fn release(&self, dependency: TaskId) -> bool {
        let hook = {
            let mut core = self.inner.core.lock();
            let Some(pos) = core.dependencies.iter().position(|id| *id == dependency) else {
                return false;
            };
            core.dependencies.swap_remove(pos);
            if core.dependencies.is_empty() && core.on_ready.is_some() {
                core.launched = true;
                core.on_ready.take()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook(self.clone());
        }
        true
    }

    /// Run `hook` once the dependency set is empty
    ///
    /// Runs it on the calling thread when nothing is pending, otherwise on
    /// the thread that releases the last dependency. Returns whether it ran
    /// immediately.
    pub(crate) fn when_ready<F>(&self, hook: F) -> bool
    where
        F: FnOnce(Task) + Send + 'static,
    {
        {
            let mut core = self.inner.core.lock();
            if !core.dependencies.is_empty() && !core.launched {
                core.on_ready = Some(Box::new(hook));
                return false;
            }
            core.launched = true;
        }
        hook(self.clone());
        true
    }

    pub(crate) fn downgrade(&self) -> WeakTask {
        WeakTask(Arc::downgrade(&self.inner))
    }

    /// Claim the task for a scheduler
    pub(crate) fn mark_scheduled(&self) -> Result<(), crate::error::SchedulerError> {
        use crate::error::SchedulerError;
        if self.inner.composite {
            return Err(SchedulerError::Composite(self.id()));
        }
        if self.inner.scheduled.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadySubmitted(self.id()));
        }
        Ok(())
    }

    /// Run the task body on the current thread
    ///
    /// Returns the final state. A task cancelled while queued is skipped.
    pub(crate) fn execute(&self) -> TaskState {
        {
            let mut core = self.inner.core.lock();
            if core.state != TaskState::Pending {
                return core.state;
            }
            core.state = TaskState::Running;
        }

        let work = self.inner.work.lock().take();
        let outcome = match work {
            Some(work) => match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(TaskError::Failed(err.to_string())),
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            },
            None => Ok(Value::Unit),
        };

        let state = if outcome.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        self.settle(state, outcome);
        state
    }

    /// Move an unfinished task to a final state
    ///
    /// Returns `false` if the task had already finished.
    pub(crate) fn settle(&self, state: TaskState, outcome: Result<Value, TaskError>) -> bool {
        self.finish_if(|current| !current.is_finished(), state, outcome)
    }

    fn finish_if(
        &self,
        allowed: impl FnOnce(TaskState) -> bool,
        state: TaskState,
        outcome: Result<Value, TaskError>,
    ) -> bool {
        debug_assert!(state.is_finished());
        let observers = {
            let mut core = self.inner.core.lock();
            if !allowed(core.state) {
                return false;
            }
            core.state = state;
            match outcome {
                Ok(value) => core.result = Some(value),
                Err(err) => core.error = Some(err),
            }
            std::mem::take(&mut core.observers)
        };
        self.inner.done.notify_all();

        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(self))).is_err() {
                tracing::warn!(task = %self.id(), "task observer panicked");
            }
        }
        true
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("composite", &self.inner.composite)
            .field("children", &self.inner.children.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
