//! `all_of` and `any_of`
//!
//! A composite task depends on each of its children. Every child releases
//! its dependency when it finishes, and the composite settles from its ready
//! hook once the last one is gone. Children reach the composite only through
//! a weak reference, so dropping every handle to a composite releases it
//! even while children are still queued.

use super::task::{Task, TaskState, WeakTask};
use crate::error::TaskError;
use crate::message::Value;
use parking_lot::Mutex;
use std::sync::Arc;

/// First unsuccessful child outcome seen by a composite
type FirstOutcome = Arc<Mutex<Option<(TaskState, TaskError)>>>;

/// Make `parent` depend on every child, calling `on_child` as each finishes
///
/// `on_child` runs before the child's dependency is released.
fn watch_children<F>(parent: &Task, on_child: F)
where
    F: Fn(&Task, &Task) + Clone + Send + 'static,
{
    for child in parent.children() {
        parent.block_on(child.id());
    }
    for child in parent.children() {
        let weak: WeakTask = parent.downgrade();
        let on_child = on_child.clone();
        child.on_finish(move |child| {
            let Some(parent) = weak.upgrade() else {
                return;
            };
            on_child(&parent, child);
            parent.release(child.id());
        });
    }
}

fn record_first(first: &FirstOutcome, child: &Task) {
    let state = child.state();
    if state == TaskState::Completed {
        return;
    }
    let mut first = first.lock();
    if first.is_none() {
        *first = Some((state, child.error().unwrap_or(TaskError::Cancelled)));
    }
}

/// Build a task that completes when every child completes
///
/// The composite stays pending until every child has finished. If any child
/// failed or was cancelled, the composite ends in the state and error of the
/// first such child; later ones are observed but do not overwrite it. An
/// empty input completes immediately. The result of a successful composite
/// is [`Value::Unit`]; per-child results stay available on
/// [`Task::children`].
pub fn all_of<I>(tasks: I) -> Task
where
    I: IntoIterator<Item = Task>,
{
    let parent = Task::composite(tasks.into_iter().collect());
    let first: FirstOutcome = Arc::new(Mutex::new(None));

    let seen = Arc::clone(&first);
    watch_children(&parent, move |_, child| record_first(&seen, child));

    parent.when_ready(move |parent| {
        let outcome = first.lock().take();
        match outcome {
            Some((state, err)) => {
                tracing::trace!(
                    task = %parent.id(),
                    error = %err,
                    "all_of finished unsuccessfully"
                );
                parent.settle(state, Err(err));
            }
            None => {
                parent.settle(TaskState::Completed, Ok(Value::Unit));
            }
        }
    });
    parent
}

/// Build a task that completes with the first successful child's result
///
/// Losing children keep running; their results are discarded. The
/// composite fails only once every child has failed, reporting the first
/// failure, and is cancelled if every child was cancelled. An empty input
/// fails immediately with [`TaskError::NoCandidates`].
pub fn any_of<I>(tasks: I) -> Task
where
    I: IntoIterator<Item = Task>,
{
    let parent = Task::composite(tasks.into_iter().collect());
    if parent.children().is_empty() {
        parent.settle(TaskState::Failed, Err(TaskError::NoCandidates));
        return parent;
    }

    let first_error: Arc<Mutex<Option<TaskError>>> = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&first_error);
    watch_children(&parent, move |parent, child| {
        if let Some(value) = child.result() {
            parent.settle(TaskState::Completed, Ok(value));
            return;
        }
        if let Some(err) = child.error() {
            let mut first = seen.lock();
            if first.is_none() && err != TaskError::Cancelled {
                *first = Some(err);
            }
        }
    });

    // Settles only if no child succeeded
    parent.when_ready(move |parent| {
        let first = first_error.lock().take();
        match first {
            Some(err) => parent.settle(TaskState::Failed, Err(err)),
            None => parent.settle(TaskState::Cancelled, Err(TaskError::Cancelled)),
        };
    });
    parent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing(msg: &'static str) -> Task {
        Task::new(move || -> Result<(), BoxError> { Err(msg.into()) })
    }

    #[test]
    fn test_all_of_empty_completes() {
        let task = all_of(Vec::new());
        assert_eq!(task.state(), TaskState::Completed);
        assert!(task.is_composite());
    }

    #[test]
    fn test_all_of_waits_for_every_child() {
        let a = Task::new(|| Ok(1));
        let b = Task::new(|| Ok(2));
        let all = all_of(vec![a.clone(), b.clone()]);
        assert_eq!(all.children().len(), 2);

        a.execute();
        assert_eq!(all.state(), TaskState::Pending);
        b.execute();
        assert_eq!(all.state(), TaskState::Completed);
        assert_eq!(all.wait(), Ok(Value::Unit));
    }

    #[test]
    fn test_all_of_records_first_failure_once() {
        let a = failing("first");
        let b = failing("second");
        let c = Task::new(|| Ok(3));
        let all = all_of(vec![a.clone(), b.clone(), c.clone()]);

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        all.on_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.execute();
        b.execute();
        assert_eq!(all.state(), TaskState::Pending);
        c.execute();

        assert_eq!(all.state(), TaskState::Failed);
        assert_eq!(all.error(), Some(TaskError::Failed("first".into())));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_of_failure_waits_for_pending_sibling() {
        let fast = failing("fast");
        let slow = Task::new(|| Ok("slow"));
        let all = all_of(vec![fast.clone(), slow.clone()]);

        fast.execute();
        assert_eq!(slow.state(), TaskState::Pending);
        assert_eq!(all.state(), TaskState::Pending);
        assert!(all.outcome().is_none());
        assert_eq!(all.dependency_count(), 1);

        slow.execute();
        assert_eq!(all.state(), TaskState::Failed);
        assert_eq!(all.error(), Some(TaskError::Failed("fast".into())));
        assert_eq!(slow.result(), Some(Value::from("slow")));
    }

    #[test]
    fn test_all_of_first_unsuccessful_child_decides() {
        let cancelled = Task::from_fn(|| {});
        let failed = failing("later");
        let all = all_of(vec![cancelled.clone(), failed.clone()]);

        cancelled.cancel();
        assert_eq!(all.state(), TaskState::Pending);
        failed.execute();
        assert_eq!(all.state(), TaskState::Cancelled);
        assert_eq!(all.error(), Some(TaskError::Cancelled));
    }

    #[test]
    fn test_all_of_child_cancelled() {
        let a = Task::from_fn(|| {});
        let all = all_of(vec![a.clone()]);
        a.cancel();
        assert_eq!(all.state(), TaskState::Cancelled);
        assert_eq!(all.error(), Some(TaskError::Cancelled));
    }

    #[test]
    fn test_all_of_already_finished_children() {
        let a = Task::new(|| Ok(1));
        a.execute();
        let all = all_of(vec![a]);
        assert_eq!(all.state(), TaskState::Completed);
    }

    #[test]
    fn test_any_of_empty_fails() {
        let task = any_of(Vec::new());
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.error(), Some(TaskError::NoCandidates));
    }

    #[test]
    fn test_any_of_first_success_wins() {
        let a = failing("nope");
        let b = Task::new(|| Ok("b"));
        let c = Task::new(|| Ok("c"));
        let any = any_of(vec![a.clone(), b.clone(), c.clone()]);

        a.execute();
        assert_eq!(any.state(), TaskState::Pending);
        b.execute();
        assert_eq!(any.result(), Some(Value::from("b")));
        c.execute();
        assert_eq!(any.result(), Some(Value::from("b")));
        assert_eq!(c.state(), TaskState::Completed);
    }

    #[test]
    fn test_any_of_all_fail() {
        let a = failing("a");
        let b = failing("b");
        let any = any_of(vec![a.clone(), b.clone()]);
        b.execute();
        a.execute();
        assert_eq!(any.state(), TaskState::Failed);
        assert_eq!(any.error(), Some(TaskError::Failed("b".into())));
    }

    #[test]
    fn test_any_of_cancelled_only_when_all_cancelled() {
        let a = Task::from_fn(|| {});
        let b = Task::from_fn(|| {});
        let any = any_of(vec![a.clone(), b.clone()]);
        a.cancel();
        assert_eq!(any.state(), TaskState::Pending);
        b.cancel();
        assert_eq!(any.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_dropped_composite_is_released() {
        let a = Task::from_fn(|| {});
        let weak = {
            let all = all_of(vec![a.clone()]);
            all.downgrade()
        };
        assert!(weak.upgrade().is_none());
        assert_eq!(a.execute(), TaskState::Completed);
    }
}
