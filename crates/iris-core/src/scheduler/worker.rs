//! Worker thread loop
//!
//! Each worker pops from its own LIFO deque first (work-stealing policy),
//! then refills from the global injector, then steals from a randomly chosen
//! victim. Under the shared-queue policy workers only use the injector.

use super::scheduler::Shared;
use crate::task::Task;
use crossbeam::utils::Backoff;
use crossbeam_deque::{Injector, Steal, Worker as Deque};
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Identity of the worker running on the current thread
struct Context {
    scheduler: usize,
    index: usize,
    local: Option<Rc<Deque<Task>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Context>> = RefCell::new(None);
}

/// Worker main loop; returns once shutdown is signalled and no work is left
pub(super) fn run(shared: Arc<Shared>, index: usize, local: Option<Deque<Task>>) {
    let local = local.map(Rc::new);
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(Context {
            scheduler: shared.id,
            index,
            local: local.clone(),
        });
    });
    debug!(scheduler = shared.id, worker = index, "worker started");

    loop {
        if let Some(task) = find_task(&shared, index, local.as_deref()) {
            shared.run_task(index, task);
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        shared.park();
    }

    CURRENT.with(|current| current.borrow_mut().take());
    debug!(scheduler = shared.id, worker = index, "worker stopped");
    shared.worker_exited();
}

/// Push onto the current thread's deque if it is a work-stealing worker of
/// `scheduler`; otherwise hand the task back
pub(super) fn push_local(scheduler: usize, task: Task) -> Result<(), Task> {
    CURRENT.with(|current| match current.borrow().as_ref() {
        Some(Context {
            scheduler: id,
            local: Some(local),
            ..
        }) if *id == scheduler => {
            local.push(task);
            Ok(())
        }
        _ => Err(task),
    })
}

/// Index of the current thread's worker within `scheduler`
pub(super) fn current_worker(scheduler: usize) -> Option<usize> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|ctx| ctx.scheduler == scheduler)
            .map(|ctx| ctx.index)
    })
}

fn find_task(shared: &Shared, index: usize, local: Option<&Deque<Task>>) -> Option<Task> {
    let Some(local) = local else {
        return steal_global(&shared.injector);
    };

    if let Some(task) = local.pop() {
        return Some(task);
    }

    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }

    steal_from_others(shared, index)
}

fn steal_global(injector: &Injector<Task>) -> Option<Task> {
    let backoff = Backoff::new();
    loop {
        match injector.steal() {
            Steal::Success(task) => return Some(task),
            Steal::Empty => return None,
            Steal::Retry => backoff.spin(),
        }
    }
}

fn steal_from_others(shared: &Shared, index: usize) -> Option<Task> {
    let stealers = shared.stealers.get()?;
    let count = stealers.len();
    if count < 2 {
        return None;
    }

    let start = rand::thread_rng().gen_range(0..count);
    for offset in 0..count {
        let victim = (start + offset) % count;
        if victim == index {
            continue;
        }
        loop {
            match stealers[victim].steal() {
                Steal::Success(task) => {
                    shared.counters[index].record_stolen();
                    trace!(worker = index, victim, task = %task.id(), "stole task");
                    return Some(task);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;

    #[test]
    fn test_find_task_shared_queue() {
        let shared = Shared::new(SchedulerConfig::shared(2));
        let task = Task::from_fn(|| {});
        shared.injector.push(task.clone());

        let found = find_task(&shared, 0, None).unwrap();
        assert_eq!(found.id(), task.id());
        assert!(find_task(&shared, 0, None).is_none());
    }

    #[test]
    fn test_find_task_prefers_local() {
        let shared = Shared::new(SchedulerConfig::work_stealing(2));
        let local = Deque::new_lifo();
        let global = Task::from_fn(|| {});
        let mine = Task::from_fn(|| {});
        shared.injector.push(global.clone());
        local.push(mine.clone());

        assert_eq!(find_task(&shared, 0, Some(&local)).unwrap().id(), mine.id());
        assert_eq!(find_task(&shared, 0, Some(&local)).unwrap().id(), global.id());
        assert!(find_task(&shared, 0, Some(&local)).is_none());
    }

    #[test]
    fn test_steal_from_other_worker() {
        let shared = Shared::new(SchedulerConfig::work_stealing(2));
        let deques = [Deque::new_lifo(), Deque::new_lifo()];
        let _ = shared
            .stealers
            .set(deques.iter().map(Deque::stealer).collect());

        let first = Task::from_fn(|| {});
        let second = Task::from_fn(|| {});
        deques[1].push(first.clone());
        deques[1].push(second.clone());

        // Thieves take from the opposite end of the owner's LIFO pops
        let stolen = find_task(&shared, 0, Some(&deques[0])).unwrap();
        assert_eq!(stolen.id(), first.id());
        assert_eq!(shared.counters[0].snapshot(0).stolen, 1);
        assert_eq!(deques[1].pop().unwrap().id(), second.id());
    }

    #[test]
    fn test_push_local_outside_worker() {
        let task = Task::from_fn(|| {});
        let returned = push_local(1, task.clone()).unwrap_err();
        assert_eq!(returned.id(), task.id());
        assert!(current_worker(1).is_none());
    }
}
