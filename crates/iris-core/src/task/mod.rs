//! Tasks and task combinators
//!
//! A [`Task`] is a unit of work with a completion signal. Tasks are run by a
//! [`Scheduler`](crate::Scheduler); composite tasks built with [`all_of`] and
//! [`any_of`] are driven by their children instead.

mod combinator;
#[allow(clippy::module_inception)]
mod task;

pub use combinator::{all_of, any_of};
pub use task::{Task, TaskId, TaskState};
