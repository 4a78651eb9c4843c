//! Iris concurrency core
//!
//! This crate provides in-process message passing on top of a thread pool:
//! - Ports (multi-producer FIFO message queues)
//! - Receivers binding a port to a handler, a data value and a scheduler
//! - Coordinators enforcing exclusive / concurrent / teardown dispatch
//! - Schedulers with a shared ready queue or per-worker work-stealing deques
//! - Tasks with `all_of` / `any_of` combinators
//!
//! ```no_run
//! use iris_core::{Arbiter, Message, Port, Scheduler};
//!
//! let port = Port::new();
//! let receiver = Arbiter::new()
//!     .receive(&port, |msg: Message| {
//!         println!("got {}", msg.what());
//!         Ok(())
//!     })
//!     .scheduler(Scheduler::global())
//!     .standalone()
//!     .unwrap();
//!
//! port.post(Message::new(1));
//! # drop(receiver);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arbiter;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod port;
pub mod receiver;
pub mod scheduler;
pub mod task;

pub use arbiter::{Arbiter, CoordinatorBuilder, ReceiverBuilder};
pub use coordinator::{Coordinator, CoordinatorState, CoordinatorStats, Fairness};
pub use error::{ArbiterError, BoxError, Error, Result, SchedulerError, TaskError};
pub use message::{Message, Value};
pub use port::{Port, PortId};
pub use receiver::{ReceiveClass, Receiver, ReceiverId};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerPolicy, SchedulerStats, WorkerStats};
pub use task::{all_of, any_of, Task, TaskId, TaskState};
