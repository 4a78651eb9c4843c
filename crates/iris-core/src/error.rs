//! Error types
//!
//! Structural errors (attachment, configuration, submission) are returned
//! synchronously to the caller. Handler failures never surface here; they are
//! recorded on the handler's [`Task`](crate::Task) as a [`TaskError`].

use crate::port::PortId;
use crate::receiver::ReceiverId;
use crate::task::TaskId;

/// Boxed error returned by handlers and task bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a task did not complete successfully
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task body returned an error
    #[error("task failed: {0}")]
    Failed(String),

    /// The task body panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was cancelled before it ran
    #[error("task was cancelled")]
    Cancelled,

    /// `any_of` was given no tasks to choose from
    #[error("no candidate tasks to wait for")]
    NoCandidates,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The bounded submission queue is full
    #[error("scheduler queue is full ({limit} tasks queued)")]
    Exhausted {
        /// Configured queue limit
        limit: usize,
    },

    /// The scheduler no longer accepts work
    #[error("scheduler has been shut down")]
    ShutDown,

    /// The task has already been handed to a scheduler
    #[error("task {0} was already submitted")]
    AlreadySubmitted(TaskId),

    /// Composite tasks are driven by their children and cannot run
    #[error("task {0} is a composite and cannot be submitted")]
    Composite(TaskId),

    /// Invalid configuration value
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// A worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised while building receivers and coordinators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArbiterError {
    /// The receiver is listed twice or already belongs to a coordinator
    #[error("receiver {0} is already attached to a coordinator")]
    DuplicateAttachment(ReceiverId),

    /// `coordinate` was called without receivers
    #[error("a coordinator needs at least one receiver")]
    NoReceivers,

    /// Another live receiver is bound to the port
    #[error("port {0} already has a receiver")]
    PortAlreadyBound(PortId),

    /// Unknown receive class tag
    #[error("invalid receive class: {0:?}")]
    InvalidClass(String),
}

/// Any error produced by this crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Task error
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Scheduler error
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Arbiter error
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),
}

/// Result alias using the crate-level [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
