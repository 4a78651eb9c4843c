//! Receivers
//!
//! A [`Receiver`] binds one [`Port`] to a handler, a data value and a
//! [`Scheduler`]. Receivers are built through the [`Arbiter`](crate::Arbiter)
//! and start dispatching once they belong to a coordinator.
//!
//! Dispatch runs in a short *pump* task on the receiver's scheduler. The pump
//! asks the coordinator for a claim on the head message, reserves it and
//! submits a handler task; it repeats until the port is empty, the receiver
//! is paused or throttled, or the coordinator holds the claim. Handler
//! completion releases the claim and wakes the pump again.

use crate::coordinator::{Claim, Coordinator, CoordinatorShared, Member};
use crate::error::{ArbiterError, BoxError};
use crate::message::Message;
use crate::port::Port;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskState};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

static NEXT_RECEIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a Receiver
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId(u64);

impl ReceiverId {
    pub(crate) fn new() -> Self {
        ReceiverId(NEXT_RECEIVER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        ReceiverId(id)
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Exclusion class of a receiver within its coordinator
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveClass {
    /// Runs alone: nothing else under the coordinator dispatches meanwhile
    Exclusive,
    /// Runs alongside other concurrent messages
    #[default]
    Concurrent,
    /// Runs alone and then disables the coordinator for good
    Teardown,
}

impl ReceiveClass {
    pub(crate) fn index(self) -> usize {
        match self {
            ReceiveClass::Exclusive => 0,
            ReceiveClass::Concurrent => 1,
            ReceiveClass::Teardown => 2,
        }
    }
}

impl fmt::Display for ReceiveClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveClass::Exclusive => write!(f, "exclusive"),
            ReceiveClass::Concurrent => write!(f, "concurrent"),
            ReceiveClass::Teardown => write!(f, "teardown"),
        }
    }
}

impl FromStr for ReceiveClass {
    type Err = ArbiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclusive" => Ok(ReceiveClass::Exclusive),
            "concurrent" => Ok(ReceiveClass::Concurrent),
            "teardown" => Ok(ReceiveClass::Teardown),
            _ => Err(ArbiterError::InvalidClass(s.to_string())),
        }
    }
}

/// Message handler: `(message, data) -> Result`
pub(crate) type Handler<M, D> = Box<dyn Fn(M, &D) -> Result<(), BoxError> + Send + Sync + 'static>;

struct Attachment {
    coordinator: Arc<CoordinatorShared>,
    slot: usize,
}

pub(crate) struct ReceiverCore<M, D> {
    id: ReceiverId,
    class: ReceiveClass,
    port: Port<M>,
    handler: Handler<M, D>,
    data: D,
    scheduler: Scheduler,
    max_active: Option<usize>,
    this: Weak<Self>,

    paused: AtomicBool,
    closed: AtomicBool,
    pump_scheduled: AtomicBool,
    pump_requested: AtomicBool,

    active: AtomicUsize,
    delivered: AtomicU64,
    failed: AtomicU64,

    attachment: OnceCell<Attachment>,
}

impl<M, D> ReceiverCore<M, D>
where
    M: Send + 'static,
    D: Send + Sync + 'static,
{
    pub(crate) fn new(
        port: Port<M>,
        handler: Handler<M, D>,
        data: D,
        scheduler: Scheduler,
        class: ReceiveClass,
        max_active: Option<usize>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: ReceiverId::new(),
            class,
            port,
            handler,
            data,
            scheduler,
            max_active,
            this: this.clone(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pump_scheduled: AtomicBool::new(false),
            pump_requested: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            attachment: OnceCell::new(),
        })
    }

    pub(crate) fn id(&self) -> ReceiverId {
        self.id
    }

    fn can_dispatch(&self) -> bool {
        !self.paused.load(Ordering::SeqCst)
            && !self.closed.load(Ordering::SeqCst)
            && self
                .max_active
                .map_or(true, |max| self.active.load(Ordering::SeqCst) < max)
    }

    /// Run the pump until no wake-up arrived while it was draining
    fn pump(self: &Arc<Self>) {
        loop {
            self.pump_requested.store(false, Ordering::SeqCst);
            self.drain();
            self.pump_scheduled.store(false, Ordering::SeqCst);
            if !self.pump_requested.load(Ordering::SeqCst)
                || self.pump_scheduled.swap(true, Ordering::SeqCst)
            {
                break;
            }
        }
    }

    fn drain(self: &Arc<Self>) {
        let Some(attachment) = self.attachment.get() else {
            return;
        };
        if self.scheduler.is_shut_down() {
            return;
        }

        while self.can_dispatch() {
            let Some(seq) = self.port.head_seq() else {
                break;
            };
            match attachment.coordinator.try_claim(attachment.slot, seq) {
                Claim::Granted => {}
                Claim::Held | Claim::Closed => break,
            }
            if !self.port.reserve() {
                attachment.coordinator.abandon(attachment.slot);
                break;
            }

            self.active.fetch_add(1, Ordering::SeqCst);
            let task = self.handler_task();
            trace!(receiver = %self.id, task = %task.id(), seq, "dispatching message");
            if let Err(err) = self.scheduler.dispatch(&task) {
                warn!(receiver = %self.id, error = %err, "failed to dispatch handler");
                // Runs `finish`, which returns the reservation and the claim
                task.cancel();
                break;
            }
        }
    }

    fn handler_task(self: &Arc<Self>) -> Task {
        let core = Arc::clone(self);
        let task = Task::new(move || {
            let message = core
                .port
                .take_reserved()
                .ok_or("reserved message missing from port")?;
            (core.handler)(message, &core.data)
        });
        let core = Arc::clone(self);
        task.on_finish(move |task| core.finish(task));
        task
    }

    fn finish(&self, task: &Task) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let handled = match task.state() {
            TaskState::Completed => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                true
            }
            TaskState::Failed => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                self.failed.fetch_add(1, Ordering::SeqCst);
                if let Some(err) = task.error() {
                    warn!(receiver = %self.id, class = %self.class, error = %err, "handler failed");
                }
                true
            }
            // The message goes back to the head of the port
            TaskState::Cancelled => {
                self.port.unreserve();
                false
            }
            TaskState::Pending | TaskState::Running => true,
        };
        if let Some(attachment) = self.attachment.get() {
            if handled {
                attachment.coordinator.complete(attachment.slot);
            } else {
                attachment.coordinator.abandon(attachment.slot);
            }
        }
        self.wake();
    }

    fn wake_coordinator(&self) {
        if let Some(attachment) = self.attachment.get() {
            attachment.coordinator.wake_waiting();
        }
    }

    pub(crate) fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            debug!(receiver = %self.id, "receiver paused");
            self.wake_coordinator();
        }
    }

    pub(crate) fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!(receiver = %self.id, "receiver resumed");
            self.wake();
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.port.unbind(self.id);
        debug!(receiver = %self.id, pending = self.port.pending_count(), "receiver closed");
        self.wake_coordinator();
    }
}

impl<M, D> Member for ReceiverCore<M, D>
where
    M: Send + 'static,
    D: Send + Sync + 'static,
{
    fn receiver_id(&self) -> ReceiverId {
        self.id
    }

    fn class(&self) -> ReceiveClass {
        self.class
    }

    fn eligible_head(&self) -> Option<u64> {
        if self.can_dispatch() {
            self.port.head_seq()
        } else {
            None
        }
    }

    fn pending(&self) -> usize {
        self.port.pending_count()
    }

    fn wake(&self) {
        if self.closed.load(Ordering::SeqCst)
            || self.attachment.get().is_none()
            || self.scheduler.is_shut_down()
        {
            return;
        }
        self.pump_requested.store(true, Ordering::SeqCst);
        if self.pump_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let pump = Task::from_fn(move || this.pump());
        if let Err(err) = self.scheduler.dispatch(&pump) {
            self.pump_scheduled.store(false, Ordering::SeqCst);
            debug!(receiver = %self.id, error = %err, "could not schedule receiver pump");
        }
    }

    fn is_attached(&self) -> bool {
        self.attachment.get().is_some()
    }

    fn attach(&self, coordinator: Arc<CoordinatorShared>, slot: usize) -> bool {
        self.attachment
            .set(Attachment { coordinator, slot })
            .is_ok()
    }
}

/// A port bound to a handler, a data value and a scheduler
///
/// Dropping the receiver closes it. Messages still queued stay on the port.
pub struct Receiver<M = Message, D = ()>
where
    M: Send + 'static,
    D: Send + Sync + 'static,
{
    core: Arc<ReceiverCore<M, D>>,
}

impl<M, D> Receiver<M, D>
where
    M: Send + 'static,
    D: Send + Sync + 'static,
{
    pub(crate) fn from_core(core: Arc<ReceiverCore<M, D>>) -> Self {
        Self { core }
    }

    pub(crate) fn member(&self) -> Arc<dyn Member> {
        Arc::clone(&self.core) as Arc<dyn Member>
    }

    /// Get the receiver ID
    pub fn id(&self) -> ReceiverId {
        self.core.id
    }

    /// Exclusion class
    pub fn class(&self) -> ReceiveClass {
        self.core.class
    }

    /// The bound port
    pub fn port(&self) -> &Port<M> {
        &self.core.port
    }

    /// The user data passed to every handler invocation
    pub fn data(&self) -> &D {
        &self.core.data
    }

    /// The scheduler running this receiver's handlers
    pub fn scheduler(&self) -> &Scheduler {
        &self.core.scheduler
    }

    /// The coordinator this receiver belongs to, if any
    pub fn coordinator(&self) -> Option<Coordinator> {
        self.core
            .attachment
            .get()
            .map(|a| Coordinator::from_shared(Arc::clone(&a.coordinator)))
    }

    /// Stop dispatching; posts keep queueing
    pub fn pause(&self) {
        self.core.pause();
    }

    /// Resume dispatching queued messages
    pub fn resume(&self) {
        self.core.resume();
    }

    /// Whether the receiver is paused
    pub fn is_paused(&self) -> bool {
        self.core.paused.load(Ordering::SeqCst)
    }

    /// Unbind from the port and stop dispatching for good
    ///
    /// Handlers already running finish normally. Queued messages stay on
    /// the port, where a new receiver may pick them up.
    pub fn close(&self) {
        self.core.close();
    }

    /// Whether the receiver has been closed
    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    /// Messages queued on the port and not yet handed to the handler
    pub fn get_queue_count(&self) -> usize {
        self.core.port.pending_count()
    }

    /// Handler tasks currently dispatched or running
    pub fn active_count(&self) -> usize {
        self.core.active.load(Ordering::SeqCst)
    }

    /// Messages handled so far, including failed ones
    pub fn delivered_count(&self) -> u64 {
        self.core.delivered.load(Ordering::SeqCst)
    }

    /// Handler invocations that returned an error or panicked
    pub fn failed_count(&self) -> u64 {
        self.core.failed.load(Ordering::SeqCst)
    }
}

impl<M, D> Drop for Receiver<M, D>
where
    M: Send + 'static,
    D: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.close();
    }
}

impl<M, D> fmt::Debug for Receiver<M, D>
where
    M: Send + 'static,
    D: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("id", &self.core.id)
            .field("class", &self.core.class)
            .field("port", &self.core.port.id())
            .field("paused", &self.is_paused())
            .field("closed", &self.is_closed())
            .field("active", &self.active_count())
            .finish()
    }
}
