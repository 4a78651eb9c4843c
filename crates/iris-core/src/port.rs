//! Ports
//!
//! A [`Port`] is an unbounded, ordered, multi-producer message queue. Posting
//! never blocks and never touches coordinator state: it appends under the
//! port's own lock and then wakes the bound receiver, which schedules its
//! dispatch on its scheduler.
//!
//! Messages are removed only through the receiver dispatch path. A receiver
//! first *reserves* the head message when its coordinator grants a claim,
//! and the handler task *takes* it when it starts running.

use crate::coordinator::Member;
use crate::error::ArbiterError;
use crate::message::Message;
use crate::receiver::ReceiverId;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide post sequence; orders messages across ports
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a Port
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

impl PortId {
    fn new() -> Self {
        PortId(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Envelope<M> {
    seq: u64,
    message: M,
}

struct Queue<M> {
    items: VecDeque<Envelope<M>>,
    /// Leading items promised to already-dispatched handler tasks
    reserved: usize,
}

struct Binding {
    receiver: ReceiverId,
    member: Weak<dyn Member>,
}

struct PortShared<M> {
    id: PortId,
    queue: Mutex<Queue<M>>,
    binding: RwLock<Option<Binding>>,
    posted: AtomicU64,
}

/// Multi-producer FIFO message queue
///
/// `Port` is a cheap handle; clones post into the same queue.
pub struct Port<M = Message> {
    shared: Arc<PortShared<M>>,
}

impl<M> Clone for Port<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Send + 'static> Default for Port<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> Port<M> {
    /// Create an empty port
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PortShared {
                id: PortId::new(),
                queue: Mutex::new(Queue {
                    items: VecDeque::new(),
                    reserved: 0,
                }),
                binding: RwLock::new(None),
                posted: AtomicU64::new(0),
            }),
        }
    }

    /// Get the port ID
    pub fn id(&self) -> PortId {
        self.shared.id
    }

    /// Append a message and wake the bound receiver
    pub fn post(&self, message: M) {
        let seq = {
            let mut queue = self.shared.queue.lock();
            let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
            queue.items.push_back(Envelope { seq, message });
            seq
        };
        self.shared.posted.fetch_add(1, Ordering::Relaxed);
        trace!(port = %self.id(), seq, "message posted");
        self.wake_receiver();
    }

    /// Append several messages in order, waking the receiver once
    ///
    /// Returns the number of messages posted.
    pub fn post_all<I>(&self, messages: I) -> usize
    where
        I: IntoIterator<Item = M>,
    {
        let count = {
            let mut queue = self.shared.queue.lock();
            let before = queue.items.len();
            for message in messages {
                let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
                queue.items.push_back(Envelope { seq, message });
            }
            queue.items.len() - before
        };
        if count > 0 {
            self.shared.posted.fetch_add(count as u64, Ordering::Relaxed);
            trace!(port = %self.id(), count, "messages posted");
            self.wake_receiver();
        }
        count
    }

    /// Number of messages not yet taken by a handler
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// Total messages ever posted
    pub fn posted_count(&self) -> u64 {
        self.shared.posted.load(Ordering::Relaxed)
    }

    /// Whether a live receiver is bound
    pub fn has_receiver(&self) -> bool {
        self.shared
            .binding
            .read()
            .as_ref()
            .is_some_and(|b| b.member.strong_count() > 0)
    }

    fn wake_receiver(&self) {
        let member = self
            .shared
            .binding
            .read()
            .as_ref()
            .and_then(|b| b.member.upgrade());
        if let Some(member) = member {
            member.wake();
        }
    }

    /// Bind a receiver; fails if another live receiver is bound
    pub(crate) fn bind(
        &self,
        receiver: ReceiverId,
        member: Weak<dyn Member>,
    ) -> Result<(), ArbiterError> {
        let mut binding = self.shared.binding.write();
        if let Some(existing) = binding.as_ref() {
            if existing.member.strong_count() > 0 {
                return Err(ArbiterError::PortAlreadyBound(self.id()));
            }
        }
        *binding = Some(Binding { receiver, member });
        Ok(())
    }

    /// Remove the binding if it belongs to `receiver`
    pub(crate) fn unbind(&self, receiver: ReceiverId) {
        let mut binding = self.shared.binding.write();
        if binding.as_ref().is_some_and(|b| b.receiver == receiver) {
            *binding = None;
        }
    }

    /// Post sequence of the first unreserved message
    pub(crate) fn head_seq(&self) -> Option<u64> {
        let queue = self.shared.queue.lock();
        queue.items.get(queue.reserved).map(|e| e.seq)
    }

    /// Reserve the first unreserved message for a handler task
    pub(crate) fn reserve(&self) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.items.len() > queue.reserved {
            queue.reserved += 1;
            true
        } else {
            false
        }
    }

    /// Remove the head message on behalf of a reserved handler task
    pub(crate) fn take_reserved(&self) -> Option<M> {
        let mut queue = self.shared.queue.lock();
        if queue.reserved == 0 {
            return None;
        }
        queue.reserved -= 1;
        queue.items.pop_front().map(|e| e.message)
    }

    /// Give back a reservation whose handler task will never run
    pub(crate) fn unreserve(&self) {
        let mut queue = self.shared.queue.lock();
        queue.reserved = queue.reserved.saturating_sub(1);
    }
}

impl<M> fmt::Debug for Port<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("Port")
            .field("id", &self.shared.id)
            .field("pending", &queue.items.len())
            .field("reserved", &queue.reserved)
            .finish()
    }
}
