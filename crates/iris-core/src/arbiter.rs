//! Arbiter: the factory for receivers and coordinators
//!
//! ```no_run
//! use iris_core::{Arbiter, Message, Port, Scheduler};
//!
//! let scheduler = Scheduler::work_stealing(4).unwrap();
//! let arbiter = Arbiter::with_scheduler(scheduler);
//!
//! let control: Port = Port::new();
//! let requests: Port = Port::new();
//! let shutdown: Port = Port::new();
//!
//! let c = arbiter.receive(&control, |_msg: Message| Ok(())).exclusive().build().unwrap();
//! let r = arbiter.receive(&requests, |_msg: Message| Ok(())).concurrent().build().unwrap();
//! let s = arbiter.receive(&shutdown, |_msg: Message| Ok(())).teardown().build().unwrap();
//!
//! let coordinator = arbiter.coordinate().add(&c).add(&r).add(&s).build().unwrap();
//! ```

use crate::coordinator::{Coordinator, CoordinatorShared, Fairness, Member};
use crate::error::{ArbiterError, BoxError};
use crate::port::Port;
use crate::receiver::{Handler, ReceiveClass, Receiver, ReceiverCore};
use crate::scheduler::Scheduler;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Serializes coordinator assembly so two coordinators cannot claim the
/// same receiver
static ATTACH_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Factory for receivers and coordinators
///
/// An arbiter may carry a default scheduler for the receivers it builds;
/// otherwise they run on [`Scheduler::global`].
#[derive(Debug, Clone, Default)]
pub struct Arbiter {
    scheduler: Option<Scheduler>,
}

impl Arbiter {
    /// Arbiter using the process-wide default scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Arbiter whose receivers run on `scheduler` unless told otherwise
    pub fn with_scheduler(scheduler: Scheduler) -> Self {
        Self {
            scheduler: Some(scheduler),
        }
    }

    /// Start building a receiver with no user data
    pub fn receive<M, F>(&self, port: &Port<M>, handler: F) -> ReceiverBuilder<M, ()>
    where
        M: Send + 'static,
        F: Fn(M) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.receive_with(port, (), move |message, _: &()| handler(message))
    }

    /// Start building a receiver whose handler gets `&data` on every call
    pub fn receive_with<M, D, F>(
        &self,
        port: &Port<M>,
        data: D,
        handler: F,
    ) -> ReceiverBuilder<M, D>
    where
        M: Send + 'static,
        D: Send + Sync + 'static,
        F: Fn(M, &D) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        ReceiverBuilder {
            port: port.clone(),
            data,
            handler: Box::new(handler),
            scheduler: self.scheduler.clone(),
            class: ReceiveClass::default(),
            max_active: None,
        }
    }

    /// Start assembling a coordinator
    pub fn coordinate(&self) -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }
}

/// Builder returned by [`Arbiter::receive`] and [`Arbiter::receive_with`]
pub struct ReceiverBuilder<M, D> {
    port: Port<M>,
    data: D,
    handler: Handler<M, D>,
    scheduler: Option<Scheduler>,
    class: ReceiveClass,
    max_active: Option<usize>,
}

impl<M, D> ReceiverBuilder<M, D>
where
    M: Send + 'static,
    D: Send + Sync + 'static,
{
    /// Run handlers on `scheduler`
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the exclusion class
    pub fn class(mut self, class: ReceiveClass) -> Self {
        self.class = class;
        self
    }

    /// Set the exclusion class from its name
    pub fn class_named(self, name: &str) -> Result<Self, ArbiterError> {
        let class = name.parse()?;
        Ok(self.class(class))
    }

    /// Exclusive class
    pub fn exclusive(self) -> Self {
        self.class(ReceiveClass::Exclusive)
    }

    /// Concurrent class (the default)
    pub fn concurrent(self) -> Self {
        self.class(ReceiveClass::Concurrent)
    }

    /// Teardown class
    pub fn teardown(self) -> Self {
        self.class(ReceiveClass::Teardown)
    }

    /// Limit the handler tasks in flight for this receiver (minimum 1)
    pub fn max_active(mut self, limit: usize) -> Self {
        self.max_active = Some(limit.max(1));
        self
    }

    /// Bind the receiver to its port
    ///
    /// It does not dispatch until it is added to a coordinator.
    pub fn build(self) -> Result<Receiver<M, D>, ArbiterError> {
        let scheduler = self.scheduler.unwrap_or_else(Scheduler::global);
        let core = ReceiverCore::new(
            self.port.clone(),
            self.handler,
            self.data,
            scheduler,
            self.class,
            self.max_active,
        );
        let weak: Weak<ReceiverCore<M, D>> = Arc::downgrade(&core);
        let member: Weak<dyn Member> = weak;
        self.port.bind(core.id(), member)?;
        debug!(
            receiver = %core.id(),
            port = %self.port.id(),
            class = %self.class,
            "receiver bound"
        );
        Ok(Receiver::from_core(core))
    }

    /// Bind the receiver and make it its own single-member coordinator
    pub fn standalone(self) -> Result<Receiver<M, D>, ArbiterError> {
        let receiver = self.build()?;
        CoordinatorBuilder::default().add(&receiver).build()?;
        Ok(receiver)
    }
}

/// Builder returned by [`Arbiter::coordinate`]
#[derive(Default)]
pub struct CoordinatorBuilder {
    members: Vec<Arc<dyn Member>>,
    fairness: Fairness,
}

impl CoordinatorBuilder {
    /// Add a receiver; its class was fixed when it was built
    pub fn add<M, D>(mut self, receiver: &Receiver<M, D>) -> Self
    where
        M: Send + 'static,
        D: Send + Sync + 'static,
    {
        self.members.push(receiver.member());
        self
    }

    /// Set the fairness mode
    pub fn fairness(mut self, fairness: Fairness) -> Self {
        self.fairness = fairness;
        self
    }

    /// Attach every receiver and start dispatching
    ///
    /// Fails without attaching anything if a receiver is listed twice or
    /// already belongs to a coordinator.
    pub fn build(self) -> Result<Coordinator, ArbiterError> {
        let shared = attach_members(&self.members, self.fairness)?;
        debug!(receivers = self.members.len(), fairness = ?self.fairness, "coordinator built");
        shared.wake_all();
        Ok(Coordinator::from_shared(shared))
    }
}

fn attach_members(
    members: &[Arc<dyn Member>],
    fairness: Fairness,
) -> Result<Arc<CoordinatorShared>, ArbiterError> {
    if members.is_empty() {
        return Err(ArbiterError::NoReceivers);
    }

    let _guard = ATTACH_LOCK.lock();
    let mut seen = HashSet::new();
    for member in members {
        let id = member.receiver_id();
        if !seen.insert(id) || member.is_attached() {
            return Err(ArbiterError::DuplicateAttachment(id));
        }
    }

    let shared = Arc::new(CoordinatorShared::new(fairness, members));
    for (slot, member) in members.iter().enumerate() {
        // Only reachable if a member was attached without ATTACH_LOCK
        if !member.attach(Arc::clone(&shared), slot) {
            warn!(receiver = %member.receiver_id(), slot, "receiver attached concurrently");
            return Err(ArbiterError::DuplicateAttachment(member.receiver_id()));
        }
    }
    Ok(shared)
}
