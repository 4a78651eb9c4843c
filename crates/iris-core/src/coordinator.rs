//! Coordinators
//!
//! A coordinator enforces class-based exclusion across the receivers it
//! governs. Its whole state is one finite-state machine behind one mutex:
//!
//! ```text
//!            exclusive claim                 completion
//!   Idle ----------------------> Exclusive ---------------> Idle
//!   Idle ----------------------> Concurrent(1)
//!          concurrent claim      Concurrent(n) --claim--> Concurrent(n + 1)
//!                                Concurrent(1) --completion--> Idle
//!   Idle ----------------------> TornDown   (absorbing)
//!            teardown claim
//! ```
//!
//! A claim that cannot be granted is *held*: the receiver stops pumping and
//! is woken when the coordinator next returns to `Idle`. While `Idle`, the
//! receiver whose head message was posted first wins the next claim.
//!
//! Lock order is coordinator, then port. Handlers never run under the
//! coordinator lock, and receivers are woken only after it is released.

use crate::receiver::{ReceiveClass, ReceiverId};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusion state of a coordinator
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinatorState {
    /// Nothing is running
    Idle,
    /// One exclusive message is running
    Exclusive,
    /// `n` concurrent messages are running
    Concurrent(usize),
    /// A teardown message was dispatched; nothing will dispatch again
    TornDown,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Idle => write!(f, "idle"),
            CoordinatorState::Exclusive => write!(f, "exclusive-active"),
            CoordinatorState::Concurrent(n) => write!(f, "concurrent-active({})", n),
            CoordinatorState::TornDown => write!(f, "torn-down"),
        }
    }
}

/// Treatment of concurrent claims while an exclusive or teardown message waits
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fairness {
    /// Concurrent messages keep dispatching; the held message waits until
    /// the concurrent count happens to reach zero
    #[default]
    Throughput,
    /// New concurrent claims are held too, so running ones drain and the
    /// waiting message goes next
    Drain,
}

/// Outcome of a claim request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Claim {
    /// Dispatch may proceed; the claim must be released with `complete`
    Granted,
    /// Not now; the receiver will be woken
    Held,
    /// Never; the coordinator is torn down
    Closed,
}

/// The coordinator's view of a governed receiver
pub(crate) trait Member: Send + Sync {
    fn receiver_id(&self) -> ReceiverId;

    fn class(&self) -> ReceiveClass;

    /// Post sequence of the next dispatchable message, or `None` when the
    /// receiver is empty, paused, closed or throttled
    fn eligible_head(&self) -> Option<u64>;

    fn pending(&self) -> usize;

    /// Schedule the receiver's pump
    fn wake(&self);

    fn is_attached(&self) -> bool;

    fn attach(&self, coordinator: Arc<CoordinatorShared>, slot: usize) -> bool;
}

/// Counters reported by [`Coordinator::stats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Current exclusion state
    pub state: CoordinatorState,

    /// Fairness mode
    pub fairness: Fairness,

    /// Governed receivers
    pub receivers: usize,

    /// Exclusive messages dispatched
    pub exclusive_dispatched: u64,

    /// Concurrent messages dispatched
    pub concurrent_dispatched: u64,

    /// Teardown messages dispatched
    pub teardown_dispatched: u64,

    /// Claims that were held
    pub held: u64,

    /// Transitions out of `Idle`
    pub transitions: u64,

    /// Messages still queued on governed ports
    pub pending: usize,
}

struct Slot {
    member: Weak<dyn Member>,
    class: ReceiveClass,
    waiting: bool,
}

struct State {
    mode: CoordinatorState,
    slots: Vec<Slot>,
    dispatched: [u64; 3],
    held: u64,
    transitions: u64,
}

impl State {
    fn has_waiting_non_concurrent(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.waiting && s.class != ReceiveClass::Concurrent)
    }

    /// The live member, other than `slot`, holding the oldest eligible head
    /// posted before `seq`
    fn older_member(&self, slot: usize, seq: u64) -> Option<Arc<dyn Member>> {
        let mut oldest: Option<(u64, Arc<dyn Member>)> = None;
        for (index, other) in self.slots.iter().enumerate() {
            if index == slot {
                continue;
            }
            let Some(member) = other.member.upgrade() else {
                continue;
            };
            let Some(head) = member.eligible_head() else {
                continue;
            };
            if head < seq && oldest.as_ref().map_or(true, |(best, _)| head < *best) {
                oldest = Some((head, member));
            }
        }
        oldest.map(|(_, member)| member)
    }

    fn take_waiting(&mut self, filter: impl Fn(ReceiveClass) -> bool) -> Vec<Arc<dyn Member>> {
        self.slots
            .iter_mut()
            .filter(|s| s.waiting && filter(s.class))
            .filter_map(|s| {
                s.waiting = false;
                s.member.upgrade()
            })
            .collect()
    }
}

pub(crate) struct CoordinatorShared {
    id: u64,
    fairness: Fairness,
    state: Mutex<State>,
}

impl CoordinatorShared {
    pub(crate) fn new(fairness: Fairness, members: &[Arc<dyn Member>]) -> Self {
        let slots = members
            .iter()
            .map(|m| Slot {
                member: Arc::downgrade(m),
                class: m.class(),
                waiting: false,
            })
            .collect();
        Self {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            fairness,
            state: Mutex::new(State {
                mode: CoordinatorState::Idle,
                slots,
                dispatched: [0; 3],
                held: 0,
                transitions: 0,
            }),
        }
    }

    /// Ask to dispatch the message with post sequence `seq` from `slot`
    pub(crate) fn try_claim(&self, slot: usize, seq: u64) -> Claim {
        let mut woken = Vec::new();
        let claim = {
            let mut state = self.state.lock();
            let class = state.slots[slot].class;
            let claim = match state.mode {
                CoordinatorState::TornDown => Claim::Closed,
                CoordinatorState::Exclusive => Claim::Held,
                CoordinatorState::Concurrent(n) => {
                    let draining =
                        self.fairness == Fairness::Drain && state.has_waiting_non_concurrent();
                    if class == ReceiveClass::Concurrent && !draining {
                        state.mode = CoordinatorState::Concurrent(n + 1);
                        Claim::Granted
                    } else {
                        Claim::Held
                    }
                }
                CoordinatorState::Idle => match state.older_member(slot, seq) {
                    Some(member) => {
                        woken.push(member);
                        Claim::Held
                    }
                    None => {
                        state.mode = match class {
                            ReceiveClass::Exclusive => CoordinatorState::Exclusive,
                            ReceiveClass::Concurrent => CoordinatorState::Concurrent(1),
                            ReceiveClass::Teardown => CoordinatorState::TornDown,
                        };
                        state.transitions += 1;
                        trace!(
                            coordinator = self.id,
                            slot,
                            state = %state.mode,
                            "coordinator transition"
                        );
                        if class == ReceiveClass::Concurrent {
                            // Other concurrent receivers may join now
                            woken.extend(state.take_waiting(|c| c == ReceiveClass::Concurrent));
                        }
                        Claim::Granted
                    }
                },
            };

            match claim {
                Claim::Granted => {
                    state.slots[slot].waiting = false;
                    state.dispatched[class.index()] += 1;
                }
                Claim::Held => {
                    state.slots[slot].waiting = true;
                    state.held += 1;
                }
                Claim::Closed => {}
            }
            claim
        };

        for member in woken {
            member.wake();
        }
        claim
    }

    /// Release a granted claim after its message was handled
    pub(crate) fn complete(&self, slot: usize) {
        self.release(slot, true);
    }

    /// Release a granted claim whose message never ran
    ///
    /// An abandoned teardown claim reopens the coordinator, since the
    /// teardown message is back on its port.
    pub(crate) fn abandon(&self, slot: usize) {
        self.release(slot, false);
    }

    fn release(&self, slot: usize, handled: bool) {
        let woken = {
            let mut state = self.state.lock();
            let class = state.slots[slot].class;
            if !handled {
                let dispatched = &mut state.dispatched[class.index()];
                *dispatched = dispatched.saturating_sub(1);
            }
            let next = match state.mode {
                CoordinatorState::Exclusive => CoordinatorState::Idle,
                CoordinatorState::Concurrent(n) if n > 1 => CoordinatorState::Concurrent(n - 1),
                CoordinatorState::Concurrent(_) => CoordinatorState::Idle,
                CoordinatorState::TornDown if !handled && class == ReceiveClass::Teardown => {
                    debug!(coordinator = self.id, slot, "teardown abandoned");
                    CoordinatorState::Idle
                }
                CoordinatorState::TornDown => CoordinatorState::TornDown,
                CoordinatorState::Idle => {
                    warn!(coordinator = self.id, slot, "claim released while idle");
                    CoordinatorState::Idle
                }
            };
            if next != state.mode {
                trace!(coordinator = self.id, slot, state = %next, "coordinator transition");
            }
            state.mode = next;
            if next == CoordinatorState::Idle {
                state.take_waiting(|_| true)
            } else {
                Vec::new()
            }
        };

        for member in woken {
            member.wake();
        }
    }

    /// Wake every receiver holding a claim request
    pub(crate) fn wake_waiting(&self) {
        let woken = self.state.lock().take_waiting(|_| true);
        for member in woken {
            member.wake();
        }
    }

    /// Wake every live receiver
    pub(crate) fn wake_all(&self) {
        let members: Vec<Arc<dyn Member>> = self
            .state
            .lock()
            .slots
            .iter()
            .filter_map(|s| s.member.upgrade())
            .collect();
        for member in members {
            member.wake();
        }
    }

    fn state(&self) -> CoordinatorState {
        self.state.lock().mode
    }
}

/// Handle to a coordinator
///
/// The coordinator stays alive as long as any of its receivers does;
/// dropping this handle does not stop dispatch.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<CoordinatorShared>,
}

impl Coordinator {
    pub(crate) fn from_shared(shared: Arc<CoordinatorShared>) -> Self {
        Self { shared }
    }

    /// Current exclusion state
    pub fn state(&self) -> CoordinatorState {
        self.shared.state()
    }

    /// Whether a teardown message has been dispatched
    pub fn is_torn_down(&self) -> bool {
        self.state() == CoordinatorState::TornDown
    }

    /// Fairness mode
    pub fn fairness(&self) -> Fairness {
        self.shared.fairness
    }

    /// Number of governed receivers
    pub fn len(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// Whether the coordinator governs no receivers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// IDs of governed receivers that are still alive
    pub fn receiver_ids(&self) -> Vec<ReceiverId> {
        self.members().iter().map(|m| m.receiver_id()).collect()
    }

    /// Snapshot of the coordinator counters
    pub fn stats(&self) -> CoordinatorStats {
        let (mut stats, members) = {
            let state = self.shared.state.lock();
            let stats = CoordinatorStats {
                state: state.mode,
                fairness: self.shared.fairness,
                receivers: state.slots.len(),
                exclusive_dispatched: state.dispatched[ReceiveClass::Exclusive.index()],
                concurrent_dispatched: state.dispatched[ReceiveClass::Concurrent.index()],
                teardown_dispatched: state.dispatched[ReceiveClass::Teardown.index()],
                held: state.held,
                transitions: state.transitions,
                pending: 0,
            };
            let members: Vec<Arc<dyn Member>> =
                state.slots.iter().filter_map(|s| s.member.upgrade()).collect();
            (stats, members)
        };
        stats.pending = members.iter().map(|m| m.pending()).sum();
        stats
    }

    fn members(&self) -> Vec<Arc<dyn Member>> {
        self.shared
            .state
            .lock()
            .slots
            .iter()
            .filter_map(|s| s.member.upgrade())
            .collect()
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("fairness", &self.shared.fairness)
            .finish()
    }
}
