//! State Notifier
//!
//! Fans state and error transitions out to registered listeners and
//! owns the pending connection timeout, which is cancelled the moment
//! `Connected` is published.
//!
//! Errors are latched per connection attempt: the first error is
//! delivered, later ones are logged and dropped until the next attempt
//! begins.
//!
//! Publishing only queues an event. [`StateNotifier::flush`] delivers the
//! queue in order and is called by the coordinator after it releases its
//! state lock, so listeners may call back into the coordinator. Delivery
//! runs are serialized: events published from inside a listener are
//! delivered after it returns, by the run already in progress.

use crate::state::{ConnectionState, ErrorState, VpnEvent};
use crate::timer::TimeoutTimer;
use crossbeam_channel::Sender;
use std::collections::{HashSet, VecDeque};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, error};

/// Whether a listener stays subscribed after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Keep,
    Remove,
}

/// Receiver of coordinator events
pub trait StateListener: Send {
    fn on_event(&self, event: VpnEvent) -> Retention;
}

/// Channel listeners unsubscribe once the receiver is gone
impl StateListener for Sender<VpnEvent> {
    fn on_event(&self, event: VpnEvent) -> Retention {
        match self.send(event) {
            Ok(()) => Retention::Keep,
            Err(_) => Retention::Remove,
        }
    }
}

/// Listener wrapping a closure
pub struct FnListener<F>(pub F);

impl<F> StateListener for FnListener<F>
where
    F: Fn(VpnEvent) + Send,
{
    fn on_event(&self, event: VpnEvent) -> Retention {
        (self.0)(event);
        Retention::Keep
    }
}

/// Adapter that unsubscribes after the first error or `Disabled` state
pub struct UntilTerminal<L>(pub L);

impl<L: StateListener> StateListener for UntilTerminal<L> {
    fn on_event(&self, event: VpnEvent) -> Retention {
        match self.0.on_event(event) {
            Retention::Keep if !event.is_terminal() => Retention::Keep,
            _ => Retention::Remove,
        }
    }
}

/// Handle returned by [`StateNotifier::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Listeners = Vec<(SubscriberId, Box<dyn StateListener>)>;

struct NotifierInner {
    next_id: u64,
    /// Subscribed ids, including ones not yet moved into the listener list
    live: HashSet<SubscriberId>,
    added: Listeners,
    removed: Vec<SubscriberId>,
    /// Events awaiting delivery, in publication order
    queue: VecDeque<VpnEvent>,
    /// An error was already published in the current attempt
    error_latched: bool,
    /// Timeout of the current attempt
    timeout: Option<TimeoutTimer>,
}

fn deliver(listeners: &mut Listeners, event: VpnEvent) -> Vec<SubscriberId> {
    let mut pruned = Vec::new();
    listeners.retain(|(id, listener)| {
        let result = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
        let keep = match result {
            Ok(Retention::Keep) => true,
            Ok(Retention::Remove) => {
                debug!("Listener {:?} unsubscribed after {:?}", id, event);
                false
            }
            Err(_) => {
                error!("Listener {:?} panicked on {:?}, removing it", id, event);
                false
            }
        };
        if !keep {
            pruned.push(*id);
        }
        keep
    });
    pruned
}

/// Fan-out of coordinator events
pub struct StateNotifier {
    inner: Mutex<NotifierInner>,
    /// Held for a whole delivery run. Lock order: `listeners`, then `inner`.
    listeners: Mutex<Listeners>,
}

impl StateNotifier {
    /// Create a notifier with no listeners
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(NotifierInner {
                next_id: 1,
                live: HashSet::new(),
                added: Vec::new(),
                removed: Vec::new(),
                queue: VecDeque::new(),
                error_latched: false,
                timeout: None,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, NotifierInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener.
    ///
    /// Safe to call from inside a listener; the new listener receives
    /// events delivered after the current one.
    pub fn subscribe(&self, listener: impl StateListener + 'static) -> SubscriberId {
        let id = {
            let mut inner = self.inner();
            let id = SubscriberId(inner.next_id);
            inner.next_id += 1;
            inner.live.insert(id);
            inner.added.push((id, Box::new(listener)));
            id
        };
        debug!("Listener {:?} subscribed", id);
        self.flush();
        id
    }

    /// Remove a listener; returns false if it was not subscribed
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = {
            let mut inner = self.inner();
            let removed = inner.live.remove(&id);
            if removed {
                inner.removed.push(id);
            }
            removed
        };
        self.flush();
        removed
    }

    /// Number of subscribed listeners
    pub fn subscriber_count(&self) -> usize {
        self.inner().live.len()
    }

    /// Start a new attempt: clear the error latch and arm its timeout.
    ///
    /// Any timeout of the previous attempt is cancelled.
    pub fn begin_attempt(&self, timeout: Option<TimeoutTimer>) {
        let mut inner = self.inner();
        inner.error_latched = false;
        inner.timeout = timeout;
    }

    /// Cancel the pending timeout, if any
    pub fn cancel_timeout(&self) {
        if let Some(timer) = self.inner().timeout.take() {
            debug!("Cancelling timeout for attempt {}", timer.attempt());
            timer.cancel();
        }
    }

    /// Check if a timeout is armed
    pub fn has_pending_timeout(&self) -> bool {
        self.inner().timeout.is_some()
    }

    /// Queue a state for every listener
    pub fn publish_state(&self, state: ConnectionState) {
        let mut inner = self.inner();
        if state == ConnectionState::Connected {
            if let Some(timer) = inner.timeout.take() {
                debug!("Connected, cancelling timeout for attempt {}", timer.attempt());
                timer.cancel();
            }
        }
        inner.queue.push_back(VpnEvent::State(state));
    }

    /// Queue an error once per attempt.
    ///
    /// Returns false if an earlier error of the same attempt already
    /// went out, in which case nothing is queued.
    pub fn publish_error(&self, error: ErrorState) -> bool {
        let mut inner = self.inner();
        if inner.error_latched {
            debug!("Suppressing {:?}: attempt already reported an error", error);
            return false;
        }
        inner.error_latched = true;
        inner.queue.push_back(VpnEvent::Error(error));
        true
    }

    /// Deliver queued events.
    ///
    /// Must not be called while holding a lock a listener might take.
    /// Returns at once if another delivery run is active; that run
    /// drains whatever was queued.
    pub fn flush(&self) {
        loop {
            let mut listeners = match self.listeners.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };

            while let Some(event) = self.next_event(&mut listeners) {
                let pruned = deliver(&mut listeners, event);
                if !pruned.is_empty() {
                    let mut inner = self.inner();
                    for id in pruned {
                        inner.live.remove(&id);
                    }
                }
            }
            drop(listeners);

            // Events queued after the last pop found the run still active
            if self.inner().queue.is_empty() {
                return;
            }
        }
    }

    /// Apply pending (un)subscriptions and pop the next event
    fn next_event(&self, listeners: &mut Listeners) -> Option<VpnEvent> {
        let mut inner = self.inner();
        listeners.append(&mut inner.added);
        if !inner.removed.is_empty() {
            let removed = mem::take(&mut inner.removed);
            listeners.retain(|(id, _)| !removed.contains(id));
        }
        inner.queue.pop_front()
    }
}

impl Default for StateNotifier {
    fn default() -> Self {
        Self::new()
    }
}
