//! Cooperative cancellation
//!
//! Cancelling a Deferred never preempts anything. What it does is refuse the
//! eventual result and run the Deferred's canceller, whose job is to release
//! whatever the asynchronous operation reserved when it started. Work running
//! on another thread learns about it through a `CancelToken`, which it is
//! expected to check whenever it reasonably can, and to stop early if it has
//! been cancelled.
//!
//! This module also links Deferreds to the lifecycle of whatever they were
//! produced for. A `FinishSignal` stands for a notification such as "the
//! request is finished" or "the client went away". `bind_cancellation` ties a
//! Deferred to such a signal, so that the Deferred gets cancelled if the
//! signal reports an abort before the Deferred is resolved.

use crate::deferred::Deferred;
use crate::error::ErrorValue;
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};


/// Shared flag through which a client requests cancellation of running work
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}
//
impl CancelToken {
    /// Create a token which is not cancelled yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}


/// How the operation watched by a FinishSignal ended
#[derive(Clone, Debug)]
pub enum Finish {
    /// Normal completion
    Completed,

    /// The operation was interrupted, e.g. the client disconnected
    Aborted(ErrorValue),
}


/// Identifier of a FinishSignal listener, used to detach it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);


type Listener = Box<dyn FnOnce(&Finish) + Send + 'static>;


struct SignalState {
    /// Set once the signal went off
    outcome: Option<Finish>,

    /// Listeners waiting for the signal, in subscription order
    listeners: Vec<(ListenerId, Listener)>,

    /// Next listener identifier
    next_id: u64,
}


/// One-shot "finished or aborted" notification
#[derive(Clone)]
pub struct FinishSignal {
    state: Arc<Mutex<SignalState>>,
}
//
impl FinishSignal {
    /// Create a signal which did not go off yet
    pub fn new() -> Self {
        FinishSignal {
            state: Arc::new(Mutex::new(SignalState {
                outcome: None,
                listeners: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Register a listener
    ///
    /// If the signal already went off, the listener is called right away.
    ///
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
        where F: FnOnce(&Finish) + Send + 'static
    {
        let mut state = self.state.lock();
        let id = ListenerId(state.next_id);
        state.next_id += 1;
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                listener(&outcome);
            }
            None => state.listeners.push((id, Box::new(listener))),
        }
        id
    }

    /// Detach a listener. Returns false if it was already called or removed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != before
    }

    /// Report normal completion
    pub fn finish(&self) -> bool {
        self.go_off(Finish::Completed)
    }

    /// Report an interruption
    pub fn abort(&self, reason: ErrorValue) -> bool {
        self.go_off(Finish::Aborted(reason))
    }

    /// Truth that the signal went off
    pub fn is_done(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// Call every listener once. Returns false if the signal already went
    /// off, in which case nothing happens.
    fn go_off(&self, outcome: Finish) -> bool {
        let listeners = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            mem::take(&mut state.listeners)
        };
        tracing::debug!(listeners = listeners.len(),
                        aborted = matches!(outcome, Finish::Aborted(_)),
                        "finish signal went off");
        for (_, listener) in listeners {
            listener(&outcome);
        }
        true
    }

    /// Deferred which fires on completion and fails on interruption
    pub fn notify_finish(&self) -> Deferred<(), ErrorValue> {
        let deferred = Deferred::new();
        let target = deferred.clone();
        self.subscribe(move |outcome| {
            let _ = match *outcome {
                Finish::Completed => target.fire(()),
                Finish::Aborted(ref reason) => target.fail(reason.clone()),
            };
        });
        deferred
    }
}
//
impl Default for FinishSignal {
    fn default() -> Self {
        Self::new()
    }
}
//
impl fmt::Debug for FinishSignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FinishSignal")
         .field("outcome", &state.outcome)
         .field("listeners", &state.listeners.len())
         .finish()
    }
}


/// Detaches a listener from its signal when dropped
struct Subscription {
    signal: FinishSignal,
    id: ListenerId,
}
//
impl Drop for Subscription {
    fn drop(&mut self) {
        self.signal.unsubscribe(self.id);
    }
}


/// Cancel `deferred` if `signal` reports an abort before it is resolved
///
/// The listener is detached as soon as the Deferred's chain gets past this
/// point, so a Deferred which resolved first is left alone. It is also
/// detached if the chain is dropped, e.g. because the Deferred was cancelled
/// through some other path. Completion of the signal does not affect the
/// Deferred.
///
pub fn bind_cancellation<T, E>(deferred: &Deferred<T, E>,
                               signal: &FinishSignal) -> ListenerId
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    let target = deferred.clone();
    let id = signal.subscribe(move |outcome| {
        if let Finish::Aborted(ref reason) = *outcome {
            match target.cancel() {
                Ok(()) => tracing::debug!(reason = %reason,
                                          "Deferred cancelled by abort"),
                Err(e) => tracing::trace!(error = %e,
                                          "abort raced with resolution"),
            }
        }
    });
    let subscription = Subscription { signal: signal.clone(), id };
    deferred.add_both(move |result| {
        drop(subscription);
        result
    });
    id
}
