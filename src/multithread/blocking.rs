//! Blocking on the result of a Deferred
//!
//! This module provides a way to synchronize with a Deferred by blocking the
//! calling thread until it is resolved. This synchronization mechanism is easy
//! to use and reason about, but should be used with care: the result must be
//! produced by another thread, otherwise the wait never ends. In particular,
//! never block the thread which turns the QueuedCallbackExecutor that the
//! result will be delivered through.
//!
//! Waiting takes the result away from the Deferred, which becomes Chained.

use crate::deferred::Deferred;
use crate::error::DeferredError;
use crate::status::DeferredStatus;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};


/// State shared between the waiting thread and the Deferred's chain
struct Slot<T, E> {
    /// Delivered result (mutex-protected)
    state: Mutex<SlotState<T, E>>,

    /// Condition variable used to notify the waiter
    update_cv: Condvar,
}
//
struct SlotState<T, E> {
    /// Result handed over by the chain
    result: Option<Result<T, E>>,

    /// The chain dropped our sink without calling it
    abandoned: bool,
}


/// Sink half of a Slot, which flags the slot as abandoned if it gets
/// dropped without being filled
struct SlotFiller<T, E> {
    slot: Arc<Slot<T, E>>,
}
//
impl<T, E> SlotFiller<T, E> {
    fn fill(self, result: Result<T, E>) {
        self.slot.state.lock().result = Some(result);
    }
}
//
impl<T, E> Drop for SlotFiller<T, E> {
    fn drop(&mut self) {
        {
            let mut state = self.slot.state.lock();
            if state.result.is_none() {
                state.abandoned = true;
            }
        }
        self.slot.update_cv.notify_all();
    }
}


/// Register a sink on the Deferred, and return the slot it will fill
fn attach<T, E>(deferred: &Deferred<T, E>) -> Arc<Slot<T, E>>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState { result: None, abandoned: false }),
        update_cv: Condvar::new(),
    });
    let filler = SlotFiller { slot: slot.clone() };
    deferred.hand_off(move |result| filler.fill(result));
    slot
}


/// Why nothing was delivered to an abandoned slot
fn abandon_reason<T, E>(deferred: &Deferred<T, E>) -> DeferredError {
    match deferred.status() {
        DeferredStatus::Cancelled => DeferredError::AlreadyCancelled,
        _ => DeferredError::AlreadyFired,
    }
}


/// Wait until the Deferred's chain hands over its result
///
/// Fails with AlreadyCancelled if the Deferred is or gets cancelled, and with
/// AlreadyFired if its result was already taken by another consumer.
///
pub fn block_on<T, E>(deferred: &Deferred<T, E>)
    -> Result<Result<T, E>, DeferredError>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    let slot = attach(deferred);
    let mut state = slot.state.lock();
    loop {
        if let Some(result) = state.result.take() {
            return Ok(result);
        }
        if state.abandoned {
            drop(state);
            return Err(abandon_reason(deferred));
        }
        slot.update_cv.wait(&mut state);
    }
}


/// Same as block_on(), giving up after some time
///
/// Returns None on timeout. The result is lost if it shows up afterwards.
///
pub fn block_on_timeout<T, E>(deferred: &Deferred<T, E>, timeout: Duration)
    -> Option<Result<Result<T, E>, DeferredError>>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    let deadline = Instant::now() + timeout;
    let slot = attach(deferred);
    let mut state = slot.state.lock();
    loop {
        if let Some(result) = state.result.take() {
            return Some(Ok(result));
        }
        if state.abandoned {
            drop(state);
            return Some(Err(abandon_reason(deferred)));
        }
        if slot.update_cv.wait_until(&mut state, deadline).timed_out() {
            return None;
        }
    }
}
