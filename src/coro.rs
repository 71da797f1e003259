//! Coroutine-style sequencing over Deferreds
//!
//! Chaining one callback per step gets tedious when a computation awaits
//! several asynchronous results in a row. Instead, Deferreds can be awaited
//! from an `async` block, and `inline_callbacks` turns that block into a
//! Deferred of its own.
//!
//! Every `.await` on a Deferred maps to exactly one suspension point: the
//! block is parked until that Deferred resolves, and it is resumed by
//! whichever thread resolves it. No executor or runtime is involved, and no
//! thread ever blocks.

use crate::deferred::Deferred;
use parking_lot::Mutex;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};


/// Result slot shared between a DeferredFuture and the Deferred's chain
struct FutureSlot<T, E> {
    result: Option<Result<T, E>>,
    waker: Option<Waker>,
}


/// Sink half of a FutureSlot
///
/// If the Deferred drops it without a result (cancelled, chained elsewhere,
/// or dropped while pending), the stored waker is released, since nobody will
/// ever use it.
///
struct SlotDelivery<T, E> {
    slot: Arc<Mutex<FutureSlot<T, E>>>,
    delivered: bool,
}
//
impl<T, E> SlotDelivery<T, E> {
    fn deliver(mut self, result: Result<T, E>) {
        self.delivered = true;
        let waker = {
            let mut slot = self.slot.lock();
            slot.result = Some(result);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}
//
impl<T, E> Drop for SlotDelivery<T, E> {
    fn drop(&mut self) {
        if !self.delivered {
            let waker = self.slot.lock().waker.take();
            drop(waker);
        }
    }
}


/// Future which resolves to the result of a Deferred
///
/// The result is taken away from the Deferred's chain when the future is
/// first polled, at which point the Deferred becomes Chained. Awaiting a
/// Deferred which ends up cancelled never completes: the waker is released
/// instead. Inside `inline_callbacks`, this cancels the coroutine's own
/// Deferred.
///
pub struct DeferredFuture<T, E> {
    /// Deferred to attach to on first poll
    deferred: Option<Deferred<T, E>>,

    /// Where the chain will deliver its result
    slot: Arc<Mutex<FutureSlot<T, E>>>,
}
//
impl<T, E> Future for DeferredFuture<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        {
            let mut slot = self.slot.lock();
            if let Some(result) = slot.result.take() {
                return Poll::Ready(result);
            }
            slot.waker = Some(cx.waker().clone());
        }

        if let Some(deferred) = self.deferred.take() {
            let delivery = SlotDelivery {
                slot: self.slot.clone(),
                delivered: false,
            };
            deferred.hand_off(move |result| delivery.deliver(result));

            // The Deferred may have been resolved already
            if let Some(result) = self.slot.lock().result.take() {
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    }
}
//
impl<T, E> IntoFuture for Deferred<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    type Output = Result<T, E>;
    type IntoFuture = DeferredFuture<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        DeferredFuture {
            deferred: Some(self),
            slot: Arc::new(Mutex::new(FutureSlot { result: None, waker: None })),
        }
    }
}


type BoxedFuture<T, E> =
    Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;


/// Async block being driven to completion by its wakers
///
/// Wakers are the only strong references to a coroutine. Once none is left,
/// nothing can resume the block anymore, and the coroutine's Deferred is
/// cancelled as it goes away.
///
struct Coroutine<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    /// The block itself, gone once it completed or was cancelled
    future: Mutex<Option<BoxedFuture<T, E>>>,

    /// A wake-up happened since the last poll started
    notified: AtomicBool,

    /// The Deferred below was cancelled
    cancelled: AtomicBool,

    /// Where the block's result goes
    deferred: Deferred<T, E>,
}
//
impl<T, E> Coroutine<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    /// Poll the block until it is parked, unless another thread is already
    /// polling it, in which case that thread takes care of this wake-up
    fn run(self: &Arc<Self>) {
        self.notified.store(true, Ordering::Release);
        loop {
            let mut slot = match self.future.try_lock() {
                Some(slot) => slot,
                None => return,
            };
            if self.cancelled.load(Ordering::Acquire) {
                *slot = None;
                return;
            }
            if !self.notified.swap(false, Ordering::AcqRel) {
                // Catch wake-ups which lost the race for the lock
                drop(slot);
                if self.notified.load(Ordering::Acquire) {
                    continue;
                }
                return;
            }
            let future = match *slot {
                Some(ref mut future) => future,
                None => return,
            };

            let waker = Waker::from(self.clone());
            let mut cx = Context::from_waker(&waker);
            if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
                *slot = None;
                drop(slot);
                let delivered = match result {
                    Ok(value) => self.deferred.fire(value),
                    Err(error) => self.deferred.fail(error),
                };
                if let Err(e) = delivered {
                    tracing::debug!(error = %e, "coroutine result discarded");
                }
                return;
            }
        }
    }

    /// Drop the block, now if possible, otherwise at its next wake-up
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(mut slot) = self.future.try_lock() {
            *slot = None;
        }
    }
}
//
impl<T, E> Drop for Coroutine<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    fn drop(&mut self) {
        if self.future.get_mut().take().is_some() {
            tracing::debug!("coroutine parked on a Deferred which went away");
            if let Err(e) = self.deferred.cancel() {
                tracing::trace!(error = %e, "coroutine Deferred already done");
            }
        }
    }
}
//
impl<T, E> Wake for Coroutine<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    fn wake(self: Arc<Self>) {
        self.run();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.run();
    }
}


/// Run an async block which awaits Deferreds, and expose its result as a
/// Deferred
///
/// The block starts running right away, on the calling thread, up to its
/// first suspension point. Cancelling the returned Deferred drops the block.
///
pub fn inline_callbacks<T, E, F>(block: F) -> Deferred<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static,
          F: Future<Output = Result<T, E>> + Send + 'static
{
    let coroutine = Arc::new_cyclic(|weak: &Weak<Coroutine<T, E>>| {
        let weak = weak.clone();
        Coroutine {
            future: Mutex::new(Some(Box::pin(block) as BoxedFuture<T, E>)),
            notified: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            deferred: Deferred::with_canceller(move || {
                if let Some(coroutine) = weak.upgrade() {
                    coroutine.cancel();
                }
            }),
        }
    });
    coroutine.run();
    coroutine.deferred.clone()
}
