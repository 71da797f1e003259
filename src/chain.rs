//! Chain draining
//!
//! Once a Deferred is resolved, its token (a success value or an error) walks
//! down the chain of registered handlers in registration order. Entries whose
//! handler does not match the token's kind are popped and skipped. A matching
//! handler consumes the token and produces the next one.
//!
//! Handlers always run without the Deferred's lock held, so they are free to
//! register more handlers, resolve other Deferreds, or even touch their own
//! Deferred. A `running` flag makes sure that only one thread drains a given
//! chain at a time: whoever pushes an entry while another thread is draining
//! simply leaves it to that thread, which re-reads the chain after every step.
//!
//! When a handler returns a nested Deferred, the chain pauses. A Sink is
//! registered on the nested Deferred which feeds its result back as the next
//! token and resumes draining, on whichever thread resolves the nested
//! Deferred. No thread ever blocks while a chain is paused. If the nested
//! Deferred was already resolved, the result comes back before the hand-off
//! returns and the current loop simply carries on, so long runs of resolved
//! nested Deferreds do not grow the stack.

use crate::deferred::{Deferred, Entry, Handler, Outcome, Sink, State};
use std::fmt;
use std::mem;


/// Matching handler, together with the token it will consume
enum Step<T, E> {
    Success(Handler<T, T, E>, T),
    Error(Handler<E, T, E>, E),
    Both(Handler<Result<T, E>, T, E>, Result<T, E>),
    Sink(Sink<T, E>, Result<T, E>),
}
//
impl<T, E> Step<T, E> {
    /// Match an entry against the current token, handing the token back if
    /// the entry has no handler of the right kind
    fn select(entry: Entry<T, E>, token: Result<T, E>)
        -> Result<Self, Result<T, E>>
    {
        match (entry, token) {
            (Entry::Pair { on_success: Some(f), .. }, Ok(value)) => {
                Ok(Step::Success(f, value))
            }
            (Entry::Pair { on_error: Some(g), .. }, Err(error)) => {
                Ok(Step::Error(g, error))
            }
            (Entry::Pair { .. }, token) => Err(token),
            (Entry::Both(h), token) => Ok(Step::Both(h, token)),
            (Entry::Sink(s), token) => Ok(Step::Sink(s, token)),
        }
    }

    /// Run the handler. Sinks produce no outcome.
    fn run(self) -> Option<Outcome<T, E>> {
        match self {
            Step::Success(f, value) => Some(f(value)),
            Step::Error(g, error) => Some(g(error)),
            Step::Both(h, token) => Some(h(token)),
            Step::Sink(s, token) => {
                s(token);
                None
            }
        }
    }

    fn is_sink(&self) -> bool {
        matches!(*self, Step::Sink(..))
    }
}


impl<T, E> Deferred<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    /// Drain the chain until it is empty, paused, or handed over
    pub(crate) fn run_chain(&self) {
        loop {
            // Find the next handler which matches the token in flight
            let step = {
                let mut inner = self.inner.lock();
                if inner.running || inner.paused {
                    return;
                }
                let mut token = match inner.state {
                    State::Resolved(ref mut slot) => match slot.take() {
                        Some(token) => token,
                        None => return,
                    },
                    State::Pending | State::Cancelled | State::Chained => {
                        return
                    }
                };
                let step = loop {
                    match inner.chain.pop_front() {
                        Some(entry) => match Step::select(entry, token) {
                            Ok(step) => break step,
                            Err(skipped) => token = skipped,
                        },
                        None => {
                            // End of the chain: a failure is left unclaimed
                            if let Err(ref error) = token {
                                let message = error.to_string();
                                tracing::debug!(error = %message,
                                                "failure reached the end of \
                                                 the callback chain");
                                inner.unhandled = Some(message);
                            }
                            inner.state = State::Resolved(Some(token));
                            return;
                        }
                    }
                };
                inner.running = true;
                inner.unhandled = None;
                if step.is_sink() {
                    inner.state = State::Chained;
                }
                step
            };

            // Run it without holding the lock
            tracing::trace!("running chain handler");
            let outcome = step.run();

            // ...and decide what comes next
            let mut inner = self.inner.lock();
            inner.running = false;
            match outcome {
                None => {
                    let leftovers = mem::take(&mut inner.chain);
                    drop(inner);
                    if !leftovers.is_empty() {
                        tracing::warn!(dropped = leftovers.len(),
                                       "handlers registered after a hand-off \
                                        will never run");
                    }
                    return;
                }
                Some(Outcome::Value(value)) => {
                    inner.state = State::Resolved(Some(Ok(value)));
                }
                Some(Outcome::Failure(error)) => {
                    inner.state = State::Resolved(Some(Err(error)));
                }
                Some(Outcome::Nested(nested)) => {
                    inner.paused = true;
                    if nested.same(self) {
                        drop(inner);
                        tracing::error!("handler returned the Deferred it is \
                                         chained to, chain stalled for good");
                        return;
                    }
                    inner.handing_off = true;
                    drop(inner);
                    tracing::trace!("chain paused on nested Deferred");
                    let resumer = Resumer { outer: Some(self.clone()) };
                    nested.hand_off(move |result| resumer.resume(result));

                    // A nested Deferred which was already resolved resumes
                    // us from within hand_off(), and leaves the rest of the
                    // chain to this loop
                    let mut inner = self.inner.lock();
                    inner.handing_off = false;
                    if inner.paused {
                        return;
                    }
                }
            }
        }
    }

    /// Carry on draining with the result of a nested Deferred
    pub(crate) fn resume(&self, result: Result<T, E>) {
        {
            let mut inner = self.inner.lock();
            inner.paused = false;
            inner.state = State::Resolved(Some(result));
            if inner.handing_off {
                return;
            }
        }
        tracing::trace!("chain resumed");
        self.run_chain();
    }

    /// Give up on a chain whose nested Deferred went away without a result
    ///
    /// The outer Deferred ends up cancelled and its remaining handlers are
    /// dropped, which also releases anyone blocked on it.
    ///
    fn abandon_nested(&self) {
        let discarded = {
            let mut inner = self.inner.lock();
            if !inner.paused {
                return;
            }
            inner.paused = false;
            inner.state = State::Cancelled;
            inner.unhandled = None;
            mem::take(&mut inner.chain)
        };
        tracing::debug!(discarded = discarded.len(),
                        "nested Deferred dropped without a result, \
                         chain cancelled");
        drop(discarded);
    }
}


/// Sink through which a nested Deferred hands its result to the outer chain
///
/// If the nested Deferred drops it without calling it (because it was
/// cancelled, chained elsewhere or dropped while pending), the outer
/// Deferred is cancelled instead of waiting forever.
///
struct Resumer<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    outer: Option<Deferred<T, E>>,
}
//
impl<T, E> Resumer<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    fn resume(mut self, result: Result<T, E>) {
        if let Some(outer) = self.outer.take() {
            outer.resume(result);
        }
    }
}
//
impl<T, E> Drop for Resumer<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    fn drop(&mut self) {
        if let Some(outer) = self.outer.take() {
            outer.abandon_nested();
        }
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use crate::deferred::{Deferred, Outcome};
    use crate::error::{DeferredError, ErrorValue};
    use crate::multithread::blocking;
    use crate::status::DeferredStatus;
    use parking_lot::Mutex;
    use std::sync::{Arc, Barrier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Enclose text in an HTML tag
    fn add_tag(text: String, tag: &str) -> Result<String, ErrorValue> {
        Ok(format!("<{0}>{1}</{0}>", tag, text))
    }

    /// Check that a nested Deferred pauses the outer chain until it fires
    #[test]
    fn nested_flattening() {
        let outer = Deferred::<String>::new();
        let nested = Deferred::<String>::new();
        let returned = nested.clone();
        outer.add_callback(|s| add_tag(s, "i"))
             .add_callback(move |_| returned)
             .add_callback(|s| add_tag(s, "u"));

        outer.fire("a".to_owned()).unwrap();
        assert!(outer.is_paused());
        assert_eq!(outer.status(), DeferredStatus::Running);
        assert!(outer.result().is_none());

        nested.fire("<i>a</i>".to_owned()).unwrap();
        assert!(!outer.is_paused());
        assert_eq!(outer.result().unwrap().unwrap(), "<u><i>a</i></u>");
        assert_eq!(nested.status(), DeferredStatus::Chained);
    }

    /// Check that an already fired nested Deferred resumes the chain at once
    #[test]
    fn nested_already_fired() {
        let outer = Deferred::<String>::new();
        outer.add_callback(|s| Deferred::succeed(s + "!"))
             .add_callback(|s| add_tag(s, "b"));
        outer.fire("hi".to_owned()).unwrap();
        assert_eq!(outer.result().unwrap().unwrap(), "<b>hi!</b>");
    }

    /// Check that a failing nested Deferred routes to the next errback
    #[test]
    fn nested_failure() {
        let outer = Deferred::<String>::new();
        let nested = Deferred::<String>::new();
        let returned = nested.clone();
        outer.add_callback(move |_| returned)
             .add_callback(|s| add_tag(s, "never"))
             .add_errback(|e: ErrorValue| Ok(format!("recovered from {}", e)));
        outer.fire("x".to_owned()).unwrap();
        nested.fail(ErrorValue::msg("timeout")).unwrap();
        assert_eq!(outer.result().unwrap().unwrap(), "recovered from timeout");
    }

    /// Check that handlers registered while paused wait their turn
    #[test]
    fn registration_while_paused() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer = Deferred::<u32>::new();
        let nested = Deferred::<u32>::new();
        let returned = nested.clone();
        let o1 = order.clone();
        outer.add_callback(move |v| {
            o1.lock().push(("first", v));
            Outcome::Nested(returned)
        });
        outer.fire(1).unwrap();

        let o2 = order.clone();
        outer.add_callback(move |v| {
            o2.lock().push(("second", v));
            Ok(v + 1)
        });
        assert_eq!(order.lock().len(), 1);

        nested.fire(10).unwrap();
        assert_eq!(*order.lock(), vec![("first", 1), ("second", 10)]);
        assert_eq!(outer.result().unwrap().unwrap(), 11);
    }

    /// Check that nested Deferreds may themselves pause on nested Deferreds
    #[test]
    fn deep_nesting() {
        let outer = Deferred::<String>::new();
        let middle = Deferred::<String>::new();
        let inner = Deferred::<String>::new();
        let m = middle.clone();
        let i = inner.clone();
        middle.add_callback(move |_| i).add_callback(|s| add_tag(s, "m"));
        outer.add_callback(move |_| m).add_callback(|s| add_tag(s, "o"));

        outer.fire("start".to_owned()).unwrap();
        middle.fire("ignored".to_owned()).unwrap();
        assert!(outer.is_paused());
        assert!(middle.is_paused());

        inner.fire("core".to_owned()).unwrap();
        assert_eq!(outer.result().unwrap().unwrap(), "<o><m>core</m></o>");
    }

    /// Check that a nested Deferred fired from another thread resumes the
    /// outer chain in registration order
    #[test]
    fn nested_fired_elsewhere() {
        let outer = Deferred::<String>::new();
        let nested = Deferred::<String>::new();
        let returned = nested.clone();
        outer.add_callback(|s| add_tag(s, "i"))
             .add_callback(move |_| returned)
             .add_callback(|s| add_tag(s, "u"));
        outer.fire("a".to_owned()).unwrap();

        let worker = thread::spawn(move || nested.fire("<i>a</i>".to_owned()));
        assert_eq!(worker.join().unwrap(), Ok(()));
        assert_eq!(outer.result().unwrap().unwrap(), "<u><i>a</i></u>");
    }

    /// Check that handlers may register more handlers on their own Deferred
    #[test]
    fn reentrant_registration() {
        let d = Deferred::<u32>::new();
        let handle = d.clone();
        d.add_callback(move |v| {
            handle.add_callback(|v| Ok(v * 2));
            Ok(v + 1)
        });
        d.fire(1).unwrap();
        assert_eq!(d.result().unwrap().unwrap(), 4);
        assert_eq!(d.fire(5), Err(DeferredError::AlreadyFired));
    }

    /// Check that long runs of already fired nested Deferreds are flattened
    /// in a loop, even on a thread with a small stack
    #[test]
    fn long_flattening_run() {
        let worker = thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(|| {
                let d = Deferred::<u64>::new();
                for _ in 0..10_000 {
                    d.add_callback(|v| Deferred::succeed(v + 1));
                }
                d.fire(0).unwrap();
                d.result().unwrap().unwrap()
            })
            .unwrap();
        assert_eq!(worker.join().unwrap(), 10_000);
    }

    /// Check that flattening still works when the nested Deferreds have
    /// handlers of their own
    #[test]
    fn flattening_through_nested_chains() {
        let d = Deferred::<u64>::new();
        for _ in 0..1_000 {
            d.add_callback(|v| {
                let nested = Deferred::<u64>::new();
                nested.add_callback(|v| Ok(v * 2));
                nested.fire(v).unwrap();
                nested
            });
            d.add_callback(|v| Ok(v / 2 + 1));
        }
        d.fire(0).unwrap();
        assert_eq!(d.result().unwrap().unwrap(), 1_000);
    }

    /// Check that cancelling a nested Deferred cancels the paused outer one
    /// instead of leaving it hanging
    #[test]
    fn nested_cancellation() {
        let errbacks = Arc::new(AtomicUsize::new(0));
        let outer = Deferred::<u32>::new();
        let nested = Deferred::<u32>::new();
        let returned = nested.clone();
        let e = errbacks.clone();
        outer.add_callback(move |_| returned)
             .add_errback(move |err| {
                 e.fetch_add(1, Ordering::SeqCst);
                 Err(err)
             });
        outer.fire(1).unwrap();
        assert!(outer.is_paused());

        // Someone is waiting on the outer Deferred meanwhile
        let waited = outer.clone();
        let waiter = thread::spawn(move || {
            blocking::block_on_timeout(&waited, Duration::from_secs(10))
        });
        thread::sleep(Duration::from_millis(50));

        assert_eq!(nested.cancel(), Ok(()));
        assert!(matches!(waiter.join().unwrap(),
                         Some(Err(DeferredError::AlreadyCancelled))));
        assert!(!outer.is_paused());
        assert_eq!(outer.status(), DeferredStatus::Cancelled);
        assert!(outer.unhandled_failure().is_none());
        assert_eq!(outer.cancel(), Err(DeferredError::AlreadyCancelled));
        assert_eq!(errbacks.load(Ordering::SeqCst), 0);
    }

    /// Check that a nested Deferred which was cancelled before being
    /// returned cancels the outer chain right away
    #[test]
    fn already_cancelled_nested() {
        let outer = Deferred::<u32>::new();
        let nested = Deferred::<u32>::new();
        nested.cancel().unwrap();
        outer.add_callback(move |_| nested).add_callback(|v| Ok(v + 1));
        outer.fire(1).unwrap();
        assert_eq!(outer.status(), DeferredStatus::Cancelled);
        assert!(!outer.is_paused());
    }

    /// Check that handlers registered from several threads while another
    /// thread fires each run exactly once, in per-thread order
    #[test]
    fn concurrent_registration_and_fire() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 50;
        for _ in 0..20 {
            let d = Deferred::<usize>::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let start = Arc::new(Barrier::new(THREADS + 1));

            let registrars = (0..THREADS).map(|t| {
                let (d, seen, start) = (d.clone(), seen.clone(), start.clone());
                thread::spawn(move || {
                    start.wait();
                    for i in 0..PER_THREAD {
                        let seen = seen.clone();
                        d.add_callback(move |v| {
                            seen.lock().push((t, i));
                            Ok(v + 1)
                        });
                    }
                })
            }).collect::<Vec<_>>();
            let firer = {
                let (d, start) = (d.clone(), start.clone());
                thread::spawn(move || {
                    start.wait();
                    d.fire(0)
                })
            };

            for registrar in registrars {
                registrar.join().unwrap();
            }
            assert_eq!(firer.join().unwrap(), Ok(()));
            assert_eq!(d.result().unwrap().unwrap(), THREADS * PER_THREAD);

            let seen = seen.lock();
            assert_eq!(seen.len(), THREADS * PER_THREAD);
            for t in 0..THREADS {
                let order = seen.iter()
                                .filter(|&&(thread, _)| thread == t)
                                .map(|&(_, i)| i)
                                .collect::<Vec<_>>();
                assert_eq!(order, (0..PER_THREAD).collect::<Vec<_>>());
            }
        }
    }
}
