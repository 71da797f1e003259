//! Single-assignment deferred results with callback chains
//!
//! A `Deferred` stands for a result which is not available yet. Whoever
//! creates it will eventually resolve it exactly once, either with a value
//! through `fire()` or with an error through `fail()`. Meanwhile, and also
//! afterwards, clients register handlers which form an ordered chain. Each
//! handler receives the output of the previous matching handler: callbacks see
//! success values, errbacks see errors, and a handler of the wrong kind is
//! skipped over without touching the value in flight.
//!
//! Handlers run synchronously on whichever thread resolves the Deferred (or
//! registers a handler after resolution). The only suspension point is a
//! handler returning another Deferred, in which case the chain pauses until
//! that nested Deferred is resolved. See the `chain` module for the details.
//!
//! Deferred handles are cheap to clone and can be sent across threads. All
//! handles of one Deferred share a lock which serializes resolution,
//! cancellation and handler registration.

use crate::error::{DeferredError, ErrorValue, UnhandledFailure};
use crate::status::DeferredStatus;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;


/// What a handler hands over to the rest of the chain
pub enum Outcome<T, E = ErrorValue> {
    /// The next token is a success value
    Value(T),

    /// The next token is an error
    Failure(E),

    /// Pause the chain until this Deferred resolves, then carry on with its
    /// result
    Nested(Deferred<T, E>),
}


/// Anything which a handler may return
///
/// Handlers usually return a `Result`, but they may also return a `Deferred`
/// to make the chain wait for another asynchronous operation, or an explicit
/// `Outcome`.
///
pub trait IntoOutcome<T, E> {
    fn into_outcome(self) -> Outcome<T, E>;
}
//
impl<T, E> IntoOutcome<T, E> for Outcome<T, E> {
    fn into_outcome(self) -> Outcome<T, E> {
        self
    }
}
//
impl<T, E> IntoOutcome<T, E> for Result<T, E> {
    fn into_outcome(self) -> Outcome<T, E> {
        match self {
            Ok(value) => Outcome::Value(value),
            Err(error) => Outcome::Failure(error),
        }
    }
}
//
impl<T, E> IntoOutcome<T, E> for Deferred<T, E> {
    fn into_outcome(self) -> Outcome<T, E> {
        Outcome::Nested(self)
    }
}


/// Boxed chain handler
pub(crate) type Handler<I, T, E> =
    Box<dyn FnOnce(I) -> Outcome<T, E> + Send + 'static>;

/// Boxed consumer which takes the result away from the chain
pub(crate) type Sink<T, E> = Box<dyn FnOnce(Result<T, E>) + Send + 'static>;


/// One link of a callback chain
pub(crate) enum Entry<T, E> {
    /// Callback/errback pair, either side may be missing
    Pair {
        on_success: Option<Handler<T, T, E>>,
        on_error: Option<Handler<E, T, E>>,
    },

    /// Handler which sees tokens of both kinds
    Both(Handler<Result<T, E>, T, E>),

    /// Final consumer, after which this Deferred is Chained
    Sink(Sink<T, E>),
}


/// Internal state of a Deferred
pub(crate) enum State<T, E> {
    /// Not resolved yet
    Pending,

    /// Cancelled before resolution
    Cancelled,

    /// Resolved. The token is taken out while a handler runs or while the
    /// chain is paused on a nested Deferred.
    Resolved(Option<Result<T, E>>),

    /// The token was handed over to a Sink
    Chained,
}


/// State shared by all handles to a Deferred
pub(crate) struct Inner<T, E> {
    /// Where the Deferred stands, and the token in flight
    pub(crate) state: State<T, E>,

    /// Handlers which did not run yet, in registration order
    pub(crate) chain: VecDeque<Entry<T, E>>,

    /// Cleanup hook invoked if the Deferred is cancelled while pending
    pub(crate) canceller: Option<Box<dyn FnOnce() + Send + 'static>>,

    /// The chain waits for a nested Deferred
    pub(crate) paused: bool,

    /// A handler is currently executing
    pub(crate) running: bool,

    /// The draining thread is registering the chain's resume hook on a
    /// nested Deferred, and will pick up a result delivered meanwhile
    pub(crate) handing_off: bool,

    /// Rendering of a failure which reached the end of the chain unclaimed
    pub(crate) unhandled: Option<String>,
}
//
impl<T, E> Drop for Inner<T, E> {
    /// A failure nobody claimed must not vanish silently
    fn drop(&mut self) {
        if let Some(message) = self.unhandled.take() {
            tracing::error!(error = %message, "Unhandled error in Deferred");
        }
    }
}


/// Single-assignment future with an ordered callback/errback chain
pub struct Deferred<T, E = ErrorValue> {
    pub(crate) inner: Arc<Mutex<Inner<T, E>>>,
}
//
impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Deferred { inner: self.inner.clone() }
    }
}
//
impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Deferred")
         .field("status", &self.status())
         .field("paused", &self.is_paused())
         .finish()
    }
}
//
impl<T, E> Deferred<T, E> {
    /// Current state of the Deferred
    pub fn status(&self) -> DeferredStatus {
        let inner = self.inner.lock();
        match inner.state {
            State::Pending => DeferredStatus::Pending,
            State::Cancelled => DeferredStatus::Cancelled,
            State::Resolved(Some(Ok(_))) => DeferredStatus::Fired,
            State::Resolved(Some(Err(_))) => DeferredStatus::Failed,
            State::Resolved(None) => DeferredStatus::Running,
            State::Chained => DeferredStatus::Chained,
        }
    }

    /// Truth that the chain is waiting for a nested Deferred
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Failure which reached the end of the chain without meeting an errback
    ///
    /// Registering an errback afterwards claims the failure again.
    ///
    pub fn unhandled_failure(&self) -> Option<UnhandledFailure> {
        self.inner.lock().unhandled.clone().map(UnhandledFailure::new)
    }

    /// Truth that both handles point to the same Deferred
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
//
impl<T, E> Deferred<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    /// Create a pending Deferred without a canceller
    pub fn new() -> Self {
        Self::from_parts(State::Pending, None)
    }

    /// Create a pending Deferred whose canceller will be called if it is
    /// cancelled before being resolved
    pub fn with_canceller<C>(canceller: C) -> Self
        where C: FnOnce() + Send + 'static
    {
        Self::from_parts(State::Pending, Some(Box::new(canceller)))
    }

    /// Create a Deferred which has already fired with some value
    pub fn succeed(value: T) -> Self {
        Self::from_parts(State::Resolved(Some(Ok(value))), None)
    }

    /// Create a Deferred which has already failed with some error
    pub fn failed(error: E) -> Self {
        let deferred = Self::from_parts(State::Resolved(Some(Err(error))), None);
        // Nothing is registered yet, so this only flags the failure as
        // unhandled until an errback shows up
        deferred.run_chain();
        deferred
    }

    /// Call a function now and expose whatever it returns as a Deferred
    pub fn maybe_deferred<F, R>(f: F) -> Self
        where F: FnOnce() -> R,
              R: IntoOutcome<T, E>
    {
        match f().into_outcome() {
            Outcome::Value(value) => Self::succeed(value),
            Outcome::Failure(error) => Self::failed(error),
            Outcome::Nested(deferred) => deferred,
        }
    }

    fn from_parts(state: State<T, E>,
                  canceller: Option<Box<dyn FnOnce() + Send + 'static>>)
        -> Self
    {
        Deferred {
            inner: Arc::new(Mutex::new(Inner {
                state,
                chain: VecDeque::new(),
                canceller,
                paused: false,
                running: false,
                handing_off: false,
                unhandled: None,
            })),
        }
    }

    /// Register a callback/errback pair
    pub fn add_callbacks<F, RF, G, RG>(&self, on_success: F, on_error: G)
        -> &Self
        where F: FnOnce(T) -> RF + Send + 'static,
              RF: IntoOutcome<T, E>,
              G: FnOnce(E) -> RG + Send + 'static,
              RG: IntoOutcome<T, E>
    {
        self.push(Entry::Pair {
            on_success: Some(Box::new(move |v| on_success(v).into_outcome())),
            on_error: Some(Box::new(move |e| on_error(e).into_outcome())),
        });
        self
    }

    /// Register a handler for success values only
    pub fn add_callback<F, R>(&self, on_success: F) -> &Self
        where F: FnOnce(T) -> R + Send + 'static,
              R: IntoOutcome<T, E>
    {
        self.push(Entry::Pair {
            on_success: Some(Box::new(move |v| on_success(v).into_outcome())),
            on_error: None,
        });
        self
    }

    /// Register a handler for errors only
    pub fn add_errback<G, R>(&self, on_error: G) -> &Self
        where G: FnOnce(E) -> R + Send + 'static,
              R: IntoOutcome<T, E>
    {
        self.push(Entry::Pair {
            on_success: None,
            on_error: Some(Box::new(move |e| on_error(e).into_outcome())),
        });
        self
    }

    /// Register a handler which sees both success values and errors
    pub fn add_both<F, R>(&self, handler: F) -> &Self
        where F: FnOnce(Result<T, E>) -> R + Send + 'static,
              R: IntoOutcome<T, E>
    {
        self.push(Entry::Both(Box::new(move |r| handler(r).into_outcome())));
        self
    }

    /// Fluent variant of add_callback()
    pub fn then<F, R>(self, on_success: F) -> Self
        where F: FnOnce(T) -> R + Send + 'static,
              R: IntoOutcome<T, E>
    {
        self.add_callback(on_success);
        self
    }

    /// Forward the result of this Deferred to another one
    ///
    /// This Deferred becomes Chained once its chain reaches that point.
    ///
    pub fn chain_deferred(&self, other: Deferred<T, E>) {
        self.hand_off(move |result| {
            let outcome = match result {
                Ok(value) => other.fire(value),
                Err(error) => other.fail(error),
            };
            if let Err(e) = outcome {
                tracing::debug!(error = %e, "chained Deferred refused result");
            }
        });
    }

    /// Hand the token over to a consumer outside of the chain
    pub(crate) fn hand_off<S>(&self, sink: S)
        where S: FnOnce(Result<T, E>) + Send + 'static
    {
        self.push(Entry::Sink(Box::new(sink)));
    }

    /// Append an entry to the chain and drain whatever can be drained
    fn push(&self, entry: Entry<T, E>) {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                State::Chained => {
                    tracing::warn!("handler added to a chained Deferred \
                                    will never run");
                    return;
                }
                State::Cancelled => {
                    tracing::debug!("handler added to a cancelled Deferred \
                                     dropped");
                    return;
                }
                State::Pending | State::Resolved(_) => {}
            }
            inner.chain.push_back(entry);
        }
        self.run_chain();
    }

    /// Resolve the Deferred with a success value and run its chain
    pub fn fire(&self, value: T) -> Result<(), DeferredError> {
        self.resolve(Ok(value))
    }

    /// Resolve the Deferred with an error and run its chain
    pub fn fail(&self, error: E) -> Result<(), DeferredError> {
        self.resolve(Err(error))
    }

    fn resolve(&self, result: Result<T, E>) -> Result<(), DeferredError> {
        let canceller = {
            let mut inner = self.inner.lock();
            match inner.state {
                State::Pending => {}
                State::Cancelled => return Err(DeferredError::AlreadyCancelled),
                State::Resolved(_) | State::Chained => {
                    return Err(DeferredError::AlreadyFired)
                }
            }
            tracing::debug!(success = result.is_ok(), "Deferred resolved");
            inner.state = State::Resolved(Some(result));
            inner.canceller.take()
        };
        drop(canceller);
        self.run_chain();
        Ok(())
    }

    /// Cancel a pending Deferred
    ///
    /// The canceller runs once, and the registered handlers are dropped
    /// without running. Later fire() and fail() calls are refused.
    ///
    pub fn cancel(&self) -> Result<(), DeferredError> {
        let (canceller, discarded) = {
            let mut inner = self.inner.lock();
            match inner.state {
                State::Pending => {}
                State::Cancelled => return Err(DeferredError::AlreadyCancelled),
                State::Resolved(_) | State::Chained => {
                    return Err(DeferredError::AlreadyFired)
                }
            }
            inner.state = State::Cancelled;
            (inner.canceller.take(), mem::take(&mut inner.chain))
        };
        tracing::debug!(discarded = discarded.len(), "Deferred cancelled");
        drop(discarded);
        if let Some(canceller) = canceller {
            canceller();
        }
        Ok(())
    }
}
//
impl<T, E> Default for Deferred<T, E>
    where T: Send + 'static,
          E: fmt::Display + Send + 'static
{
    fn default() -> Self {
        Self::new()
    }
}
//
impl<T: Clone, E: Clone> Deferred<T, E> {
    /// Copy of the token currently held by the chain, if any
    pub fn result(&self) -> Option<Result<T, E>> {
        match self.inner.lock().state {
            State::Resolved(Some(ref result)) => Some(result.clone()),
            _ => None,
        }
    }
}
