//! Errors produced and carried by Deferreds
//!
//! Two families of errors live here. `DeferredError` and `UnhandledFailure`
//! are programmer-error signals returned to whoever misused a Deferred or left
//! a failure unclaimed. `ErrorValue`, on the other hand, is the value which
//! travels down errback chains: a cheaply cloneable wrapper around whatever
//! went wrong, plus an optional note added by the errbacks it went through.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;


/// Misuse of the single-assignment contract of a Deferred
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeferredError {
    /// fire(), fail() or cancel() was called on an already resolved Deferred
    #[error("Deferred has already been fired")]
    AlreadyFired,

    /// fire(), fail() or cancel() was called on a cancelled Deferred
    #[error("Deferred has already been cancelled")]
    AlreadyCancelled,
}


/// A failure token which reached the end of a callback chain unclaimed
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Unhandled error in Deferred: {message}")]
pub struct UnhandledFailure {
    message: String,
}
//
impl UnhandledFailure {
    pub(crate) fn new(message: String) -> Self {
        UnhandledFailure { message }
    }

    /// Rendering of the error which nobody handled
    pub fn message(&self) -> &str {
        &self.message
    }
}


/// Plain-text error cause
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);


/// Panic captured at a worker thread boundary
#[derive(Debug, thiserror::Error)]
#[error("task panicked: {0}")]
pub struct Panicked(String);


/// Error travelling down an errback chain
///
/// The underlying cause can be any standard error. As with `anyhow::Error`,
/// `ErrorValue` does not implement `std::error::Error` itself, which is what
/// allows any error to be converted into it with `?`.
///
#[derive(Clone)]
pub struct ErrorValue {
    /// What actually went wrong
    cause: Arc<dyn StdError + Send + Sync + 'static>,

    /// Annotation added by errbacks which re-wrapped the error
    context: Option<String>,
}
//
impl ErrorValue {
    /// Wrap an underlying error
    pub fn new<E>(cause: E) -> Self
        where E: StdError + Send + Sync + 'static
    {
        ErrorValue {
            cause: Arc::new(cause),
            context: None,
        }
    }

    /// Build an error from a plain description
    pub fn msg(text: impl Into<String>) -> Self {
        Self::new(Message(text.into()))
    }

    /// Build an error from a panic payload caught with catch_unwind
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let text = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Self::new(Panicked(text))
    }

    /// Attach a note to the error before passing it further down the chain
    ///
    /// Notes stack up, the most recent one coming first.
    ///
    pub fn with_context(mut self, note: impl Into<String>) -> Self {
        let note = note.into();
        self.context = Some(match self.context.take() {
            Some(previous) => format!("{}: {}", note, previous),
            None => note,
        });
        self
    }

    /// Underlying cause
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.cause
    }

    /// Annotation attached by errbacks, if any
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Check the concrete type of the underlying cause
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.cause.is::<E>()
    }

    /// Access the underlying cause as a concrete error type
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.cause.downcast_ref::<E>()
    }
}
//
impl<E> From<E> for ErrorValue
    where E: StdError + Send + Sync + 'static
{
    fn from(cause: E) -> Self {
        Self::new(cause)
    }
}
//
impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.context {
            Some(ref note) => write!(f, "{}: {}", note, self.cause),
            None => write!(f, "{}", self.cause),
        }
    }
}
//
impl fmt::Debug for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ErrorValue")
         .field("cause", &self.cause)
         .field("context", &self.context)
         .finish()
    }
}
//
impl From<ErrorValue> for Box<dyn StdError + Send + Sync + 'static> {
    fn from(error: ErrorValue) -> Self {
        Box::new(Surfaced(error))
    }
}
//
impl From<ErrorValue> for Box<dyn StdError + 'static> {
    fn from(error: ErrorValue) -> Self {
        Box::new(Surfaced(error))
    }
}


/// ErrorValue leaving the errback chain as a standard error
#[derive(Debug)]
struct Surfaced(ErrorValue);
//
impl fmt::Display for Surfaced {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
//
impl StdError for Surfaced {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.cause())
    }
}
