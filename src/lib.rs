//! Chained deferred results
//!
//! Picture yourself in a situation where: you are handling a request, and the
//! answer depends on work which is not done yet. Maybe a timer must elapse,
//! maybe a blocking computation must run on another thread, maybe another
//! server must answer first. You would rather not block while waiting, so you
//! return a placeholder for the answer, and describe what should happen to the
//! answer once it is there: wrap it in some markup, recover from an error,
//! wait for yet another operation...
//!
//! This crate provides such a placeholder, the `Deferred`. It is resolved
//! exactly once, with a value or an error, and runs the callbacks and errbacks
//! registered on it in registration order. A callback may return another
//! Deferred, which pauses the chain until that one resolves, so that chains
//! of callbacks can express sequential asynchronous logic. The same logic can
//! be written as an `async` block with `inline_callbacks`.
//!
//! Around this core, the crate provides a worker pool which turns blocking
//! functions into Deferreds, executors controlling which thread resolves
//! them, and cooperative cancellation tied to external "finished or aborted"
//! notifications.

mod chain;

pub mod cancel;
pub mod coro;
pub mod deferred;
pub mod error;
pub mod executor;
pub mod multithread;
pub mod status;

pub use crate::cancel::{bind_cancellation, CancelToken, FinishSignal};
pub use crate::coro::inline_callbacks;
pub use crate::deferred::{Deferred, IntoOutcome, Outcome};
pub use crate::error::{DeferredError, ErrorValue, UnhandledFailure};
pub use crate::multithread::pool::{PoolConfig, ThreadPool};
pub use crate::status::{DeferredStatus, TaskStatus};
