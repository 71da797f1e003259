//! Multithreaded producers and consumers of Deferreds
//!
//! This submodule covers the situations where a Deferred is resolved by, or
//! waited for from, another thread of the same OS process:
//!
//! - The worker pool offloads blocking work and exposes its result as a
//!   Deferred, resolved through a callback executor of the client's choosing.
//! - Polling lets a client check on an offloaded task without synchronizing
//!   with it, e.g. to refresh some progress display.
//! - Blocking lets a thread wait for a Deferred's result. Although easy to use
//!   and reason about, it should be used sparingly.
//! - Delayed calls resolve or cancel Deferreds after some time, which is how
//!   timeouts are built.

pub mod blocking;
pub mod polling;
pub mod pool;
pub mod timer;
