//! Callback executors
//!
//! When blocking work runs on a worker thread, one important design issue is
//! to decide where the Deferred it produces should be resolved, since
//! resolving a Deferred runs its whole callback chain on the spot.
//!
//! The traditional answer is to resolve it directly on the worker, as part of
//! completing the task. This inline approach has minimal scheduling overhead,
//! and it is safe because every Deferred serializes its resolution with
//! concurrent handler registration. But it also means that client callbacks
//! run on a pool thread, occupying it, and interleaving with whatever the
//! owning thread is doing.
//!
//! The alternative is a client-side component in charge of receiving
//! completions from workers, and resolving the Deferreds on the thread which
//! owns them. Following the terminology of C++ tasking runtimes, we call this
//! component a callback executor, or executor for short.

pub mod inline;
pub mod queued;


/// Deferred resolution work sent back by a worker thread
pub type Completion = Box<dyn FnOnce() + Send + 'static>;


/// Owning-context side of completion delivery
pub trait CallbackExecutor {
    /// Notification channel which workers use to send completions back
    type Channel: CallbackChannel;

    /// Set up a new notification channel towards this executor
    fn channel(&self) -> Self::Channel;
}


/// Worker side of completion delivery
pub trait CallbackChannel: Clone + Send + 'static {
    /// Hand a completion over to the owning context
    fn notify(&self, completion: Completion);
}
