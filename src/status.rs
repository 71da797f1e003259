//! Facilities to represent the status of deferred results and offloaded tasks
//!
//! Both a Deferred and the blocking task which may eventually resolve it are
//! state machines. They start in a pending state, go through some intermediary
//! states, and finally end up in a state which won't change anymore. This
//! module provides payload-free snapshots of these states, which clients can
//! inspect without taking the underlying value away from the callback chain.


/// Snapshot of a Deferred's state
///
/// Here are the possible state transitions:
///
/// - Pending -> Fired / Failed / Cancelled
/// - Fired / Failed -> Running -> Fired / Failed / Chained
/// - Running -> Cancelled, if the nested Deferred the chain is paused on
///   goes away without a result
///
/// Running means that a handler is executing, or that the chain is paused
/// waiting for a nested Deferred. Chained means that the result was handed
/// over to another consumer (an outer chain, an awaiting future or a blocked
/// thread) and is not available to this Deferred anymore.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeferredStatus {
    /// Neither fired, failed nor cancelled yet
    Pending,

    /// The chain currently holds its token in a handler or nested Deferred
    Running,

    /// The current token is a success value
    Fired,

    /// The current token is an error
    Failed,

    /// The Deferred was cancelled before being resolved, or its chain gave
    /// up on a nested Deferred which went away
    Cancelled,

    /// The result was handed over to another consumer
    Chained,
}
//
impl DeferredStatus {
    /// Truth that fire() or fail() was called on this Deferred
    pub fn is_resolved(self) -> bool {
        use self::DeferredStatus::*;
        match self {
            Pending | Cancelled => false,
            Running | Fired | Failed | Chained => true,
        }
    }
}


/// Status of a task which was offloaded to a worker thread
///
/// Here are the possible state transitions:
///
/// - Pending -> Running / Cancelled / Error
/// - Running -> Done / Cancelled / Error
///
/// Once the task is in either of the Done, Error or Cancelled state, its
/// status won't change anymore.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task has been submitted, but no worker picked it up yet
    Pending,

    /// A worker is running the task
    Running,

    /// The task has completed and its result was handed over for delivery
    Done,

    /// The task was cancelled before its result could be delivered
    Cancelled,

    /// The task failed, or the worker went away before finishing it
    Error(String),
}


/// Check if a task status is final (i.e. won't change anymore)
pub fn is_final(s: &TaskStatus) -> bool {
    use self::TaskStatus::*;
    match *s {
        Pending | Running => false,
        Done | Cancelled | Error(_) => true,
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    /// Test that only terminal task statuses are reported as final
    #[test]
    fn final_task_statuses() {
        assert!(!is_final(&TaskStatus::Pending));
        assert!(!is_final(&TaskStatus::Running));
        assert!(is_final(&TaskStatus::Done));
        assert!(is_final(&TaskStatus::Cancelled));
        assert!(is_final(&TaskStatus::Error("boom".to_owned())));
    }

    /// Test which Deferred statuses count as resolved
    #[test]
    fn resolved_deferred_statuses() {
        assert!(!DeferredStatus::Pending.is_resolved());
        assert!(!DeferredStatus::Cancelled.is_resolved());
        assert!(DeferredStatus::Running.is_resolved());
        assert!(DeferredStatus::Fired.is_resolved());
        assert!(DeferredStatus::Failed.is_resolved());
        assert!(DeferredStatus::Chained.is_resolved());
    }
}
