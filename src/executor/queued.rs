//! Queued callback executor, implementing owning-thread completion delivery
//!
//! Workers push their completions into a message queue, and the thread which
//! owns the executor runs them whenever it turns its event loop. Callback
//! chains thus always run on the owning thread, one completion at a time.

use crate::executor::{CallbackChannel, CallbackExecutor, Completion};
use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};


/// CallbackExecutor implementation backed by a completion queue
pub struct QueuedCallbackExecutor {
    /// Kept around so that channels can be created at any time
    sender: Sender<Completion>,

    /// Completions waiting to be run by the owner
    receiver: Receiver<Completion>,
}
//
impl QueuedCallbackExecutor {
    /// Create a new executor with an empty completion queue
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        QueuedCallbackExecutor { sender, receiver }
    }

    /// Number of completions waiting to be run
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Run every completion which is already queued, without blocking
    ///
    /// Returns how many completions were run.
    ///
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(completion) = self.receiver.try_recv() {
            completion();
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for a completion, then run it along with anything
    /// else which is queued
    ///
    /// Returns how many completions were run.
    ///
    pub fn turn(&self, timeout: Duration) -> usize {
        match self.receiver.recv_timeout(timeout) {
            Ok(completion) => {
                completion();
                1 + self.run_pending()
            }
            Err(RecvTimeoutError::Timeout) => 0,
            // We own a sender, so the queue cannot be disconnected
            Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Run completions until `done` returns true or `timeout` elapses
    ///
    /// Returns the final verdict of `done`.
    ///
    pub fn run_until<F>(&self, mut done: F, timeout: Duration) -> bool
        where F: FnMut() -> bool
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.turn(deadline - now);
        }
    }
}
//
impl Default for QueuedCallbackExecutor {
    fn default() -> Self {
        Self::new()
    }
}
//
impl CallbackExecutor for QueuedCallbackExecutor {
    type Channel = QueuedCallbackChannel;

    fn channel(&self) -> Self::Channel {
        QueuedCallbackChannel { sender: self.sender.clone() }
    }
}


/// Callback channel which enqueues completions for the owning thread
#[derive(Clone)]
pub struct QueuedCallbackChannel {
    sender: Sender<Completion>,
}
//
impl CallbackChannel for QueuedCallbackChannel {
    fn notify(&self, completion: Completion) {
        if self.sender.send(completion).is_err() {
            tracing::debug!("callback executor is gone, completion dropped");
        }
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use crate::status::DeferredStatus;
    use std::thread;

    /// Check that completions wait for the owner to turn the loop
    #[test]
    fn delivery_on_owner() {
        let executor = QueuedCallbackExecutor::new();
        let channel = executor.channel();
        let d = Deferred::<thread::ThreadId>::new();
        let target = d.clone();
        thread::spawn(move || {
            channel.notify(Box::new(move || {
                let _ = target.fire(thread::current().id());
            }));
        }).join().unwrap();

        // Nothing happened until the owner ran the queue
        assert_eq!(d.status(), DeferredStatus::Pending);
        assert_eq!(executor.pending(), 1);
        assert_eq!(executor.run_pending(), 1);
        assert_eq!(d.result().unwrap().unwrap(), thread::current().id());
    }

    /// Check that turning an idle loop times out
    #[test]
    fn idle_turn() {
        let executor = QueuedCallbackExecutor::new();
        assert_eq!(executor.turn(Duration::from_millis(10)), 0);
        assert!(!executor.run_until(|| false, Duration::from_millis(10)));
    }

    /// Check that run_until stops once its condition holds
    #[test]
    fn run_until_condition() {
        let executor = QueuedCallbackExecutor::new();
        let channel = executor.channel();
        let d = Deferred::<u32>::new();
        let target = d.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            channel.notify(Box::new(move || {
                let _ = target.fire(7);
            }));
        });
        let probe = d.clone();
        assert!(executor.run_until(move || probe.status().is_resolved(),
                                   Duration::from_secs(5)));
        assert_eq!(d.result().unwrap().unwrap(), 7);
        worker.join().unwrap();
    }

    /// Check that channels outliving their executor do not panic
    #[test]
    fn orphan_channel() {
        let channel = QueuedCallbackExecutor::new().channel();
        channel.notify(Box::new(|| panic!("must not run")));
    }
}
