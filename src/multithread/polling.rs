//! Polling-based monitoring of offloaded tasks
//!
//! This module provides a way to monitor a task running on a worker thread
//! through polling. It provides maximal performance in scenarios where a
//! client does not need to synchronize with the task, but only to check its
//! status from time to time, as is the case when refreshing a progress page.
//! Synchronization is the job of the Deferred which the task resolves.

use crate::status::{self, TaskStatus};
use triple_buffer::{Input, Output, TripleBuffer};


/// Status channel of an offloaded task
pub struct TaskOp {
    /// Worker interface used to submit status updates
    reporter: StatusReporter,

    /// Client interface used to monitor the task status
    monitor: TaskMonitor,
}
//
impl TaskOp {
    /// Create a status channel for a task which was not picked up yet
    pub fn new() -> Self {
        let initial_status = TaskStatus::Pending;

        // Setup triple buffer-based worker/client communication...
        let (buf_input, buf_output) = TripleBuffer::new(&initial_status).split();

        // ...then build the reporter and the monitor
        TaskOp {
            reporter: StatusReporter {
                buf_input,
                reached_final_status: status::is_final(&initial_status),
            },
            monitor: TaskMonitor { buf_output },
        }
    }

    /// Split the status channel into objects which can be respectively sent
    /// to the worker and the client
    pub fn split(self) -> (StatusReporter, TaskMonitor) {
        (self.reporter, self.monitor)
    }
}
//
impl Default for TaskOp {
    fn default() -> Self {
        Self::new()
    }
}


/// Worker interface, used to publish task status updates
pub struct StatusReporter {
    /// New task statuses will be sent through this triple buffer
    buf_input: Input<TaskStatus>,

    /// Flag indicating that the task status has reached a final state
    /// and should not change anymore
    reached_final_status: bool,
}
//
impl StatusReporter {
    /// Update the current status of the task
    pub fn update(&mut self, status: TaskStatus) {
        // This should only happen if we have not yet reached a final status
        debug_assert!(!self.reached_final_status);
        self.reached_final_status = status::is_final(&status);

        // Propagate the new task status
        self.buf_input.write(status);
    }
}
//
impl Drop for StatusReporter {
    /// If the worker lets go of the task before it reached a final status,
    /// tell the client in order to prevent it from waiting forever
    fn drop(&mut self) {
        if !self.reached_final_status {
            self.update(TaskStatus::Error("worker lost".to_owned()));
        }
    }
}


/// Client interface, used to check on the task status
pub struct TaskMonitor {
    /// Current task status will be read through this triple buffer
    buf_output: Output<TaskStatus>,
}
//
impl TaskMonitor {
    /// Access the latest task status
    pub fn status(&mut self) -> &TaskStatus {
        self.buf_output.read()
    }

    /// Check whether the task status won't change anymore
    pub fn is_final(&mut self) -> bool {
        status::is_final(self.status())
    }
}
