//! Inline callback executor, implementing synchronous completion delivery
//!
//! This executor follows the traditional pattern of resolving Deferreds
//! directly on the worker thread. Callback chains then run on the worker, so
//! it is best suited to short handlers.

use crate::executor::{CallbackChannel, CallbackExecutor, Completion};


/// CallbackExecutor implementation suitable for inline completion delivery
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineCallbackExecutor {}
//
impl InlineCallbackExecutor {
    /// Create a new inline callback executor
    pub fn new() -> Self {
        InlineCallbackExecutor {}
    }
}
//
impl CallbackExecutor for InlineCallbackExecutor {
    type Channel = InlineCallbackChannel;

    fn channel(&self) -> Self::Channel {
        InlineCallbackChannel {}
    }
}


/// Callback channel which runs completions as soon as they are pushed into it
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineCallbackChannel {}
//
impl CallbackChannel for InlineCallbackChannel {
    fn notify(&self, completion: Completion) {
        completion();
    }
}
