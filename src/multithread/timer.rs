//! Delayed calls
//!
//! Deferreds have no notion of time. Timeouts and delayed resolution are
//! composed on top of them by scheduling a call which fires, fails or cancels
//! a Deferred later on, and by cancelling that call from the Deferred's
//! canceller when it is not needed anymore.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};


#[derive(Default)]
struct TimerState {
    cancelled: bool,
    fired: bool,
}


/// Handle to a call scheduled with call_later()
#[derive(Clone)]
pub struct DelayedCall {
    shared: Arc<(Mutex<TimerState>, Condvar)>,
}
//
impl DelayedCall {
    /// Prevent the call from happening. Returns false if it is too late.
    pub fn cancel(&self) -> bool {
        let (ref lock, ref cv) = *self.shared;
        let mut state = lock.lock();
        if state.fired || state.cancelled {
            return false;
        }
        state.cancelled = true;
        cv.notify_all();
        true
    }

    /// Truth that the call neither happened nor was cancelled yet
    pub fn is_active(&self) -> bool {
        let state = self.shared.0.lock();
        !state.fired && !state.cancelled
    }
}


/// Call `f` on a timer thread once `delay` has elapsed
pub fn call_later<F>(delay: Duration, f: F) -> io::Result<DelayedCall>
    where F: FnOnce() + Send + 'static
{
    let shared = Arc::new((Mutex::new(TimerState::default()), Condvar::new()));
    let timer_shared = shared.clone();
    let deadline = Instant::now() + delay;
    thread::Builder::new()
        .name("deferred-timer".to_owned())
        .spawn(move || {
            let (ref lock, ref cv) = *timer_shared;
            let mut state = lock.lock();
            while !state.cancelled && Instant::now() < deadline {
                cv.wait_until(&mut state, deadline);
            }
            if state.cancelled {
                tracing::trace!("delayed call cancelled");
                return;
            }
            state.fired = true;
            drop(state);
            f();
        })?;
    Ok(DelayedCall { shared })
}
