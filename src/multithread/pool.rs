//! Bounded worker pool for blocking work
//!
//! Blocking functions submitted to the pool run on one of a fixed number of
//! worker threads. Each submission immediately returns a pending Deferred,
//! which is resolved with the function's result once a worker is done with
//! it. Errors and panics are captured at the worker boundary and delivered
//! as ordinary failures, so a misbehaving task never takes its worker down.
//!
//! Results are handed back through a callback channel (see the `executor`
//! module), which decides on which thread the Deferred's chain will run.
//!
//! Cancelling the returned Deferred does not interrupt a running task. It
//! sets the task's CancelToken, which the task may check, and a task which
//! was not started yet is skipped altogether.

use crate::cancel::CancelToken;
use crate::deferred::Deferred;
use crate::error::ErrorValue;
use crate::executor::CallbackChannel;
use crate::executor::inline::InlineCallbackChannel;
use crate::multithread::polling::{StatusReporter, TaskMonitor, TaskOp};
use crate::status::TaskStatus;
use crossbeam_channel::{self as channel, Receiver, Sender};
use std::io;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};


/// Worker pool settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads
    pub workers: usize,

    /// Prefix of the worker thread names
    pub thread_name: String,
}
//
impl PoolConfig {
    /// Set the number of worker threads
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the prefix of the worker thread names
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}
//
impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            workers: thread::available_parallelism().map(NonZeroUsize::get)
                                                    .unwrap_or(4),
            thread_name: "deferred-worker".to_owned(),
        }
    }
}


/// Failure to set up a worker pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("a worker pool needs at least one worker thread")]
    NoWorkers,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}


type Job = Box<dyn FnOnce() + Send + 'static>;


/// Fixed-size pool of worker threads producing Deferreds
pub struct ThreadPool {
    /// Job queue, closed when the pool is dropped
    jobs: Option<Sender<Job>>,

    /// Worker threads, joined when the pool is dropped
    workers: Vec<JoinHandle<()>>,
}
//
impl ThreadPool {
    /// Start the worker threads
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }
        tracing::debug!(workers = config.workers,
                        name = %config.thread_name,
                        "worker pool started");

        Ok(ThreadPool { jobs: Some(sender), workers })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run `f` on a worker and resolve the returned Deferred from there
    pub fn offload<T, X, F>(&self, f: F) -> Deferred<T>
        where T: Send + 'static,
              X: Into<ErrorValue>,
              F: FnOnce() -> Result<T, X> + Send + 'static
    {
        self.submit(InlineCallbackChannel::default(), move |_| f(), None)
    }

    /// Run `f` on a worker and deliver its result through `channel`
    ///
    /// The task receives a CancelToken which is set if the returned Deferred
    /// gets cancelled.
    ///
    pub fn offload_to<T, X, F, C>(&self, channel: C, f: F) -> Deferred<T>
        where T: Send + 'static,
              X: Into<ErrorValue>,
              F: FnOnce(&CancelToken) -> Result<T, X> + Send + 'static,
              C: CallbackChannel
    {
        self.submit(channel, f, None)
    }

    /// Same as offload_to(), also returning a monitor of the task's progress
    pub fn offload_monitored<T, X, F, C>(&self, channel: C, f: F)
        -> (Deferred<T>, TaskMonitor)
        where T: Send + 'static,
              X: Into<ErrorValue>,
              F: FnOnce(&CancelToken) -> Result<T, X> + Send + 'static,
              C: CallbackChannel
    {
        let (reporter, monitor) = TaskOp::new().split();
        (self.submit(channel, f, Some(reporter)), monitor)
    }

    fn submit<T, X, F, C>(&self,
                          channel: C,
                          f: F,
                          reporter: Option<StatusReporter>) -> Deferred<T>
        where T: Send + 'static,
              X: Into<ErrorValue>,
              F: FnOnce(&CancelToken) -> Result<T, X> + Send + 'static,
              C: CallbackChannel
    {
        // The canceller flags the task, the worker does the rest
        let token = CancelToken::new();
        let canceller_token = token.clone();
        let deferred = Deferred::with_canceller(move || canceller_token.cancel());

        let target = deferred.clone();
        let job: Job = Box::new(move || {
            run_task(f, token, channel, target, reporter)
        });
        let queued = match self.jobs {
            Some(ref jobs) => jobs.send(job).is_ok(),
            None => false,
        };
        if !queued {
            let _ = deferred.fail(ErrorValue::msg("worker pool has shut down"));
        }
        deferred
    }
}
//
impl Drop for ThreadPool {
    /// Let the workers drain the queue, then wait for them
    fn drop(&mut self) {
        drop(self.jobs.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
        tracing::debug!("worker pool stopped");
    }
}


/// Worker thread main loop
fn worker_loop(jobs: Receiver<Job>) {
    for job in jobs.iter() {
        job();
    }
    tracing::trace!("job queue closed, worker exiting");
}


/// Run one task on the current worker and send its result back
fn run_task<T, X, F, C>(f: F,
                        token: CancelToken,
                        channel: C,
                        deferred: Deferred<T>,
                        mut reporter: Option<StatusReporter>)
    where T: Send + 'static,
          X: Into<ErrorValue>,
          F: FnOnce(&CancelToken) -> Result<T, X>,
          C: CallbackChannel
{
    let mut report = |status: TaskStatus| {
        if let Some(ref mut reporter) = reporter {
            reporter.update(status);
        }
    };

    // Tasks cancelled while queued are not even started
    if token.is_cancelled() {
        tracing::trace!("skipping cancelled task");
        report(TaskStatus::Cancelled);
        return;
    }
    report(TaskStatus::Running);

    let result = match panic::catch_unwind(AssertUnwindSafe(|| f(&token))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(error.into()),
        Err(payload) => Err(ErrorValue::from_panic(payload)),
    };
    report(match result {
        _ if token.is_cancelled() => TaskStatus::Cancelled,
        Ok(_) => TaskStatus::Done,
        Err(ref error) => TaskStatus::Error(error.to_string()),
    });

    channel.notify(Box::new(move || {
        let delivered = match result {
            Ok(value) => deferred.fire(value),
            Err(error) => deferred.fail(error),
        };
        if let Err(e) = delivered {
            tracing::debug!(error = %e, "offloaded result discarded");
        }
    }));
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CallbackExecutor;
    use crate::executor::queued::QueuedCallbackExecutor;
    use crate::multithread::blocking;
    use crate::status::DeferredStatus;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn pool(workers: usize) -> ThreadPool {
        ThreadPool::new(PoolConfig::default().workers(workers)).unwrap()
    }

    /// Check pool configuration handling
    #[test]
    fn configuration() {
        assert!(matches!(ThreadPool::new(PoolConfig::default().workers(0)),
                         Err(PoolError::NoWorkers)));
        let config = PoolConfig::default().workers(3).thread_name("io");
        assert_eq!(config.thread_name, "io");
        assert_eq!(ThreadPool::new(config).unwrap().size(), 3);
        assert!(PoolConfig::default().workers >= 1);
    }

    /// Check that offloading returns at once and delivers the result later,
    /// running callbacks registered in the meantime in order
    #[test]
    fn sleep_and_return() {
        let pool = pool(2);
        let executor = QueuedCallbackExecutor::new();
        let n = 2u64;
        let d = pool.offload_to(executor.channel(), move |_| {
            thread::sleep(Duration::from_millis(n * 10));
            Ok::<_, ErrorValue>(format!("Slept for {} seconds", n))
        });
        assert_eq!(d.status(), DeferredStatus::Pending);

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        d.add_callback(move |s| {
             o1.lock().push(1);
             Ok(format!("<h1>{}</h1>", s))
         })
         .add_callback(move |s| {
             o2.lock().push(2);
             Ok(s)
         });

        let probe = d.clone();
        assert!(executor.run_until(move || probe.status().is_resolved(),
                                   Duration::from_secs(5)));
        assert_eq!(*order.lock(), vec![1, 2]);
        assert_eq!(d.result().unwrap().unwrap(),
                   "<h1>Slept for 2 seconds</h1>");
    }

    /// Check that task errors and panics become failures
    #[test]
    fn failures() {
        let pool = pool(1);
        let d = pool.offload(|| "hello".parse::<i32>());
        let err = blocking::block_on(&d).unwrap().unwrap_err();
        assert!(err.is::<std::num::ParseIntError>());

        let d = pool.offload(|| -> Result<i32, ErrorValue> {
            panic!("worker exploded")
        });
        let err = blocking::block_on(&d).unwrap().unwrap_err();
        assert_eq!(err.to_string(), "task panicked: worker exploded");

        // The worker survived
        let d = pool.offload(|| Ok::<_, ErrorValue>(5));
        assert_eq!(blocking::block_on(&d).unwrap().unwrap(), 5);
    }

    /// Check that cancelling a running task sets its token and drops the
    /// eventual result
    #[test]
    fn cancel_running_task() {
        let pool = pool(1);
        let executor = QueuedCallbackExecutor::new();
        let started = Arc::new(AtomicBool::new(false));
        let s = started.clone();
        let (d, mut monitor) = pool.offload_monitored(
            executor.channel(),
            move |token: &CancelToken| {
                s.store(true, Ordering::SeqCst);
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok::<_, ErrorValue>("finished anyway")
            }
        );
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        d.add_callback(move |v| {
            r.store(true, Ordering::SeqCst);
            Ok(v)
        });

        while !started.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*monitor.status(), TaskStatus::Running);
        d.cancel().unwrap();

        assert!(executor.run_until(|| monitor.is_final(),
                                   Duration::from_secs(5)));
        executor.run_pending();
        assert_eq!(*monitor.status(), TaskStatus::Cancelled);
        assert_eq!(d.status(), DeferredStatus::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
    }

    /// Check that tasks cancelled while queued never start
    #[test]
    fn cancel_queued_task() {
        let pool = pool(1);
        let gate = Arc::new(AtomicBool::new(false));
        let g = gate.clone();
        let blocker = pool.offload(move || {
            while !g.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok::<_, ErrorValue>(())
        });

        let executed = Arc::new(AtomicBool::new(false));
        let e = executed.clone();
        let (queued, mut monitor) = pool.offload_monitored(
            InlineCallbackChannel::default(),
            move |_: &CancelToken| {
                e.store(true, Ordering::SeqCst);
                Ok::<_, ErrorValue>(())
            }
        );
        queued.cancel().unwrap();
        gate.store(true, Ordering::SeqCst);
        blocking::block_on(&blocker).unwrap().unwrap();

        // The single worker handles jobs in order, so the queued task was
        // skipped by the time the pool is dropped
        drop(pool);
        assert!(!executed.load(Ordering::SeqCst));
        assert_eq!(*monitor.status(), TaskStatus::Cancelled);
    }

    /// Check that every queued task still runs when the pool is dropped
    #[test]
    fn drop_drains_queue() {
        let pool = pool(2);
        let deferreds: Vec<_> = (0..8u32)
            .map(|i| pool.offload(move || Ok::<_, ErrorValue>(i * i)))
            .collect();
        drop(pool);
        for (i, d) in deferreds.iter().enumerate() {
            assert_eq!(d.result().unwrap().unwrap(), (i * i) as u32);
        }
    }
}
