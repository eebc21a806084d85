//! Task dispatch: submit work, await the result, release the slot.
//!
//! The orchestrator only talks to [`TaskRuntime`]; which runtime executes the
//! jobs (calling thread, local work-stealing pool, a remote cluster adapter)
//! is decided by whoever constructs the wrapper.
//!
//! Jobs must never block on other jobs. The orchestrator thread drives
//! sequential chains by waiting on one level before submitting the next.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{JoinHandle, Thread};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};

use crate::error::{WrapperError, WrapperResult};

/// Runtime able to execute independent jobs and hand back their results.
pub trait TaskRuntime: Send + Sync {
    /// Submit a job and get a placeholder for its result.
    fn submit<R, F>(&self, job: F) -> TaskFuture<R>
    where
        F: FnOnce() -> WrapperResult<R> + Send + 'static,
        R: Send + 'static;

    /// Short runtime name for logs.
    fn name(&self) -> &'static str;

    /// Submit every job, then wait for all of them in submission order.
    ///
    /// All futures are released before returning, including those left
    /// behind by an early error.
    fn run_all<R, F>(&self, jobs: Vec<F>) -> Vec<WrapperResult<R>>
    where
        F: FnOnce() -> WrapperResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let futures: Vec<TaskFuture<R>> = jobs.into_iter().map(|job| self.submit(job)).collect();
        futures.into_iter().map(TaskFuture::wait).collect()
    }
}

struct Slot<R> {
    value: Mutex<Option<WrapperResult<R>>>,
    ready: Condvar,
}

impl<R> Slot<R> {
    fn empty() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn fill(&self, result: WrapperResult<R>) {
        if let Ok(mut guard) = self.value.lock() {
            if guard.is_none() {
                *guard = Some(result);
            }
        }
        self.ready.notify_all();
    }
}

/// Placeholder for the result of a submitted job.
///
/// [`TaskFuture::wait`] consumes the future, so awaiting and releasing are a
/// single step. Dropping an unawaited future releases its slot as well.
pub struct TaskFuture<R> {
    slot: Arc<Slot<R>>,
}

impl<R> TaskFuture<R> {
    /// Future that is already resolved.
    #[must_use]
    pub fn ready(result: WrapperResult<R>) -> Self {
        let slot = Slot::empty();
        slot.fill(result);
        Self {
            slot: Arc::new(slot),
        }
    }

    fn pending() -> (Self, Promise<R>) {
        let slot = Arc::new(Slot::empty());
        (
            Self {
                slot: Arc::clone(&slot),
            },
            Promise {
                slot,
                fulfilled: false,
            },
        )
    }

    /// Whether the result is available without blocking.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.slot
            .value
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true)
    }

    /// Block until the job finishes and take its result.
    ///
    /// # Errors
    ///
    /// Returns the job's own error, or `TaskFailed` if the job panicked or
    /// was dropped before running.
    pub fn wait(self) -> WrapperResult<R> {
        let mut guard = self
            .slot
            .value
            .lock()
            .map_err(|_| WrapperError::task("result slot poisoned"))?;
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            guard = self
                .slot
                .ready
                .wait(guard)
                .map_err(|_| WrapperError::task("result slot poisoned"))?;
        }
    }
}

impl<R> std::fmt::Debug for TaskFuture<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Producer side of a [`TaskFuture`].
struct Promise<R> {
    slot: Arc<Slot<R>>,
    fulfilled: bool,
}

impl<R> Promise<R> {
    fn fulfil(mut self, result: WrapperResult<R>) {
        self.slot.fill(result);
        self.fulfilled = true;
    }
}

impl<R> Drop for Promise<R> {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.slot
                .fill(Err(WrapperError::task("job dropped before completion")));
        }
    }
}

fn run_guarded<R, F>(job: F) -> WrapperResult<R>
where
    F: FnOnce() -> WrapperResult<R>,
{
    catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Err(WrapperError::task(format!("job panicked: {reason}")))
    })
}

/// Runs every job immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineRuntime;

impl InlineRuntime {
    /// Create an inline runtime.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl TaskRuntime for InlineRuntime {
    fn submit<R, F>(&self, job: F) -> TaskFuture<R>
    where
        F: FnOnce() -> WrapperResult<R> + Send + 'static,
        R: Send + 'static,
    {
        TaskFuture::ready(run_guarded(job))
    }

    fn name(&self) -> &'static str {
        "inline"
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    shutdown: AtomicBool,
}

impl Shared {
    /// Local queue first, then the global queue, then round-robin theft.
    fn find_job(&self, worker_id: usize, local: &Worker<Job>) -> Option<Job> {
        local
            .pop()
            .or_else(|| loop {
                match self.injector.steal_batch_and_pop(local) {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => return None,
                    Steal::Retry => {}
                }
            })
            .or_else(|| {
                let n = self.stealers.len();
                (1..n).find_map(|offset| {
                    let stealer = &self.stealers[(worker_id + offset) % n];
                    loop {
                        match stealer.steal() {
                            Steal::Success(job) => return Some(job),
                            Steal::Empty => return None,
                            Steal::Retry => {}
                        }
                    }
                })
            })
    }
}

/// Persistent pool of worker threads with work stealing.
///
/// Jobs land in a global injector; idle workers pull batches into their
/// local FIFO deque and steal from their peers when both are empty. This
/// keeps fast contributions from waiting behind a slow remeshing step.
pub struct WorkStealingRuntime {
    shared: Arc<Shared>,
    threads: Vec<Thread>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkStealingRuntime {
    /// Idle workers re-check the queues at this interval.
    const IDLE_PARK: Duration = Duration::from_millis(2);

    /// Create a pool sized to the available parallelism.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a worker thread cannot be spawned.
    pub fn new() -> WrapperResult<Self> {
        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4);
        Self::with_workers(workers)
    }

    /// Create a pool with `num_workers` threads (at least one).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a worker thread cannot be spawned.
    pub fn with_workers(num_workers: usize) -> WrapperResult<Self> {
        let num_workers = num_workers.max(1);
        let locals: Vec<Worker<Job>> = (0..num_workers).map(|_| Worker::new_fifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(num_workers);
        for (worker_id, local) in locals.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("mlmc-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &local, &shared))?;
            handles.push(handle);
        }
        let threads = handles.iter().map(|h| h.thread().clone()).collect();

        tracing::debug!(workers = num_workers, "work-stealing runtime started");

        Ok(Self {
            shared,
            threads,
            handles,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }
}

fn worker_loop(worker_id: usize, local: &Worker<Job>, shared: &Shared) {
    loop {
        if let Some(job) = shared.find_job(worker_id, local) {
            job();
        } else if shared.shutdown.load(Ordering::Acquire) {
            break;
        } else {
            std::thread::park_timeout(WorkStealingRuntime::IDLE_PARK);
        }
    }
}

impl TaskRuntime for WorkStealingRuntime {
    fn submit<R, F>(&self, job: F) -> TaskFuture<R>
    where
        F: FnOnce() -> WrapperResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let (future, promise) = TaskFuture::pending();
        self.shared.injector.push(Box::new(move || {
            promise.fulfil(run_guarded(job));
        }));
        for thread in &self.threads {
            thread.unpark();
        }
        future
    }

    fn name(&self) -> &'static str {
        "work-stealing"
    }
}

impl Drop for WorkStealingRuntime {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for thread in &self.threads {
            thread.unpark();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("worker thread exited with a panic");
            }
        }
        tracing::debug!("work-stealing runtime stopped");
    }
}

impl std::fmt::Debug for WorkStealingRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingRuntime")
            .field("num_workers", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_inline_runs_immediately() {
        let runtime = InlineRuntime::new();
        let future = runtime.submit(|| Ok(21 * 2));
        assert!(future.is_ready());
        assert_eq!(future.wait().unwrap(), 42);
        assert_eq!(runtime.name(), "inline");
    }

    #[test]
    fn test_inline_propagates_job_error() {
        let runtime = InlineRuntime::new();
        let future = runtime.submit(|| -> WrapperResult<()> {
            Err(WrapperError::refinement(1, "remesh failed"))
        });
        let err = future.wait().expect_err("job error");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_inline_catches_panic() {
        let runtime = InlineRuntime::new();
        let future = runtime.submit(|| -> WrapperResult<u8> { panic!("boom") });
        let err = future.wait().expect_err("panic");
        assert!(matches!(err, WrapperError::TaskFailed(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_pool_results_in_submission_order() {
        let runtime = WorkStealingRuntime::with_workers(4).unwrap();
        assert_eq!(runtime.num_workers(), 4);

        let jobs: Vec<_> = (0..64u64)
            .map(|i| {
                move || {
                    if i % 7 == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(i * i)
                }
            })
            .collect();
        let results: Vec<u64> = runtime
            .run_all(jobs)
            .into_iter()
            .collect::<WrapperResult<_>>()
            .unwrap();

        let expected: Vec<u64> = (0..64).map(|i| i * i).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn test_pool_executes_every_job_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let runtime = WorkStealingRuntime::with_workers(3).unwrap();
            let futures: Vec<_> = (0..100)
                .map(|_| {
                    let counter = Arc::clone(&counter);
                    runtime.submit(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
                .collect();
            for f in futures {
                f.wait().unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_pool_survives_panicking_job() {
        let runtime = WorkStealingRuntime::with_workers(2).unwrap();
        let bad = runtime.submit(|| -> WrapperResult<u8> { panic!("bad level") });
        let good = runtime.submit(|| Ok(7u8));
        assert!(bad.wait().is_err());
        assert_eq!(good.wait().unwrap(), 7);
    }

    #[test]
    fn test_pool_drains_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let runtime = WorkStealingRuntime::with_workers(2).unwrap();
            for _ in 0..20 {
                let counter = Arc::clone(&counter);
                // Futures dropped immediately: the slot is released, the job still runs.
                drop(runtime.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_dropped_promise_reports_failure() {
        let (future, promise) = TaskFuture::<u8>::pending();
        drop(promise);
        let err = future.wait().expect_err("dropped");
        assert!(err.to_string().contains("dropped"));
    }

    #[test]
    fn test_future_debug() {
        let future = TaskFuture::ready(Ok(1));
        assert!(format!("{future:?}").contains("ready: true"));
    }
}
