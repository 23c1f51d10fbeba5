//! # Bounded-concurrency dispatcher.
//!
//! [`BoundedDispatcher`] runs posted callbacks on exactly `N` dedicated worker
//! threads, so test concurrency is an explicit resource independent of any
//! other thread pool in the process.
//!
//! ## Architecture
//! ```text
//! post(cb) ──► capture ExecutionContext ──► [work queue] ──► notify_one
//!                                               │
//!                     ┌─────────────┬───────────┴───────────┐
//!                     ▼             ▼                       ▼
//!                 worker 1      worker 2      ...       worker N
//!                     │  pop item; re-notify if more remain
//!                     │  install self as current dispatcher
//!                     └─ ctx.run(cb); restore previous dispatcher
//! ```
//!
//! ## Rules
//! - At most `N` callbacks run at any instant.
//! - `post` never blocks; after shutdown began it runs the callback inline
//!   instead of dropping it.
//! - Workers drain the queue before honoring terminate.
//! - Panics inside callbacks are not caught: the worker thread dies and the
//!   panic surfaces through the process panic hook. Callers catch inside.
//! - `dispose` joins every worker; a second `dispose` is an error.
//! - `dispose` must not be called from one of the dispatcher's own workers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use super::context::ExecutionContext;
use crate::error::RunnerError;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// One posted unit of work. Consumed exactly once.
struct WorkItem {
    callback: Callback,
    context: ExecutionContext,
}

struct Shared {
    queue: Mutex<VecDeque<WorkItem>>,
    work_ready: Condvar,
    terminate: AtomicBool,
    max_concurrency: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }
}

thread_local! {
    static CURRENT_DISPATCHER: RefCell<Option<DispatcherHandle>> = const { RefCell::new(None) };
}

/// Cloneable handle used to post work to a [`BoundedDispatcher`].
///
/// Pass it explicitly to whatever needs to schedule work, or obtain the one
/// installed on a worker thread with [`DispatcherHandle::current`].
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("max_concurrency", &self.shared.max_concurrency)
            .finish()
    }
}

impl DispatcherHandle {
    /// The dispatcher whose worker is running the current callback, if any.
    pub fn current() -> Option<DispatcherHandle> {
        CURRENT_DISPATCHER.with(|c| c.borrow().clone())
    }

    /// Queues `callback` with the caller's [`ExecutionContext`].
    ///
    /// Runs the callback inline if the dispatcher is shutting down.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        let item = WorkItem {
            callback: Box::new(callback),
            context: ExecutionContext::capture(),
        };
        {
            let mut queue = self.shared.lock();
            if !self.shared.terminate.load(Ordering::Acquire) {
                queue.push_back(item);
                drop(queue);
                self.shared.work_ready.notify_one();
                return;
            }
        }
        tracing::debug!(target: "testvisor::dispatch", "dispatcher shutting down; running posted work inline");
        (item.callback)();
    }

    /// Runs `callback` inline on the caller's thread.
    pub fn send<R>(&self, callback: impl FnOnce() -> R) -> R {
        callback()
    }

    /// Number of worker threads.
    pub fn max_concurrency(&self) -> usize {
        self.shared.max_concurrency
    }

    /// Whether both handles refer to the same dispatcher.
    pub fn same_as(&self, other: &DispatcherHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Fixed pool of dedicated worker threads.
pub struct BoundedDispatcher {
    handle: DispatcherHandle,
    workers: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl BoundedDispatcher {
    /// Spawns exactly `max_concurrency` workers (`0` is treated as `1`).
    pub fn new(max_concurrency: usize) -> Result<Self, RunnerError> {
        let max_concurrency = max_concurrency.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            terminate: AtomicBool::new(false),
            max_concurrency,
        });
        let handle = DispatcherHandle { shared };

        let mut workers = Vec::with_capacity(max_concurrency);
        for idx in 0..max_concurrency {
            let h = handle.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("testvisor-worker-{idx}"))
                .spawn(move || worker_loop(h));
            match spawned {
                Ok(join) => workers.push(join),
                Err(e) => {
                    stop_workers(&handle.shared, workers);
                    return Err(e.into());
                }
            }
        }

        Ok(Self {
            handle,
            workers: Mutex::new(workers),
            disposed: AtomicBool::new(false),
        })
    }

    /// Handle for posting work.
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Shorthand for `self.handle().post(callback)`.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        self.handle.post(callback);
    }

    /// Runs `callback` inline on the caller's thread.
    pub fn send<R>(&self, callback: impl FnOnce() -> R) -> R {
        self.handle.send(callback)
    }

    /// Number of worker threads.
    pub fn max_concurrency(&self) -> usize {
        self.handle.max_concurrency()
    }

    /// Signals terminate and joins every worker.
    ///
    /// Queued work is drained first. Calling it twice is an error.
    pub fn dispose(&self) -> Result<(), RunnerError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(RunnerError::AlreadyDisposed {
                resource: "BoundedDispatcher",
            });
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        stop_workers(&self.handle.shared, workers);
        Ok(())
    }
}

impl Drop for BoundedDispatcher {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            let _ = self.dispose();
        }
    }
}

fn stop_workers(shared: &Shared, workers: Vec<JoinHandle<()>>) {
    {
        let _queue = shared.lock();
        shared.terminate.store(true, Ordering::Release);
    }
    shared.work_ready.notify_all();

    for join in workers {
        if join.join().is_err() {
            tracing::error!(target: "testvisor::dispatch", "worker thread terminated by a panic");
        }
    }
}

fn worker_loop(handle: DispatcherHandle) {
    loop {
        let item = {
            let mut queue = handle.shared.lock();
            loop {
                if let Some(item) = queue.pop_front() {
                    if !queue.is_empty() {
                        handle.shared.work_ready.notify_one();
                    }
                    break item;
                }
                if handle.shared.terminate.load(Ordering::Acquire) {
                    return;
                }
                queue = handle
                    .shared
                    .work_ready
                    .wait(queue)
                    .unwrap_or_else(|p| p.into_inner());
            }
        };

        let _current = InstallDispatcher::new(handle.clone());
        let WorkItem { callback, context } = item;
        context.run(callback);
    }
}

/// Installs a dispatcher as current for the lifetime of the guard.
struct InstallDispatcher(Option<DispatcherHandle>);

impl InstallDispatcher {
    fn new(handle: DispatcherHandle) -> Self {
        Self(CURRENT_DISPATCHER.with(|c| c.replace(Some(handle))))
    }
}

impl Drop for InstallDispatcher {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT_DISPATCHER.with(|c| *c.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn never_exceeds_max_concurrency_and_completes_all() {
        const N: usize = 3;
        const K: usize = 12;
        let dispatcher = BoundedDispatcher::new(N).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..K {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            dispatcher.post(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher.dispose().unwrap();

        assert_eq!(done.load(Ordering::SeqCst), K);
        assert!(peak.load(Ordering::SeqCst) <= N);
        assert!(peak.load(Ordering::SeqCst) >= 2, "workers never overlapped");
    }

    #[test]
    fn context_flows_from_poster_to_worker() {
        let dispatcher = BoundedDispatcher::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        ExecutionContext::default()
            .with_culture("pt-BR")
            .with_value("trace", "abc")
            .run(|| {
                dispatcher.post(move || {
                    let ctx = ExecutionContext::capture();
                    tx.send((ctx.culture().map(str::to_owned), ctx.get("trace").map(str::to_owned)))
                        .unwrap();
                });
            });
        let (culture, trace) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(culture.as_deref(), Some("pt-BR"));
        assert_eq!(trace.as_deref(), Some("abc"));
        dispatcher.dispose().unwrap();
    }

    #[test]
    fn worker_sees_itself_as_current_dispatcher() {
        let dispatcher = BoundedDispatcher::new(2).unwrap();
        let expected = dispatcher.handle();
        let (tx, rx) = mpsc::channel();
        dispatcher.post(move || {
            let current = DispatcherHandle::current();
            tx.send(current.map(|c| c.same_as(&expected)).unwrap_or(false)).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(DispatcherHandle::current().is_none());
        dispatcher.dispose().unwrap();
    }

    #[test]
    fn post_after_dispose_runs_inline() {
        let dispatcher = BoundedDispatcher::new(2).unwrap();
        let handle = dispatcher.handle();
        dispatcher.dispose().unwrap();

        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        handle.post(move || tx.send(std::thread::current().id()).unwrap());
        assert_eq!(rx.try_recv().unwrap(), caller);
    }

    #[test]
    fn send_is_inline() {
        let dispatcher = BoundedDispatcher::new(1).unwrap();
        let caller = std::thread::current().id();
        assert_eq!(dispatcher.send(|| std::thread::current().id()), caller);
        dispatcher.dispose().unwrap();
    }

    #[test]
    fn double_dispose_fails_loudly() {
        let dispatcher = BoundedDispatcher::new(1).unwrap();
        dispatcher.dispose().unwrap();
        let err = dispatcher.dispose().unwrap_err();
        assert_eq!(err.as_label(), "runner_already_disposed");
    }

    #[test]
    fn zero_is_clamped_to_one_worker() {
        let dispatcher = BoundedDispatcher::new(0).unwrap();
        assert_eq!(dispatcher.max_concurrency(), 1);
    }
}
