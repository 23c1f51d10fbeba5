//! # Tracking detached asynchronous work started by a test body.
//!
//! [`AsyncOperationTracker`] counts outstanding fire-and-forget operations and
//! exposes one awaitable, [`wait_for_completion`](AsyncOperationTracker::wait_for_completion),
//! that resolves when the count returns to zero. The first failure recorded by
//! any tracked operation is returned from that wait.
//!
//! ```text
//! operation_started()   count 0→1   gate: closed
//! operation_started()   count 1→2
//! operation_completed() count 2→1
//! operation_completed() count 1→0   gate: open ──► wait_for_completion() resolves
//! ```
//!
//! A leaked operation (started, never completed) keeps the gate closed forever.
//! There is no internal timeout; callers apply one if they want it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::watch;

use super::dispatcher::DispatcherHandle;
use crate::error::TestError;

struct Inner {
    outstanding: Mutex<usize>,
    ready: watch::Sender<bool>,
    first_error: Mutex<Option<TestError>>,
    dispatcher: Option<DispatcherHandle>,
}

/// Counts outstanding detached operations; cheap to clone.
#[derive(Clone)]
pub struct AsyncOperationTracker {
    inner: Arc<Inner>,
}

impl Default for AsyncOperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncOperationTracker {
    /// Tracker that runs posted callbacks on dedicated threads.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Tracker that runs posted callbacks on `dispatcher`.
    pub fn with_dispatcher(dispatcher: DispatcherHandle) -> Self {
        Self::build(Some(dispatcher))
    }

    fn build(dispatcher: Option<DispatcherHandle>) -> Self {
        let (ready, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                outstanding: Mutex::new(0),
                ready,
                first_error: Mutex::new(None),
                dispatcher,
            }),
        }
    }

    /// Increments the outstanding count and closes the gate.
    pub fn operation_started(&self) {
        let mut count = self.lock_count();
        *count += 1;
        self.inner.ready.send_replace(false);
    }

    /// Decrements the outstanding count, opening the gate at zero.
    pub fn operation_completed(&self) {
        let mut count = self.lock_count();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.ready.send_replace(true);
        }
    }

    /// Number of operations currently outstanding.
    pub fn outstanding(&self) -> usize {
        *self.lock_count()
    }

    /// Runs `callback` as a tracked operation.
    ///
    /// Failures and panics from the callback are recorded. A failure to hand
    /// the callback off is logged and the operation is counted as completed.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<(), TestError> + Send + 'static,
    {
        self.operation_started();
        let tracker = self.clone();
        let wrapped = move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(callback));
            tracker.record(outcome.unwrap_or_else(|p| Err(TestError::from_panic(&*p))));
            tracker.operation_completed();
        };

        match &self.inner.dispatcher {
            Some(dispatcher) => dispatcher.post(wrapped),
            None => {
                let spawned = std::thread::Builder::new()
                    .name("testvisor-async-op".into())
                    .spawn(wrapped);
                if let Err(e) = spawned {
                    tracing::warn!(target: "testvisor::dispatch", error = %e, "failed to dispatch tracked operation");
                    self.operation_completed();
                }
            }
        }
    }

    /// Spawns `fut` on `runtime` as a tracked operation.
    pub fn spawn<F>(&self, runtime: &tokio::runtime::Handle, fut: F)
    where
        F: Future<Output = Result<(), TestError>> + Send + 'static,
    {
        self.operation_started();
        let tracker = self.clone();
        runtime.spawn(async move {
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            tracker.record(outcome.unwrap_or_else(|p| Err(TestError::from_panic(&*p))));
            tracker.operation_completed();
        });
    }

    /// Suspends until no operation is outstanding; returns the first failure.
    pub async fn wait_for_completion(&self) -> Option<TestError> {
        let mut rx = self.inner.ready.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|ready| *ready).await;
        self.first_error()
    }

    /// First failure recorded so far, if any.
    pub fn first_error(&self) -> Option<TestError> {
        self.inner
            .first_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn record(&self, outcome: Result<(), TestError>) {
        if let Err(err) = outcome {
            let mut slot = self.inner.first_error.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }

    fn lock_count(&self) -> std::sync::MutexGuard<'_, usize> {
        self.inner.outstanding.lock().unwrap_or_else(|p| p.into_inner())
    }
}
