//! # LIFO cleanup of heterogeneous resources.
//!
//! [`DisposalTracker`] collects resources (and plain cleanup closures) while a
//! pipeline is being set up, then tears them down in reverse registration
//! order: asynchronous cleanups first, synchronous ones second.
//!
//! ```text
//! add(A) ── add_async(B) ── add(C) ── add_async_action(D) ──► dispose().await
//!                                                             D ─► B ─► C ─► A
//!                                                             (async)   (sync)
//! ```
//!
//! ## Rules
//! - Within each kind, newest first.
//! - Async cleanups are awaited one at a time, never concurrently.
//! - A resource that can clean up both ways is registered with [`DisposalTracker::add_async`].
//! - A failing cleanup does not stop the rest; failures are aggregated.
//! - After `dispose` starts, `add*` and a second `dispose` fail with
//!   [`RunnerError::AlreadyDisposed`].

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::RunnerError;

/// Synchronous cleanup capability.
pub trait Dispose: Send + Sync {
    /// Releases the resource.
    fn dispose(&self) -> Result<(), RunnerError>;
}

/// Asynchronous cleanup capability.
#[async_trait]
pub trait AsyncDispose: Send + Sync {
    /// Releases the resource.
    async fn dispose_async(&self) -> Result<(), RunnerError>;
}

type SyncCleanup = Box<dyn FnOnce() -> Result<(), RunnerError> + Send>;
type AsyncCleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), RunnerError>> + Send>;

enum Registration {
    Sync(SyncCleanup),
    Async(AsyncCleanup),
}

#[derive(Default)]
struct TrackerState {
    disposed: bool,
    registrations: Vec<Registration>,
}

/// Reverse-order cleanup for everything registered with it.
#[derive(Default)]
pub struct DisposalTracker {
    state: Mutex<TrackerState>,
}

impl DisposalTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronously disposable resource.
    pub fn add<D: Dispose + 'static>(&self, resource: Arc<D>) -> Result<(), RunnerError> {
        self.register(Registration::Sync(Box::new(move || resource.dispose())))
    }

    /// Registers an asynchronously disposable resource.
    pub fn add_async<D: AsyncDispose + 'static>(&self, resource: Arc<D>) -> Result<(), RunnerError> {
        self.register(Registration::Async(Box::new(move || {
            Box::pin(async move { resource.dispose_async().await })
        })))
    }

    /// Registers a cleanup closure.
    pub fn add_action<F>(&self, cleanup: F) -> Result<(), RunnerError>
    where
        F: FnOnce() -> Result<(), RunnerError> + Send + 'static,
    {
        self.register(Registration::Sync(Box::new(cleanup)))
    }

    /// Registers an asynchronous cleanup closure.
    pub fn add_async_action<F, Fut>(&self, cleanup: F) -> Result<(), RunnerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RunnerError>> + Send + 'static,
    {
        self.register(Registration::Async(Box::new(move || Box::pin(cleanup()))))
    }

    /// Number of pending registrations.
    pub fn len(&self) -> usize {
        self.lock().registrations.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every registration without running it.
    pub fn clear(&self) -> Result<(), RunnerError> {
        let mut state = self.lock();
        if state.disposed {
            return Err(already_disposed());
        }
        state.registrations.clear();
        Ok(())
    }

    /// Runs async cleanups newest first, then sync cleanups newest first.
    pub async fn dispose(&self) -> Result<(), RunnerError> {
        let registrations = {
            let mut state = self.lock();
            if state.disposed {
                return Err(already_disposed());
            }
            state.disposed = true;
            std::mem::take(&mut state.registrations)
        };

        let (mut asynchronous, mut synchronous) = (Vec::new(), Vec::new());
        for registration in registrations.into_iter().rev() {
            match registration {
                Registration::Async(cleanup) => asynchronous.push(cleanup),
                Registration::Sync(cleanup) => synchronous.push(cleanup),
            }
        }

        let mut errors = Vec::new();
        for cleanup in asynchronous {
            record(cleanup().await, &mut errors);
        }
        for cleanup in synchronous {
            record(cleanup(), &mut errors);
        }
        RunnerError::from_cleanup(errors)
    }

    fn register(&self, registration: Registration) -> Result<(), RunnerError> {
        let mut state = self.lock();
        if state.disposed {
            return Err(already_disposed());
        }
        state.registrations.push(registration);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn record(outcome: Result<(), RunnerError>, errors: &mut Vec<RunnerError>) {
    if let Err(e) = outcome {
        tracing::warn!(error = %e, "cleanup failed");
        errors.push(e);
    }
}

fn already_disposed() -> RunnerError {
    RunnerError::AlreadyDisposed {
        resource: "DisposalTracker",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    struct SyncRes(&'static str, Log);

    impl Dispose for SyncRes {
        fn dispose(&self) -> Result<(), RunnerError> {
            self.1.lock().unwrap().push(format!("sync:{}", self.0));
            Ok(())
        }
    }

    struct AsyncRes(&'static str, Log);

    #[async_trait]
    impl AsyncDispose for AsyncRes {
        async fn dispose_async(&self) -> Result<(), RunnerError> {
            tokio::task::yield_now().await;
            self.1.lock().unwrap().push(format!("async:{}", self.0));
            Ok(())
        }
    }

    #[tokio::test]
    async fn disposes_async_then_sync_each_in_reverse() {
        let log: Log = Arc::default();
        let tracker = DisposalTracker::new();
        tracker.add(Arc::new(SyncRes("A", log.clone()))).unwrap();
        tracker.add_async(Arc::new(AsyncRes("B", log.clone()))).unwrap();
        tracker.add(Arc::new(SyncRes("C", log.clone()))).unwrap();
        let l = log.clone();
        tracker
            .add_async_action(move || async move {
                l.lock().unwrap().push("action:D".into());
                Ok(())
            })
            .unwrap();
        assert_eq!(tracker.len(), 4);

        tracker.dispose().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["action:D", "async:B", "sync:C", "sync:A"]
        );
    }

    #[tokio::test]
    async fn second_dispose_and_late_add_fail() {
        let tracker = DisposalTracker::new();
        tracker.dispose().await.unwrap();

        assert_eq!(tracker.dispose().await.unwrap_err().as_label(), "runner_already_disposed");
        assert!(tracker.add_action(|| Ok(())).is_err());
        assert!(tracker.clear().is_err());
    }

    #[tokio::test]
    async fn failures_are_aggregated_and_do_not_stop_cleanup() {
        let log: Log = Arc::default();
        let tracker = DisposalTracker::new();
        tracker.add(Arc::new(SyncRes("A", log.clone()))).unwrap();
        tracker
            .add_action(|| Err(RunnerError::InvalidConfig { reason: "one".into() }))
            .unwrap();
        tracker
            .add_async_action(|| async { Err(RunnerError::InvalidConfig { reason: "two".into() }) })
            .unwrap();

        let err = tracker.dispose().await.unwrap_err();
        match err {
            RunnerError::Disposal { errors } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["sync:A"]);
    }

    #[tokio::test]
    async fn single_failure_is_returned_as_is() {
        let tracker = DisposalTracker::new();
        tracker
            .add_action(|| Err(RunnerError::InvalidConfig { reason: "only".into() }))
            .unwrap();
        let err = tracker.dispose().await.unwrap_err();
        assert_eq!(err.as_label(), "runner_invalid_config");
    }

    #[tokio::test]
    async fn clear_forgets_registrations() {
        let log: Log = Arc::default();
        let tracker = DisposalTracker::new();
        tracker.add(Arc::new(SyncRes("A", log.clone()))).unwrap();
        tracker.clear().unwrap();
        assert!(tracker.is_empty());
        tracker.dispose().await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }
}
