//! # Test cases and the context a test body runs with.
//!
//! A [`TestCase`] pairs a [`TestCaseDescriptor`] with a synchronous body. The
//! body runs on a dispatcher worker thread and receives a [`TestContext`],
//! through which it may start detached work that the runner will wait for.
//!
//! ## Example
//! ```rust
//! use testvisor::{TestCaseDescriptor, TestCaseFn, TestCaseRef, TestContext, TestError};
//!
//! let case: TestCaseRef = TestCaseFn::arc(
//!     TestCaseDescriptor::new("math.adds", "adds"),
//!     |_ctx: &TestContext| {
//!         if 1 + 1 != 2 {
//!             return Err(TestError::failed("arithmetic is broken"));
//!         }
//!         Ok(())
//!     },
//! );
//! assert_eq!(case.descriptor().unique_id, "math.adds");
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::cases::TestCaseDescriptor;
use crate::dispatch::AsyncOperationTracker;
use crate::error::TestError;
use crate::messages::{Bus, Message, MessageKind};

/// # A runnable test case.
///
/// `run` executes on a dedicated worker thread; blocking is fine. Detached
/// async work must be started through the [`TestContext`] so the runner can
/// wait for it and surface its failures.
pub trait TestCase: Send + Sync + 'static {
    /// Identity and metadata of the case.
    fn descriptor(&self) -> &TestCaseDescriptor;

    /// Runs the test body.
    fn run(&self, ctx: &TestContext) -> Result<(), TestError>;
}

/// Shared handle to a test case.
pub type TestCaseRef = Arc<dyn TestCase>;

/// Ambient services for one running test.
pub struct TestContext {
    pub(crate) descriptor: TestCaseDescriptor,
    pub(crate) assembly_id: Arc<str>,
    pub(crate) test_id: Arc<str>,
    pub(crate) tracker: AsyncOperationTracker,
    pub(crate) runtime: tokio::runtime::Handle,
    pub(crate) cancel: CancellationToken,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) continue_running: Arc<AtomicBool>,
}

impl TestContext {
    /// Descriptor of the running case.
    pub fn descriptor(&self) -> &TestCaseDescriptor {
        &self.descriptor
    }

    /// Whether the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run-wide cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Tracker of detached operations started by this test.
    pub fn tracker(&self) -> &AsyncOperationTracker {
        &self.tracker
    }

    /// Starts a detached future; the test completes only after it does.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = Result<(), TestError>> + Send + 'static,
    {
        self.tracker.spawn(&self.runtime, fut);
    }

    /// Starts a detached blocking callback on the run's dispatcher.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<(), TestError> + Send + 'static,
    {
        self.tracker.post(callback);
    }

    /// Reports a line of test output.
    ///
    /// A sink answering `false` stops scheduling of further cases.
    pub fn output(&self, text: impl Into<Arc<str>>) {
        let message = Message::new(MessageKind::TestOutput)
            .with_assembly(Arc::clone(&self.assembly_id))
            .with_test_case(self.descriptor.unique_id.as_str())
            .with_test(Arc::clone(&self.test_id))
            .with_text(text);
        match self.bus.queue_message(message) {
            Ok(true) => {}
            Ok(false) => self.continue_running.store(false, Ordering::Release),
            Err(e) => {
                tracing::warn!(target: "testvisor::runner", error = %e, "test output dropped");
                self.continue_running.store(false, Ordering::Release);
            }
        }
    }
}

/// Function-backed test case.
///
/// Wraps a closure `F: Fn(&TestContext) -> Result<(), TestError>`; every run
/// calls it afresh.
pub struct TestCaseFn<F> {
    descriptor: TestCaseDescriptor,
    f: F,
}

impl<F> TestCaseFn<F>
where
    F: Fn(&TestContext) -> Result<(), TestError> + Send + Sync + 'static,
{
    /// Creates a new function-backed test case.
    pub fn new(descriptor: TestCaseDescriptor, f: F) -> Self {
        Self { descriptor, f }
    }

    /// Creates the case and returns it as a shared handle.
    pub fn arc(descriptor: TestCaseDescriptor, f: F) -> Arc<Self> {
        Arc::new(Self::new(descriptor, f))
    }
}

impl<F> TestCase for TestCaseFn<F>
where
    F: Fn(&TestContext) -> Result<(), TestError> + Send + Sync + 'static,
{
    fn descriptor(&self) -> &TestCaseDescriptor {
        &self.descriptor
    }

    fn run(&self, ctx: &TestContext) -> Result<(), TestError> {
        (self.f)(ctx)
    }
}
