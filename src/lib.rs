//! # testvisor
//!
//! **Testvisor** is the execution core of a unit-testing framework.
//!
//! It runs test cases on a bounded pool of worker threads, streams their
//! results as ordered messages to pluggable sinks, and drives tests in a
//! separate process over a line-oriented protocol while recovering from
//! crashes of that process.
//!
//! ## Architecture
//! ### In-process
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │   TestCase   │   │   TestCase   │   │   TestCase   │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  TestRunner                                                       │
//! │  - TestCaseOrderer (stable hash order, random fallback)           │
//! │  - BoundedDispatcher (N worker threads, ExecutionContext flows)   │
//! │  - AsyncOperationTracker (per test, awaits detached work)         │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!     worker 1           worker 2           worker N
//!        │ TestStarting     │ TestPassed       │ TestFailed ...
//!        ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │        MessageBus (unbounded FIFO, one delivery thread)           │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                         sink.on_message() ──► bool latch
//! ```
//!
//! ### Out-of-process
//! ```text
//! TestProcessProtocol::run()
//!   ├─► arguments_for_run() (+ response file when long)
//!   ├─► TestProcessLauncher::launch() ──► child stdout
//!   └─► reader task: one JSON message per line
//!          ▼
//!   ProcessCancellationSink ─► CrashDetectionSink ─► MessageSplitSink ─► sink
//!                                   │                                 └► diagnostics
//!                                   └─ process exited without a finish:
//!                                      synthesize start? + ErrorMessage + finish
//! ```
//!
//! ## Features
//! | Area              | Description                                                   | Key types / traits                              |
//! |-------------------|---------------------------------------------------------------|-------------------------------------------------|
//! | **Messages**      | Typed test messages and their line codec.                     | [`Message`], [`MessageKind`], [`wire`]          |
//! | **Sinks**         | Consume messages; answer whether producers should continue.   | [`MessageSink`], [`CrashDetectionSink`]         |
//! | **Buses**         | Ordered delivery from many producers to one sink.             | [`MessageBus`], [`SynchronousMessageBus`]       |
//! | **Dispatch**      | Bounded worker threads with context flow.                     | [`BoundedDispatcher`], [`ExecutionContext`]     |
//! | **Execution**     | Run cases in-process.                                         | [`TestRunner`], [`TestCase`], [`TestCaseFn`]    |
//! | **Processes**     | Launch test processes and read their results.                 | [`TestProcessProtocol`], [`LocalProcessLauncher`] |
//! | **Disposal**      | Reverse-order cleanup of sync and async resources.            | [`DisposalTracker`]                             |
//! | **Errors**        | Typed errors for the runner and for test bodies.              | [`RunnerError`], [`TestError`]                  |
//! | **Configuration** | Centralize runner settings.                                   | [`RunnerConfig`]                                |
//!
//! ## Optional features
//! - `logging` (default): exports [`LogSink`], a sink that writes every message to `tracing`.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use testvisor::{
//!     ExecutionSummarySink, RunnerConfig, TestCaseDescriptor, TestCaseFn, TestCaseRef,
//!     TestContext, TestError, TestRunner,
//! };
//!
//! #[tokio::main(flavor = "multi_thread", worker_threads = 2)]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = RunnerConfig::default();
//!     cfg.max_concurrency = 2;
//!
//!     let cases: Vec<TestCaseRef> = vec![
//!         TestCaseFn::arc(TestCaseDescriptor::new("math.adds", "adds"), |_ctx: &TestContext| {
//!             Ok(())
//!         }),
//!         TestCaseFn::arc(TestCaseDescriptor::new("math.fails", "fails"), |_ctx: &TestContext| {
//!             Err(TestError::failed("expected 4, got 5"))
//!         }),
//!     ];
//!
//!     let summary_sink = Arc::new(ExecutionSummarySink::new());
//!     let summary = TestRunner::new(cfg).run(cases, Arc::clone(&summary_sink)).await?;
//!
//!     assert_eq!(summary.totals.total, 2);
//!     assert_eq!(summary.totals.failed, 1);
//!     assert!(summary_sink.summary().finished);
//!     Ok(())
//! }
//! ```
mod cases;
mod config;
mod disposal;
mod dispatch;
mod error;
mod execution;
mod messages;
mod process;
mod sinks;

// ---- Public re-exports ----

pub use cases::{
    DefaultTestCaseOrderer, ExtensionRegistry, OrderedCases, TestCaseDescriptor, TestCaseOrderer,
    default_order, order_test_cases,
};
pub use config::RunnerConfig;
pub use dispatch::{AsyncOperationTracker, BoundedDispatcher, DispatcherHandle, ExecutionContext};
pub use disposal::{AsyncDispose, Dispose, DisposalTracker};
pub use error::{RunnerError, TestError};
pub use execution::{RunSummary, TestCase, TestCaseFn, TestCaseRef, TestContext, TestRunner};
pub use messages::{
    Bus, ErrorMetadata, Message, MessageBus, MessageKind, RunTotals, SynchronousMessageBus, wire,
};
pub use process::{
    FrameworkVersion, LineReporterSink, LocalProcess, LocalProcessLauncher, ProcessReader,
    ProcessWriter, ProtocolHandle, ProtocolMode, ProtocolOutcome, RESPONSE_FILE_PREFIX,
    ResponseFile, TestAssembly, TestProcess, TestProcessLauncher, TestProcessProtocol,
    arguments_for_discovery, arguments_for_run, expand_response_files, spill_arguments,
};
pub use sinks::{
    Bracket, CrashDetectionSink, ExecutionSummary, ExecutionSummarySink, FnSink, MessageSink,
    MessageSplitSink, NullSink, ProcessCancellationSink, SinkRef,
};

// Optional: built-in tracing reporter.
// Enable with: `--features logging` (on by default)
#[cfg(feature = "logging")]
pub use sinks::LogSink;
