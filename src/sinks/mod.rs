//! # Message sinks.
//!
//! This module provides the [`MessageSink`] trait and the built-in sinks that
//! sit between message producers and reporters.
//!
//! ## Architecture
//! ```text
//! child stdout ──► reader loop ──► ProcessCancellationSink ──► CrashDetectionSink ──► MessageBus ──► reporter
//!                                  (first "stop" → cancel)     (repairs brackets)     (FIFO thread)
//!
//! reporter may be:
//!   MessageSplitSink ──┬─► main sink (results)
//!                      └─► diagnostic sink (diagnostics)
//!   ExecutionSummarySink, LogSink, FnSink, any custom sink
//! ```

mod cancel;
mod crash;
#[cfg(feature = "logging")]
mod log;
mod sink;
mod split;
mod summary;

pub use cancel::ProcessCancellationSink;
pub use crash::{Bracket, CrashDetectionSink};
#[cfg(feature = "logging")]
pub use log::LogSink;
pub use sink::{FnSink, MessageSink, NullSink, SinkRef};
pub use split::MessageSplitSink;
pub use summary::{ExecutionSummary, ExecutionSummarySink};
