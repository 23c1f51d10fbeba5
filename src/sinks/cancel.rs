//! Turns a consumer's "stop" into a graceful process cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::sink::MessageSink;
use crate::messages::Message;
use crate::process::TestProcess;

/// Forwards to `inner`; the first `false` answer cancels the process gracefully.
///
/// The answer is passed back unchanged. Later `false` answers do not cancel again.
pub struct ProcessCancellationSink<S> {
    inner: S,
    process: Arc<dyn TestProcess>,
    cancelled: AtomicBool,
}

impl<S: MessageSink> ProcessCancellationSink<S> {
    /// Wraps `inner` for `process`.
    pub fn new(inner: S, process: Arc<dyn TestProcess>) -> Self {
        Self {
            inner,
            process,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Whether a cancellation was issued.
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<S: MessageSink> MessageSink for ProcessCancellationSink<S> {
    fn on_message(&self, message: &Message) -> bool {
        let keep_going = self.inner.on_message(message);
        if !keep_going && !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "testvisor::process", sink = self.inner.name(), "consumer asked to stop; cancelling test process");
            self.process.cancel(false);
        }
        keep_going
    }

    fn name(&self) -> &'static str {
        "ProcessCancellationSink"
    }
}
