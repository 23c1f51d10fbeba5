//! # LogSink: tracing reporter
//!
//! A minimal sink that reports incoming [`Message`]s through `tracing`.
//! Use it for tests, demos or as a fallback reporter.
//!
//! ## Example output
//! ```text
//! INFO  testvisor::report: assembly starting assembly="a1" path="/t/app"
//! INFO  testvisor::report: passed test="c1-0" time_ms=3
//! WARN  testvisor::report: failed test="c2-0" error="test failed: boom"
//! INFO  testvisor::report: skipped test="c3-0" reason="slow"
//! INFO  testvisor::report: assembly finished total=3 failed=1 skipped=1 time_ms=42
//! ```

use super::sink::MessageSink;
use crate::messages::{Message, MessageKind};

/// Message reporter sink.
#[derive(Default)]
pub struct LogSink;

impl LogSink {
    /// Construct a new [`LogSink`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MessageSink for LogSink {
    fn on_message(&self, m: &Message) -> bool {
        let test = m.test_unique_id.as_deref().or(m.test_case_unique_id.as_deref());
        let error = m.error.as_ref().and_then(|e| e.root_message());
        match m.kind {
            MessageKind::AssemblyStarting | MessageKind::DiscoveryStarting => {
                tracing::info!(
                    target: "testvisor::report",
                    assembly = ?m.assembly_unique_id,
                    path = ?m.assembly_path,
                    "{} starting",
                    phase(m.kind)
                );
            }
            MessageKind::AssemblyFinished | MessageKind::DiscoveryComplete => {
                let t = m.totals.unwrap_or_default();
                tracing::info!(
                    target: "testvisor::report",
                    total = t.total,
                    failed = t.failed,
                    skipped = t.skipped,
                    not_run = t.not_run,
                    time_ms = t.time_ms,
                    "{} finished",
                    phase(m.kind)
                );
            }
            MessageKind::TestPassed => {
                tracing::info!(target: "testvisor::report", test = ?test, time_ms = ?m.execution_time_ms, "passed");
            }
            MessageKind::TestFailed => {
                tracing::warn!(target: "testvisor::report", test = ?test, error = ?error, "failed");
            }
            MessageKind::TestSkipped => {
                tracing::info!(target: "testvisor::report", test = ?test, reason = ?m.text, "skipped");
            }
            MessageKind::TestNotRun => {
                tracing::info!(target: "testvisor::report", test = ?test, "not run");
            }
            MessageKind::TestOutput => {
                tracing::debug!(target: "testvisor::report", test = ?test, output = ?m.text, "output");
            }
            MessageKind::TestCaseDiscovered => {
                tracing::debug!(target: "testvisor::report", case = ?m.test_case_unique_id, name = ?m.display_name, "discovered");
            }
            MessageKind::DiagnosticMessage | MessageKind::InternalDiagnosticMessage => {
                tracing::debug!(target: "testvisor::report", kind = m.kind.tag(), text = ?m.text, "diagnostic");
            }
            MessageKind::ErrorMessage => {
                tracing::error!(target: "testvisor::report", assembly = ?m.assembly_unique_id, error = ?error, "error");
            }
            other => {
                tracing::trace!(target: "testvisor::report", kind = other.tag(), test = ?test, "message");
            }
        }
        true
    }

    fn name(&self) -> &'static str {
        "LogSink"
    }
}

fn phase(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::DiscoveryStarting | MessageKind::DiscoveryComplete => "discovery",
        _ => "assembly",
    }
}
