//! Tallies results and signals when a run is over.

use std::sync::Mutex;

use tokio::sync::watch;

use super::sink::MessageSink;
use crate::messages::{Message, MessageKind, RunTotals};

/// Snapshot of a run as seen by [`ExecutionSummarySink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Totals; taken from the finish message when it carries them.
    pub totals: RunTotals,
    /// `ErrorMessage`s observed.
    pub errors: u32,
    /// Whether the finish message has been seen.
    pub finished: bool,
}

/// Counts results per run and exposes a [`finished`](Self::finished) awaitable.
///
/// Until `AssemblyFinished` arrives the totals are tallied from individual
/// result messages; afterwards the finish message's own totals win.
pub struct ExecutionSummarySink {
    summary: Mutex<ExecutionSummary>,
    done: watch::Sender<bool>,
}

impl Default for ExecutionSummarySink {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionSummarySink {
    /// Creates an empty summary.
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            summary: Mutex::new(ExecutionSummary::default()),
            done,
        }
    }

    /// Current snapshot.
    pub fn summary(&self) -> ExecutionSummary {
        *self.summary.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Resolves once `AssemblyFinished` was observed; returns the final summary.
    pub async fn finished(&self) -> ExecutionSummary {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
        self.summary()
    }
}

impl MessageSink for ExecutionSummarySink {
    fn on_message(&self, message: &Message) -> bool {
        let mut s = self.summary.lock().unwrap_or_else(|p| p.into_inner());
        match message.kind {
            MessageKind::TestPassed => s.totals.total += 1,
            MessageKind::TestFailed => {
                s.totals.total += 1;
                s.totals.failed += 1;
            }
            MessageKind::TestSkipped => {
                s.totals.total += 1;
                s.totals.skipped += 1;
            }
            MessageKind::TestNotRun => {
                s.totals.total += 1;
                s.totals.not_run += 1;
            }
            MessageKind::ErrorMessage => s.errors += 1,
            MessageKind::AssemblyFinished => {
                if let Some(totals) = message.totals {
                    s.totals = totals;
                }
                s.finished = true;
                drop(s);
                self.done.send_replace(true);
            }
            _ => {}
        }
        true
    }

    fn name(&self) -> &'static str {
        "ExecutionSummarySink"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tallies_then_prefers_finish_totals() {
        let sink = ExecutionSummarySink::new();
        sink.on_message(&Message::new(MessageKind::TestPassed));
        sink.on_message(&Message::new(MessageKind::TestFailed));
        sink.on_message(&Message::new(MessageKind::TestSkipped));

        let mid = sink.summary();
        assert_eq!((mid.totals.total, mid.totals.failed, mid.totals.skipped), (3, 1, 1));
        assert!(!mid.finished);

        sink.on_message(&Message::error_message(Default::default()));
        sink.on_message(&Message::new(MessageKind::AssemblyFinished).with_totals(RunTotals {
            total: 1,
            failed: 1,
            ..RunTotals::default()
        }));

        let done = sink.finished().await;
        assert!(done.finished);
        assert_eq!(done.errors, 1);
        assert_eq!((done.totals.total, done.totals.failed), (1, 1));
    }
}
