//! Routes diagnostics and results to different sinks.

use super::sink::{MessageSink, SinkRef};
use crate::messages::Message;

/// Sends diagnostic and internal-diagnostic messages to an optional diagnostic
/// sink and everything else to the main sink.
///
/// Diagnostics are dropped (and answered with `true`) when no diagnostic sink
/// is configured. Each target keeps its own order; nothing is promised across
/// the two.
pub struct MessageSplitSink {
    main: SinkRef,
    diagnostics: Option<SinkRef>,
}

impl MessageSplitSink {
    /// Creates a splitter.
    pub fn new(main: SinkRef, diagnostics: Option<SinkRef>) -> Self {
        Self { main, diagnostics }
    }
}

impl MessageSink for MessageSplitSink {
    fn on_message(&self, message: &Message) -> bool {
        if message.is_diagnostic() {
            return match &self.diagnostics {
                Some(sink) => sink.on_message(message),
                None => true,
            };
        }
        self.main.on_message(message)
    }

    fn name(&self) -> &'static str {
        "MessageSplitSink"
    }
}
