//! # Line-oriented wire codec.
//!
//! One self-describing JSON object per line. The `type` field carries the
//! [`MessageKind`](super::MessageKind) tag; every other field is optional.
//!
//! ```text
//! {"type":"test-assembly-starting","assemblyUniqueId":"a1","assemblyPath":"/t/app"}
//! {"type":"test-passed","assemblyUniqueId":"a1","testCaseUniqueId":"c1","testUniqueId":"c1-0"}
//! {"type":"test-assembly-finished","assemblyUniqueId":"a1","totals":{...}}
//! ```
//!
//! ## Rules
//! - Encoded lines never contain a raw newline (JSON escapes them).
//! - Decoding is lenient about surrounding whitespace and `\r`.
//! - Anything that is not a known message decodes to `None`; callers decide
//!   whether that is worth a diagnostic.

use super::message::Message;

/// Encodes a message as a single line (without the trailing newline).
pub fn to_line(message: &Message) -> String {
    // Serialization of this type cannot fail: no maps with non-string keys,
    // no non-finite floats.
    serde_json::to_string(message).unwrap_or_else(|e| {
        tracing::error!(target: "testvisor::wire", error = %e, "message serialization failed");
        String::new()
    })
}

/// Decodes one line; returns `None` for blank or unparseable input.
pub fn from_line(line: &str) -> Option<Message> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ErrorMetadata, MessageKind, RunTotals};

    #[test]
    fn encoded_line_has_no_newlines() {
        let msg = Message::new(MessageKind::TestFailed)
            .with_test("t1")
            .with_error(ErrorMetadata::single(
                "Assert",
                "line one\nline two",
                Some("at a\nat b".into()),
            ));
        let line = to_line(&msg);
        assert!(!line.contains('\n'));
        assert!(line.starts_with("{\"type\":\"test-failed\""));
        assert_eq!(from_line(&line), Some(msg));
    }

    #[test]
    fn finished_message_keeps_totals() {
        let totals = RunTotals {
            total: 3,
            failed: 1,
            skipped: 0,
            not_run: 0,
            time_ms: 42,
        };
        let msg = Message::new(MessageKind::AssemblyFinished)
            .with_assembly("a1")
            .with_totals(totals);
        let back = from_line(&format!("  {}\r\n", to_line(&msg))).unwrap();
        assert_eq!(back.totals, Some(totals));
    }

    #[test]
    fn garbage_and_unknown_types_are_none() {
        assert!(from_line("").is_none());
        assert!(from_line("   ").is_none());
        assert!(from_line("Hello from the test process").is_none());
        assert!(from_line(r#"{"type":"not-a-real-message"}"#).is_none());
        assert!(from_line(r#"{"assemblyUniqueId":"a1"}"#).is_none());
    }
}
