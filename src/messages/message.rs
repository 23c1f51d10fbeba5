//! # Test messages flowing from execution/discovery to reporters.
//!
//! The [`MessageKind`] enum classifies messages across four categories:
//! - **Bracket messages**: assembly/collection/class/method/case/test starting + finished
//! - **Results**: passed, failed, skipped, not-run, output
//! - **Discovery**: discovery starting/complete, test case discovered
//! - **Diagnostics**: diagnostic, internal diagnostic, error
//!
//! The [`Message`] struct carries cross-process-stable unique IDs that tie it to
//! its owning assembly/collection/class/method/case, plus optional payload
//! fields that are set depending on the kind.
//!
//! Messages are immutable once built; the bus and every sink only borrow them.
//!
//! ## Example
//! ```rust
//! use testvisor::{ErrorMetadata, Message, MessageKind};
//!
//! let msg = Message::new(MessageKind::TestFailed)
//!     .with_assembly("asm-1")
//!     .with_test_case("case-7")
//!     .with_test("case-7-0")
//!     .with_display_name("math.adds")
//!     .with_error(ErrorMetadata::single("AssertionError", "1 != 2", None));
//!
//! assert_eq!(msg.kind, MessageKind::TestFailed);
//! assert_eq!(msg.test_case_unique_id.as_deref(), Some("case-7"));
//! assert!(msg.is_failure());
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TestError;

/// Classification of test messages.
///
/// Every variant has a stable wire tag (see [`MessageKind::tag`]) that is used
/// as the `type` field of the line protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    // === Execution brackets ===
    /// Test assembly is starting.
    ///
    /// Sets: `assembly_unique_id`, `assembly_path`, `config_path`, `display_name`.
    #[serde(rename = "test-assembly-starting")]
    AssemblyStarting,
    /// Test assembly finished.
    ///
    /// Sets: `assembly_unique_id`, `totals`.
    #[serde(rename = "test-assembly-finished")]
    AssemblyFinished,
    /// Test collection is starting.
    #[serde(rename = "test-collection-starting")]
    CollectionStarting,
    /// Test collection finished.
    #[serde(rename = "test-collection-finished")]
    CollectionFinished,
    /// Test class is starting.
    #[serde(rename = "test-class-starting")]
    ClassStarting,
    /// Test class finished.
    #[serde(rename = "test-class-finished")]
    ClassFinished,
    /// Test method is starting.
    #[serde(rename = "test-method-starting")]
    MethodStarting,
    /// Test method finished.
    #[serde(rename = "test-method-finished")]
    MethodFinished,
    /// Test case is starting.
    #[serde(rename = "test-case-starting")]
    TestCaseStarting,
    /// Test case finished.
    ///
    /// Sets: `totals` (for this case).
    #[serde(rename = "test-case-finished")]
    TestCaseFinished,
    /// A single test (one execution of a case) is starting.
    #[serde(rename = "test-starting")]
    TestStarting,
    /// A single test finished (always follows its result message).
    #[serde(rename = "test-finished")]
    TestFinished,

    // === Results ===
    /// Test passed.
    #[serde(rename = "test-passed")]
    TestPassed,
    /// Test failed.
    ///
    /// Sets: `error`.
    #[serde(rename = "test-failed")]
    TestFailed,
    /// Test skipped.
    ///
    /// Sets: `text` (skip reason).
    #[serde(rename = "test-skipped")]
    TestSkipped,
    /// Test was not run (cancelled or filtered at run time).
    #[serde(rename = "test-not-run")]
    TestNotRun,
    /// Output captured from a running test.
    ///
    /// Sets: `text`.
    #[serde(rename = "test-output")]
    TestOutput,

    // === Discovery ===
    /// Discovery of an assembly is starting.
    #[serde(rename = "discovery-starting")]
    DiscoveryStarting,
    /// Discovery of an assembly completed.
    ///
    /// Sets: `totals.total` (test cases discovered).
    #[serde(rename = "discovery-complete")]
    DiscoveryComplete,
    /// One test case was discovered.
    ///
    /// Sets: `test_case_unique_id`, `display_name`, `text` (serialized descriptor).
    #[serde(rename = "test-case-discovered")]
    TestCaseDiscovered,

    // === Diagnostics ===
    /// Diagnostic message intended for the user.
    #[serde(rename = "diagnostic-message")]
    DiagnosticMessage,
    /// Diagnostic message about the runner itself.
    #[serde(rename = "internal-diagnostic-message")]
    InternalDiagnosticMessage,
    /// Error outside any test (sink failure, crashed process, ...).
    ///
    /// Sets: `error`.
    #[serde(rename = "error-message")]
    ErrorMessage,
}

impl MessageKind {
    /// Stable wire tag of this kind.
    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::AssemblyStarting => "test-assembly-starting",
            MessageKind::AssemblyFinished => "test-assembly-finished",
            MessageKind::CollectionStarting => "test-collection-starting",
            MessageKind::CollectionFinished => "test-collection-finished",
            MessageKind::ClassStarting => "test-class-starting",
            MessageKind::ClassFinished => "test-class-finished",
            MessageKind::MethodStarting => "test-method-starting",
            MessageKind::MethodFinished => "test-method-finished",
            MessageKind::TestCaseStarting => "test-case-starting",
            MessageKind::TestCaseFinished => "test-case-finished",
            MessageKind::TestStarting => "test-starting",
            MessageKind::TestFinished => "test-finished",
            MessageKind::TestPassed => "test-passed",
            MessageKind::TestFailed => "test-failed",
            MessageKind::TestSkipped => "test-skipped",
            MessageKind::TestNotRun => "test-not-run",
            MessageKind::TestOutput => "test-output",
            MessageKind::DiscoveryStarting => "discovery-starting",
            MessageKind::DiscoveryComplete => "discovery-complete",
            MessageKind::TestCaseDiscovered => "test-case-discovered",
            MessageKind::DiagnosticMessage => "diagnostic-message",
            MessageKind::InternalDiagnosticMessage => "internal-diagnostic-message",
            MessageKind::ErrorMessage => "error-message",
        }
    }
}

/// Structured failure information.
///
/// Parallel vectors describe a tree of errors: entry `i` has type
/// `exception_types[i]`, text `messages[i]`, optional trace `stack_traces[i]`
/// and parent `parent_indices[i]` (`-1` for the root).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetadata {
    /// Error type names.
    pub exception_types: Vec<String>,
    /// Error messages.
    pub messages: Vec<String>,
    /// Optional stack traces.
    pub stack_traces: Vec<Option<String>>,
    /// Parent index for each entry (`-1` = root).
    pub parent_indices: Vec<i32>,
}

impl ErrorMetadata {
    /// Metadata describing a single root error.
    pub fn single(
        exception_type: impl Into<String>,
        message: impl Into<String>,
        stack_trace: Option<String>,
    ) -> Self {
        Self {
            exception_types: vec![exception_type.into()],
            messages: vec![message.into()],
            stack_traces: vec![stack_trace],
            parent_indices: vec![-1],
        }
    }

    /// Appends a nested error under `parent` and returns its index.
    pub fn push_child(
        &mut self,
        parent: usize,
        exception_type: impl Into<String>,
        message: impl Into<String>,
    ) -> usize {
        self.exception_types.push(exception_type.into());
        self.messages.push(message.into());
        self.stack_traces.push(None);
        self.parent_indices.push(parent as i32);
        self.exception_types.len() - 1
    }

    /// Metadata for a test-body error.
    pub fn from_test_error(err: &TestError) -> Self {
        Self::single(err.type_name(), err.as_message(), None)
    }

    /// Message of the root error, if any.
    pub fn root_message(&self) -> Option<&str> {
        self.messages.first().map(String::as_str)
    }
}

/// Totals reported by finished/complete messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    /// Tests run (or discovered, for `DiscoveryComplete`).
    pub total: u32,
    /// Tests failed.
    pub failed: u32,
    /// Tests skipped.
    pub skipped: u32,
    /// Tests not run.
    pub not_run: u32,
    /// Elapsed time in milliseconds.
    pub time_ms: u64,
}

impl RunTotals {
    /// Tests that passed.
    pub fn passed(&self) -> u32 {
        self.total
            .saturating_sub(self.failed)
            .saturating_sub(self.skipped)
            .saturating_sub(self.not_run)
    }
}

/// Test message with optional metadata.
///
/// - `kind`: what happened
/// - `*_unique_id`: cross-process-stable foreign keys to the owning scopes
/// - other optional fields are set depending on the [`MessageKind`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message classification (wire field `type`).
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Owning assembly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_unique_id: Option<Arc<str>>,
    /// Owning collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_unique_id: Option<Arc<str>>,
    /// Owning class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_unique_id: Option<Arc<str>>,
    /// Owning method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_unique_id: Option<Arc<str>>,
    /// Owning test case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_unique_id: Option<Arc<str>>,
    /// The individual test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_unique_id: Option<Arc<str>>,

    /// Display name of the scope the message refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Arc<str>>,
    /// Assembly path (assembly/discovery starting).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_path: Option<Arc<str>>,
    /// Configuration file path (assembly/discovery starting).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<Arc<str>>,
    /// Free text: diagnostics, output, skip reason, serialized descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<Arc<str>>,
    /// Failure information (failed / error messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMetadata>,
    /// Execution time of a single test, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// Totals for finished/complete messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totals: Option<RunTotals>,
}

impl Message {
    /// Creates an empty message of the given kind.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            assembly_unique_id: None,
            collection_unique_id: None,
            class_unique_id: None,
            method_unique_id: None,
            test_case_unique_id: None,
            test_unique_id: None,
            display_name: None,
            assembly_path: None,
            config_path: None,
            text: None,
            error: None,
            execution_time_ms: None,
            totals: None,
        }
    }

    /// Attaches the owning assembly ID.
    #[inline]
    pub fn with_assembly(mut self, id: impl Into<Arc<str>>) -> Self {
        self.assembly_unique_id = Some(id.into());
        self
    }

    /// Attaches the owning collection ID.
    #[inline]
    pub fn with_collection(mut self, id: impl Into<Arc<str>>) -> Self {
        self.collection_unique_id = Some(id.into());
        self
    }

    /// Attaches the owning class ID.
    #[inline]
    pub fn with_class(mut self, id: impl Into<Arc<str>>) -> Self {
        self.class_unique_id = Some(id.into());
        self
    }

    /// Attaches the owning method ID.
    #[inline]
    pub fn with_method(mut self, id: impl Into<Arc<str>>) -> Self {
        self.method_unique_id = Some(id.into());
        self
    }

    /// Attaches the owning test case ID.
    #[inline]
    pub fn with_test_case(mut self, id: impl Into<Arc<str>>) -> Self {
        self.test_case_unique_id = Some(id.into());
        self
    }

    /// Attaches the test ID.
    #[inline]
    pub fn with_test(mut self, id: impl Into<Arc<str>>) -> Self {
        self.test_unique_id = Some(id.into());
        self
    }

    /// Attaches a display name.
    #[inline]
    pub fn with_display_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Attaches assembly and optional config paths.
    #[inline]
    pub fn with_paths(mut self, assembly: impl Into<Arc<str>>, config: Option<&str>) -> Self {
        self.assembly_path = Some(assembly.into());
        self.config_path = config.map(Arc::from);
        self
    }

    /// Attaches free text.
    #[inline]
    pub fn with_text(mut self, text: impl Into<Arc<str>>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Attaches failure metadata.
    #[inline]
    pub fn with_error(mut self, error: ErrorMetadata) -> Self {
        self.error = Some(error);
        self
    }

    /// Attaches an execution time (stored as milliseconds).
    #[inline]
    pub fn with_execution_time(mut self, d: Duration) -> Self {
        self.execution_time_ms = Some(d.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    /// Attaches totals.
    #[inline]
    pub fn with_totals(mut self, totals: RunTotals) -> Self {
        self.totals = Some(totals);
        self
    }

    /// Creates a user-facing diagnostic message.
    #[inline]
    pub fn diagnostic(text: impl Into<Arc<str>>) -> Self {
        Message::new(MessageKind::DiagnosticMessage).with_text(text)
    }

    /// Creates an internal diagnostic message.
    #[inline]
    pub fn internal_diagnostic(text: impl Into<Arc<str>>) -> Self {
        Message::new(MessageKind::InternalDiagnosticMessage).with_text(text)
    }

    /// Creates an error message carrying `error`.
    #[inline]
    pub fn error_message(error: ErrorMetadata) -> Self {
        Message::new(MessageKind::ErrorMessage).with_error(error)
    }

    /// Whether this is a (user or internal) diagnostic message.
    #[inline]
    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::DiagnosticMessage | MessageKind::InternalDiagnosticMessage
        )
    }

    /// Whether this message reports a failed test.
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self.kind, MessageKind::TestFailed)
    }
}
