//! Out-of-process execution: launching test processes and streaming their results.
//!
//! - [`TestProcess`] / [`TestProcessLauncher`] / [`LocalProcessLauncher`]: process handles.
//! - [`arguments_for_run`] / [`arguments_for_discovery`] / [`ResponseFile`]: command lines.
//! - [`TestProcessProtocol`] / [`ProtocolHandle`]: parent-side reader.
//! - [`LineReporterSink`]: child-side writer.

mod args;
mod launcher;
mod protocol;
mod reporter;

pub use args::{
    RESPONSE_FILE_PREFIX, ResponseFile, arguments_for_discovery, arguments_for_run,
    expand_response_files, spill_arguments,
};
pub use launcher::{
    FrameworkVersion, LocalProcess, LocalProcessLauncher, ProcessReader, ProcessWriter, TestAssembly,
    TestProcess, TestProcessLauncher,
};
pub use protocol::{ProtocolHandle, ProtocolMode, ProtocolOutcome, TestProcessProtocol};
pub use reporter::LineReporterSink;
