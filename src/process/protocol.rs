//! # Out-of-process protocol: stream a test process's results into local sinks.
//!
//! [`TestProcessProtocol`] launches a test process and spawns a reader task
//! that turns each line of the child's stdout into a [`Message`] and hands it
//! to the consumer.
//!
//! ## Architecture
//! ```text
//! launch(assembly, args) ──► TestProcess
//!                                │ stdout (one JSON message per line)
//!                                ▼
//!                           reader task ──► ProcessCancellationSink ──► CrashDetectionSink ──► MessageSplitSink
//!                                │               │ first "stop"              │                  ├─► sink
//!                                │               └─► process.cancel(false)   │                  └─► diagnostics
//!                                │ "\n" ack per line (synchronous mode)      │
//!                                ▼                                           │
//!                           child stdin                                      │
//!                                                                            │
//! end of stream / finish message ──► process.dispose(grace) ──► on_process_finished(exit_code)
//! ```
//!
//! ## Rules
//! - Unparseable lines are not fatal; with internal diagnostics enabled they
//!   become an `InternalDiagnosticMessage`.
//! - Reading stops at end of stream or after the run's finish message.
//! - In synchronous mode the acknowledgement is written after each line is handled.
//! - A forceful [`ProtocolHandle::cancel`] stops reading at once and kills the process.
//!
//! Must be used from within a Tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::args::{arguments_for_discovery, arguments_for_run};
use super::launcher::{
    LocalProcessLauncher, ProcessReader, ProcessWriter, TestAssembly, TestProcess,
    TestProcessLauncher,
};
use crate::cases::TestCaseDescriptor;
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::messages::{Message, wire};
use crate::sinks::{
    Bracket, CrashDetectionSink, MessageSink, MessageSplitSink, ProcessCancellationSink, SinkRef,
};

/// Which half of the protocol a reader serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    /// Discovery (`DiscoveryStarting` / `DiscoveryComplete`).
    Discovery,
    /// Execution (`AssemblyStarting` / `AssemblyFinished`).
    Execution,
}

impl ProtocolMode {
    /// Bracket the crash detector watches in this mode.
    pub fn bracket(self) -> Bracket {
        match self {
            ProtocolMode::Discovery => Bracket::discovery(),
            ProtocolMode::Execution => Bracket::execution(),
        }
    }
}

/// What the reader task observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolOutcome {
    /// Exit code of the process, if known.
    pub exit_code: Option<i32>,
    /// Whether the crash detector had to synthesize the bracket.
    pub bracket_synthesized: bool,
    /// Lines read from stdout.
    pub lines: usize,
    /// Lines that were not a known message.
    pub unparseable: usize,
}

/// Handle to a running protocol session.
pub struct ProtocolHandle {
    process: Arc<dyn TestProcess>,
    stop_reading: CancellationToken,
    join: JoinHandle<ProtocolOutcome>,
}

impl ProtocolHandle {
    /// Cancels the test process; `force` also stops reading immediately.
    pub fn cancel(&self, force: bool) {
        if force {
            self.stop_reading.cancel();
        }
        self.process.cancel(force);
    }

    /// The underlying process.
    pub fn process(&self) -> &Arc<dyn TestProcess> {
        &self.process
    }

    /// Waits for the reader task to finish.
    pub async fn wait(self) -> Result<ProtocolOutcome, RunnerError> {
        self.join
            .await
            .map_err(|e| RunnerError::Io(std::io::Error::other(format!("reader task failed: {e}"))))
    }
}

/// Launches test processes and streams their results.
pub struct TestProcessProtocol {
    launcher: Arc<dyn TestProcessLauncher>,
    config: RunnerConfig,
}

impl TestProcessProtocol {
    /// Protocol over a custom launcher.
    pub fn new(launcher: Arc<dyn TestProcessLauncher>, config: RunnerConfig) -> Self {
        Self { launcher, config }
    }

    /// Protocol launching local child processes.
    pub fn local(config: RunnerConfig) -> Self {
        let launcher = Arc::new(LocalProcessLauncher::new(config.response_file_threshold));
        Self::new(launcher, config)
    }

    /// Starts discovery of `assembly`.
    pub fn find(
        &self,
        assembly: &TestAssembly,
        sink: SinkRef,
        diagnostics: Option<SinkRef>,
    ) -> Result<ProtocolHandle, RunnerError> {
        let args = arguments_for_discovery(assembly, &self.config);
        self.start(ProtocolMode::Discovery, assembly, args, sink, diagnostics)
    }

    /// Starts execution of `cases` (all cases when empty).
    pub fn run(
        &self,
        assembly: &TestAssembly,
        cases: &[TestCaseDescriptor],
        sink: SinkRef,
        diagnostics: Option<SinkRef>,
    ) -> Result<ProtocolHandle, RunnerError> {
        let args = arguments_for_run(assembly, cases, &self.config);
        self.start(ProtocolMode::Execution, assembly, args, sink, diagnostics)
    }

    fn start(
        &self,
        mode: ProtocolMode,
        assembly: &TestAssembly,
        args: Vec<String>,
        sink: SinkRef,
        diagnostics: Option<SinkRef>,
    ) -> Result<ProtocolHandle, RunnerError> {
        let process = self.launcher.launch(assembly, args)?;

        let crash = Arc::new(
            CrashDetectionSink::new(
                MessageSplitSink::new(sink, diagnostics),
                mode.bracket(),
                assembly.assembly_path.clone(),
                assembly.config_path.clone(),
            )
            .with_grace(self.config.crash_grace),
        );
        let chain = ProcessCancellationSink::new(Arc::clone(&crash), Arc::clone(&process));
        let stop_reading = CancellationToken::new();

        let reader = Reader {
            process: Arc::clone(&process),
            chain,
            crash,
            mode,
            stop_reading: stop_reading.clone(),
            synchronous: self.config.synchronous_message_reporting
                && assembly.supports_synchronous_reporting(),
            internal_diagnostics: self.config.internal_diagnostic_messages,
            shutdown_grace: self.config.process_shutdown_grace,
        };
        let join = tokio::spawn(reader.run());

        Ok(ProtocolHandle {
            process,
            stop_reading,
            join,
        })
    }
}

type Chain = ProcessCancellationSink<Arc<CrashDetectionSink<MessageSplitSink>>>;

struct Reader {
    process: Arc<dyn TestProcess>,
    chain: Chain,
    crash: Arc<CrashDetectionSink<MessageSplitSink>>,
    mode: ProtocolMode,
    stop_reading: CancellationToken,
    synchronous: bool,
    internal_diagnostics: bool,
    shutdown_grace: Duration,
}

impl Reader {
    async fn run(self) -> ProtocolOutcome {
        let mut outcome = ProtocolOutcome::default();
        match self.process.take_stdout() {
            Some(stdout) => self.pump(stdout, &mut outcome).await,
            None => {
                tracing::warn!(target: "testvisor::process", "test process has no readable output");
            }
        }

        if let Err(e) = self.process.dispose(self.shutdown_grace).await {
            tracing::warn!(target: "testvisor::process", error = %e, "test process disposal failed");
        }
        outcome.exit_code = self.process.exit_code();
        outcome.bracket_synthesized = self.crash.on_process_finished(outcome.exit_code).await;

        tracing::debug!(
            target: "testvisor::process",
            mode = ?self.mode,
            lines = outcome.lines,
            unparseable = outcome.unparseable,
            exit_code = ?outcome.exit_code,
            synthesized = outcome.bracket_synthesized,
            "reader finished"
        );
        outcome
    }

    async fn pump(&self, stdout: ProcessReader, outcome: &mut ProtocolOutcome) {
        let mut lines = BufReader::new(stdout).lines();
        let mut ack = if self.synchronous {
            self.process.take_stdin()
        } else {
            None
        };
        let finish = self.mode.bracket().finish;

        loop {
            let next = tokio::select! {
                _ = self.stop_reading.cancelled() => {
                    tracing::debug!(target: "testvisor::process", "reading aborted");
                    break;
                }
                next = lines.next_line() => next,
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(target: "testvisor::process", error = %e, "failed to read test process output");
                    break;
                }
            };
            outcome.lines += 1;

            let mut finished = false;
            match wire::from_line(&line) {
                Some(message) => {
                    finished = message.kind == finish;
                    self.chain.on_message(&message);
                }
                None if line.trim().is_empty() => {}
                None => {
                    outcome.unparseable += 1;
                    if self.internal_diagnostics {
                        self.chain.on_message(&Message::internal_diagnostic(format!(
                            "Received unparseable output from test process: {line}"
                        )));
                    }
                }
            }

            let ack_failed = match ack.as_mut() {
                Some(stdin) => write_ack(stdin).await.err(),
                None => None,
            };
            if let Some(e) = ack_failed {
                tracing::warn!(target: "testvisor::process", error = %e, "failed to acknowledge message; continuing without acks");
                ack = None;
            }

            if finished {
                break;
            }
        }
    }
}

async fn write_ack(stdin: &mut ProcessWriter) -> std::io::Result<()> {
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}
