//! # Crash detection: every run gets a well-formed start/finish bracket.
//!
//! [`CrashDetectionSink`] sits in front of a sink and watches for the two
//! bracket messages of a run (see [`Bracket`]). When the owning process ends it
//! gives the real finish message a grace period to arrive; if it never does, it
//! synthesizes the missing pieces so downstream aggregation always sees one
//! start and one finish per run.
//!
//! ## State machine
//! ```text
//! WaitingForMessages ──start──► SawStart ──finish──► SawFinish
//!          │                       │
//!          └──── on_process_finished(exit_code), no finish within grace ────┐
//!                                                                          ▼
//!                             Finalized: [start]? + ErrorMessage + finish(total 1, failed 1)
//! ```
//!
//! ## Rules
//! - Every message is forwarded unchanged until the sink is finalized.
//! - Only the first start and the first finish of the bracket kinds are kept.
//! - After finalization incoming messages are dropped and answered with `true`.
//! - The grace period is measured from the last message seen.
//! - Synthesized totals are a fixed `total = 1, failed = 1`.

use std::hash::Hasher;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use siphasher::sip::SipHasher13;

use super::sink::MessageSink;
use crate::messages::{ErrorMetadata, Message, MessageKind, RunTotals};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Start/finish message kinds that delimit one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bracket {
    /// Kind that opens the run.
    pub start: MessageKind,
    /// Kind that closes the run.
    pub finish: MessageKind,
}

impl Bracket {
    /// `AssemblyStarting` / `AssemblyFinished`.
    pub const fn execution() -> Self {
        Self {
            start: MessageKind::AssemblyStarting,
            finish: MessageKind::AssemblyFinished,
        }
    }

    /// `DiscoveryStarting` / `DiscoveryComplete`.
    pub const fn discovery() -> Self {
        Self {
            start: MessageKind::DiscoveryStarting,
            finish: MessageKind::DiscoveryComplete,
        }
    }
}

struct BracketState {
    start: Option<Message>,
    finish: Option<Message>,
    last_message: Instant,
}

/// Pass-through sink that repairs broken start/finish brackets.
pub struct CrashDetectionSink<S> {
    inner: S,
    bracket: Bracket,
    assembly_path: String,
    config_path: Option<String>,
    grace: Duration,
    state: Mutex<BracketState>,
    stop_processing: AtomicBool,
}

impl<S: MessageSink> CrashDetectionSink<S> {
    /// Wraps `inner` for the run of `assembly_path` with the default 5 s grace.
    pub fn new(
        inner: S,
        bracket: Bracket,
        assembly_path: impl Into<String>,
        config_path: Option<String>,
    ) -> Self {
        Self {
            inner,
            bracket,
            assembly_path: assembly_path.into(),
            config_path,
            grace: Duration::from_secs(5),
            state: Mutex::new(BracketState {
                start: None,
                finish: None,
                last_message: Instant::now(),
            }),
            stop_processing: AtomicBool::new(false),
        }
    }

    /// Overrides the grace period.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// The wrapped sink.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// First start message seen, if any.
    pub fn start_message(&self) -> Option<Message> {
        self.lock().start.clone()
    }

    /// First finish message seen, if any.
    pub fn finish_message(&self) -> Option<Message> {
        self.lock().finish.clone()
    }

    /// Called once the owning process or run is over.
    ///
    /// Returns `true` when the bracket had to be synthesized.
    pub async fn on_process_finished(&self, exit_code: Option<i32>) -> bool {
        loop {
            let idle = {
                let state = self.lock();
                if state.finish.is_some() {
                    return false;
                }
                state.last_message.elapsed()
            };
            if idle >= self.grace {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL.min(self.grace - idle)).await;
        }

        self.stop_processing.store(true, Ordering::Release);
        let start = self.lock().start.clone();
        tracing::warn!(
            target: "testvisor::crash",
            assembly = %self.assembly_path,
            exit_code = ?exit_code,
            saw_start = start.is_some(),
            "finish message missing; synthesizing bracket"
        );

        let assembly_id = match &start {
            Some(msg) => msg
                .assembly_unique_id
                .as_deref()
                .map(str::to_owned)
                .unwrap_or_else(|| self.synthetic_id()),
            None => {
                let id = self.synthetic_id();
                let synthesized = Message::new(self.bracket.start)
                    .with_assembly(id.as_str())
                    .with_paths(self.assembly_path.as_str(), self.config_path.as_deref());
                self.inner.on_message(&synthesized);
                id
            }
        };

        let text = match exit_code {
            Some(code) => format!("Test process crashed with exit code {code}."),
            None => "Test process crashed or communication channel was lost.".to_string(),
        };
        let error = Message::error_message(ErrorMetadata::single("TestProcessCrashed", text, None))
            .with_assembly(assembly_id.as_str());
        self.inner.on_message(&error);

        let finish = Message::new(self.bracket.finish)
            .with_assembly(assembly_id.as_str())
            .with_totals(RunTotals {
                total: 1,
                failed: 1,
                ..RunTotals::default()
            });
        self.inner.on_message(&finish);
        true
    }

    /// Stable identifier derived from the assembly and config paths.
    fn synthetic_id(&self) -> String {
        let mut hasher = SipHasher13::new();
        hasher.write(self.assembly_path.as_bytes());
        hasher.write_u8(0);
        if let Some(config) = &self.config_path {
            hasher.write(config.as_bytes());
        }
        format!("{:016x}", hasher.finish())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BracketState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<S: MessageSink> MessageSink for CrashDetectionSink<S> {
    fn on_message(&self, message: &Message) -> bool {
        if self.stop_processing.load(Ordering::Acquire) {
            return true;
        }
        {
            let mut state = self.lock();
            state.last_message = Instant::now();
            if message.kind == self.bracket.start && state.start.is_none() {
                state.start = Some(message.clone());
            } else if message.kind == self.bracket.finish && state.finish.is_none() {
                state.finish = Some(message.clone());
            }
        }
        self.inner.on_message(message)
    }

    fn name(&self) -> &'static str {
        "CrashDetectionSink"
    }
}
