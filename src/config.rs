//! # Runner configuration.
//!
//! Provides [`RunnerConfig`], the settings shared by the bus, the dispatcher,
//! the crash detector and the out-of-process protocol.
//!
//! Config is used in three ways:
//! 1. **Execution**: `TestRunner::new(config, ...)` sizes the dispatcher and bus.
//! 2. **Out-of-process runs**: argument factory and reader loop flags.
//! 3. **Crash detection**: grace periods.
//!
//! ## Sentinel values
//! - `max_concurrency = 0` → one worker per logical CPU
//!
//! ## JSON form
//! ```json
//! {
//!   "maxParallelThreads": 4,
//!   "stopOnFail": true,
//!   "synchronousMessageReporting": false,
//!   "internalDiagnosticMessages": false,
//!   "crashGraceMs": 5000
//! }
//! ```

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RunnerError;

/// Configuration for a test run.
///
/// ## Field semantics
/// - `max_concurrency`: dispatcher worker threads (`0` = logical CPU count)
/// - `stop_on_fail`: latch the bus to "stop" on the first `TestFailed`
/// - `synchronous_message_reporting`: child waits for one ack line per message (0.3.0+ frameworks)
/// - `internal_diagnostic_messages`: report unparseable child output
/// - `diagnostic_messages`: forward diagnostic messages to the diagnostic sink
/// - `crash_grace`: how long a crash detector waits for a natural finish
/// - `process_shutdown_grace`: how long process disposal waits before a hard kill
/// - `response_file_threshold`: joined argument length above which a response file is used
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Maximum number of test cases executing at once.
    pub max_concurrency: usize,

    /// Stop scheduling new tests after the first failure.
    pub stop_on_fail: bool,

    /// Lockstep flow control with the child process (one ack per line).
    pub synchronous_message_reporting: bool,

    /// Emit internal diagnostics (e.g. unparseable child output).
    pub internal_diagnostic_messages: bool,

    /// Forward diagnostic messages to the diagnostic sink.
    pub diagnostic_messages: bool,

    /// Grace period for a finish bracket to arrive after the process exits.
    pub crash_grace: Duration,

    /// Grace period between a graceful stop request and forceful termination.
    pub process_shutdown_grace: Duration,

    /// Joined-argument length that triggers a response file.
    pub response_file_threshold: usize,
}

impl RunnerConfig {
    /// Returns the effective worker count (never zero).
    ///
    /// - `0` → [`std::thread::available_parallelism`] (falls back to 1)
    /// - `n` → `n`
    #[inline]
    pub fn concurrency_limit(&self) -> usize {
        match self.max_concurrency {
            0 => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            n => n,
        }
    }

    /// Parses a JSON runner configuration. Unknown keys are ignored and
    /// missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, RunnerError> {
        let raw: RawConfig = serde_json::from_str(json).map_err(|e| RunnerError::InvalidConfig {
            reason: e.to_string(),
        })?;
        raw.into_config()
    }

    /// Reads and parses a JSON runner configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| RunnerError::InvalidConfig {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }
}

impl Default for RunnerConfig {
    /// Default configuration:
    ///
    /// - `max_concurrency = 0` (logical CPU count)
    /// - `stop_on_fail = false`
    /// - `synchronous_message_reporting = false`
    /// - `internal_diagnostic_messages = false`
    /// - `diagnostic_messages = false`
    /// - `crash_grace = 5s`
    /// - `process_shutdown_grace = 15s`
    /// - `response_file_threshold = 8000`
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            stop_on_fail: false,
            synchronous_message_reporting: false,
            internal_diagnostic_messages: false,
            diagnostic_messages: false,
            crash_grace: Duration::from_secs(5),
            process_shutdown_grace: Duration::from_secs(15),
            response_file_threshold: 8000,
        }
    }
}

/// On-disk shape; every key optional.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
    max_parallel_threads: Option<i64>,
    stop_on_fail: Option<bool>,
    synchronous_message_reporting: Option<bool>,
    internal_diagnostic_messages: Option<bool>,
    diagnostic_messages: Option<bool>,
    crash_grace_ms: Option<u64>,
    process_shutdown_grace_ms: Option<u64>,
    response_file_threshold: Option<usize>,
}

impl RawConfig {
    fn into_config(self) -> Result<RunnerConfig, RunnerError> {
        let mut cfg = RunnerConfig::default();
        if let Some(n) = self.max_parallel_threads {
            cfg.max_concurrency = usize::try_from(n).map_err(|_| RunnerError::InvalidConfig {
                reason: format!("maxParallelThreads must be >= 0, got {n}"),
            })?;
        }
        if let Some(v) = self.stop_on_fail {
            cfg.stop_on_fail = v;
        }
        if let Some(v) = self.synchronous_message_reporting {
            cfg.synchronous_message_reporting = v;
        }
        if let Some(v) = self.internal_diagnostic_messages {
            cfg.internal_diagnostic_messages = v;
        }
        if let Some(v) = self.diagnostic_messages {
            cfg.diagnostic_messages = v;
        }
        if let Some(ms) = self.crash_grace_ms {
            cfg.crash_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.process_shutdown_grace_ms {
            cfg.process_shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(n) = self.response_file_threshold {
            cfg.response_file_threshold = n;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_concurrency_means_cpu_count() {
        let cfg = RunnerConfig::default();
        assert!(cfg.concurrency_limit() >= 1);

        let cfg = RunnerConfig {
            max_concurrency: 3,
            ..RunnerConfig::default()
        };
        assert_eq!(cfg.concurrency_limit(), 3);
    }

    #[test]
    fn json_overrides_only_present_keys() {
        let cfg = RunnerConfig::from_json_str(
            r#"{ "maxParallelThreads": 2, "stopOnFail": true, "crashGraceMs": 250, "unknown": 1 }"#,
        )
        .unwrap();
        assert_eq!(cfg.max_concurrency, 2);
        assert!(cfg.stop_on_fail);
        assert_eq!(cfg.crash_grace, Duration::from_millis(250));
        assert_eq!(cfg.process_shutdown_grace, Duration::from_secs(15));
        assert!(!cfg.synchronous_message_reporting);
    }

    #[test]
    fn negative_threads_rejected() {
        let err = RunnerConfig::from_json_str(r#"{ "maxParallelThreads": -1 }"#).unwrap_err();
        assert_eq!(err.as_label(), "runner_invalid_config");
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(RunnerConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        std::fs::write(&path, r#"{ "synchronousMessageReporting": true }"#).unwrap();
        let cfg = RunnerConfig::load(&path).unwrap();
        assert!(cfg.synchronous_message_reporting);
    }
}
