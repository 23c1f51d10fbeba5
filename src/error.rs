//! Error types used by the testvisor runtime and by test bodies.
//!
//! This module defines two main error enums:
//!
//! - [`RunnerError`]: errors raised by the execution scaffolding itself
//!   (double dispose, launch failure, malformed configuration).
//! - [`TestError`]: errors raised by an individual test body.
//!
//! Scaffolding errors are returned at the call site. Test errors never cross
//! the bus as `Err`: the runner turns them into `TestFailed`/`TestSkipped`
//! messages carrying [`ErrorMetadata`](crate::ErrorMetadata).

use thiserror::Error;

/// # Errors produced by the execution scaffolding.
///
/// These indicate a bug in pipeline orchestration or an environment that
/// cannot host the run; they are reported loudly and immediately.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RunnerError {
    /// A resource was used or disposed after it had already been disposed.
    #[error("{resource} has already been disposed")]
    AlreadyDisposed {
        /// Name of the disposed resource.
        resource: &'static str,
    },

    /// The external test process could not be started.
    #[error("could not launch test process '{executable}', arguments: '{}'", .arguments.join(" "))]
    LaunchFailed {
        /// Executable that was attempted.
        executable: String,
        /// Arguments that were attempted.
        arguments: Vec<String>,
    },

    /// Launch preconditions were not met (e.g. unknown target platform).
    #[error("test process launch not supported: {reason}")]
    LaunchUnsupported {
        /// Why the launcher declined.
        reason: String,
    },

    /// Runner configuration could not be read or is invalid.
    #[error("invalid runner configuration: {reason}")]
    InvalidConfig {
        /// Human-readable description.
        reason: String,
    },

    /// A serialized token could not be turned back into a value.
    #[error("deserialization failed: {reason}")]
    Deserialize {
        /// Human-readable description.
        reason: String,
    },

    /// A test-case orderer failed or returned an invalid ordering.
    #[error("test case ordering failed: {reason}")]
    OrderingFailed {
        /// Human-readable description.
        reason: String,
    },

    /// An extension could not be resolved from the registry.
    #[error("extension '{id}': {reason}")]
    Extension {
        /// Registration identifier.
        id: String,
        /// Why resolution failed.
        reason: String,
    },

    /// One or more tracked resources failed while being disposed.
    #[error("{} resource(s) failed to dispose: {}", .errors.len(), join_errors(.errors))]
    Disposal {
        /// Every cleanup failure, in the order it was encountered.
        errors: Vec<RunnerError>,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[RunnerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RunnerError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use testvisor::RunnerError;
    ///
    /// let err = RunnerError::AlreadyDisposed { resource: "MessageBus" };
    /// assert_eq!(err.as_label(), "runner_already_disposed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RunnerError::AlreadyDisposed { .. } => "runner_already_disposed",
            RunnerError::LaunchFailed { .. } => "runner_launch_failed",
            RunnerError::LaunchUnsupported { .. } => "runner_launch_unsupported",
            RunnerError::InvalidConfig { .. } => "runner_invalid_config",
            RunnerError::Deserialize { .. } => "runner_deserialize",
            RunnerError::OrderingFailed { .. } => "runner_ordering_failed",
            RunnerError::Extension { .. } => "runner_extension",
            RunnerError::Disposal { .. } => "runner_disposal",
            RunnerError::Io(_) => "runner_io",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }

    /// Collapses a list of cleanup failures: none is `Ok`, one is returned as-is,
    /// several become [`RunnerError::Disposal`].
    pub(crate) fn from_cleanup(mut errors: Vec<RunnerError>) -> Result<(), RunnerError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RunnerError::Disposal { errors }),
        }
    }
}

/// # Errors produced by a test body.
///
/// The runner maps these onto result messages:
/// `Failed`/`Panicked` → `TestFailed`, `Skipped` → `TestSkipped`,
/// `Canceled` → `TestNotRun`.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TestError {
    /// Assertion or ordinary failure inside the test.
    #[error("test failed: {message}")]
    Failed {
        /// Failure message.
        message: String,
    },

    /// The test body (or detached work it started) panicked.
    #[error("test panicked: {message}")]
    Panicked {
        /// Panic payload rendered as text.
        message: String,
    },

    /// The test asked to be skipped at runtime.
    #[error("test skipped: {reason}")]
    Skipped {
        /// Skip reason.
        reason: String,
    },

    /// The run was cancelled before the test could complete.
    #[error("test canceled")]
    Canceled,
}

impl TestError {
    /// Shorthand for [`TestError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        TestError::Failed {
            message: message.into(),
        }
    }

    /// Builds a [`TestError::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        TestError::Panicked {
            message: panic_message(payload),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use testvisor::TestError;
    ///
    /// assert_eq!(TestError::failed("boom").as_label(), "test_failed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TestError::Failed { .. } => "test_failed",
            TestError::Panicked { .. } => "test_panicked",
            TestError::Skipped { .. } => "test_skipped",
            TestError::Canceled => "test_canceled",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            TestError::Failed { message } => message.clone(),
            TestError::Panicked { message } => format!("panic: {message}"),
            TestError::Skipped { reason } => reason.clone(),
            TestError::Canceled => "canceled".to_string(),
        }
    }

    /// Name reported as the "exception type" in failure metadata.
    pub fn type_name(&self) -> &'static str {
        match self {
            TestError::Failed { .. } => "TestFailure",
            TestError::Panicked { .. } => "Panic",
            TestError::Skipped { .. } => "SkipRequested",
            TestError::Canceled => "Canceled",
        }
    }

    /// Whether this outcome counts as a failure in run totals.
    pub fn is_failure(&self) -> bool {
        matches!(self, TestError::Failed { .. } | TestError::Panicked { .. })
    }
}

/// Renders a panic payload (`&str` / `String` / other) as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_collapse() {
        assert!(RunnerError::from_cleanup(vec![]).is_ok());

        let single = RunnerError::from_cleanup(vec![RunnerError::AlreadyDisposed {
            resource: "a",
        }]);
        assert!(matches!(single, Err(RunnerError::AlreadyDisposed { .. })));

        let many = RunnerError::from_cleanup(vec![
            RunnerError::AlreadyDisposed { resource: "a" },
            RunnerError::InvalidConfig { reason: "b".into() },
        ]);
        match many {
            Err(RunnerError::Disposal { errors }) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn launch_failed_names_executable_and_arguments() {
        let err = RunnerError::LaunchFailed {
            executable: "/bin/tests".into(),
            arguments: vec!["-automated".into(), "-sync".into()],
        };
        let text = err.to_string();
        assert!(text.contains("/bin/tests"));
        assert!(text.contains("-automated -sync"));
    }

    #[test]
    fn panic_payloads_render() {
        let s: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn failure_classification() {
        assert!(TestError::failed("x").is_failure());
        assert!(TestError::Panicked { message: "x".into() }.is_failure());
        assert!(!TestError::Skipped { reason: "x".into() }.is_failure());
        assert!(!TestError::Canceled.is_failure());
    }
}
