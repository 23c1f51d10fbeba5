//! # Test process handles and launching.
//!
//! [`TestProcess`] is everything the protocol needs from a running test
//! process: its output, its input, whether it exited, and a way to stop it.
//! [`LocalProcessLauncher`] starts real child processes through
//! `tokio::process`.
//!
//! ## Cancellation severities
//! ```text
//! cancel(false)  graceful: one SIGINT (unix); later graceful calls are no-ops
//! cancel(true)   forceful: kill
//! dispose(grace) wait up to `grace` for exit ──► kill if still running ──► delete response file
//! ```

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use super::args::{ResponseFile, spill_arguments};
use crate::error::RunnerError;

/// Boxed child output stream.
pub type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed child input stream.
pub type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

const EXIT_POLL: Duration = Duration::from_millis(25);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// A launched test process.
#[async_trait]
pub trait TestProcess: Send + Sync {
    /// Whether the process has exited.
    fn has_exited(&self) -> bool;

    /// Takes the standard output stream; `None` after the first call.
    fn take_stdout(&self) -> Option<ProcessReader>;

    /// Takes the standard input stream; `None` after the first call.
    fn take_stdin(&self) -> Option<ProcessWriter>;

    /// Requests termination. Graceful requests are idempotent.
    fn cancel(&self, force: bool);

    /// Exit code once exited. Signal deaths report `128 + signal` on unix.
    fn exit_code(&self) -> Option<i32>;

    /// Waits up to `grace` for exit, then kills, then releases resources.
    ///
    /// Calling it twice is an error.
    async fn dispose(&self, grace: Duration) -> Result<(), RunnerError>;
}

/// Starts test processes.
pub trait TestProcessLauncher: Send + Sync {
    /// Starts `assembly` with `arguments`.
    ///
    /// Fails with [`RunnerError::LaunchUnsupported`] when preconditions are not
    /// met and [`RunnerError::LaunchFailed`] when the process cannot start.
    fn launch(
        &self,
        assembly: &TestAssembly,
        arguments: Vec<String>,
    ) -> Result<Arc<dyn TestProcess>, RunnerError>;
}

/// Version of the test framework linked into a test process.
///
/// Gates protocol capabilities the child may not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameworkVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl FrameworkVersion {
    /// First version whose test processes read acknowledgement lines.
    pub const SYNCHRONOUS_REPORTING: FrameworkVersion = FrameworkVersion::new(0, 3, 0);

    /// Creates a version.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether a process of this version understands `-sync` and acks.
    pub fn supports_synchronous_reporting(self) -> bool {
        self >= Self::SYNCHRONOUS_REPORTING
    }
}

impl std::fmt::Display for FrameworkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAssembly {
    /// Program to execute.
    pub executable: PathBuf,
    /// Arguments placed before the generated ones (e.g. a host's script path).
    pub leading_arguments: Vec<String>,
    /// Path of the test assembly; used for crash reports.
    pub assembly_path: String,
    /// Optional configuration file passed as the first generated argument.
    pub config_path: Option<String>,
    /// Target OS; `None` means "this machine".
    pub target_platform: Option<String>,
    /// Working directory of the child.
    pub working_dir: Option<PathBuf>,
    /// Framework version of the child; `None` means "current".
    pub framework_version: Option<FrameworkVersion>,
}

impl TestAssembly {
    /// Assembly run directly by `executable`.
    pub fn new(executable: impl Into<PathBuf>, assembly_path: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            leading_arguments: Vec::new(),
            assembly_path: assembly_path.into(),
            config_path: None,
            target_platform: None,
            working_dir: None,
            framework_version: None,
        }
    }

    /// Sets the configuration file.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Sets arguments placed before the generated ones.
    #[must_use]
    pub fn with_leading_arguments<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_arguments = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the target OS (compared with `std::env::consts::OS`).
    #[must_use]
    pub fn with_target_platform(mut self, os: impl Into<String>) -> Self {
        self.target_platform = Some(os.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the framework version the child was built against.
    #[must_use]
    pub fn with_framework_version(mut self, version: FrameworkVersion) -> Self {
        self.framework_version = Some(version);
        self
    }

    /// Whether the child can take part in synchronous reporting.
    pub fn supports_synchronous_reporting(&self) -> bool {
        self.framework_version
            .is_none_or(FrameworkVersion::supports_synchronous_reporting)
    }
}

/// Launches local child processes with piped stdin/stdout.
#[derive(Debug, Clone)]
pub struct LocalProcessLauncher {
    response_file_threshold: usize,
}

impl Default for LocalProcessLauncher {
    fn default() -> Self {
        Self::new(8000)
    }
}

impl LocalProcessLauncher {
    /// Launcher that spills argument lists longer than `response_file_threshold`.
    pub fn new(response_file_threshold: usize) -> Self {
        Self {
            response_file_threshold,
        }
    }
}

impl TestProcessLauncher for LocalProcessLauncher {
    fn launch(
        &self,
        assembly: &TestAssembly,
        arguments: Vec<String>,
    ) -> Result<Arc<dyn TestProcess>, RunnerError> {
        if let Some(os) = &assembly.target_platform {
            if os != std::env::consts::OS {
                return Err(RunnerError::LaunchUnsupported {
                    reason: format!(
                        "assembly '{}' targets '{os}', this host is '{}'",
                        assembly.assembly_path,
                        std::env::consts::OS
                    ),
                });
            }
        }

        let (generated, response_file) = spill_arguments(arguments, self.response_file_threshold)?;
        let mut all_args = assembly.leading_arguments.clone();
        all_args.extend(generated);

        let mut cmd = Command::new(&assembly.executable);
        cmd.args(&all_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &assembly.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!(
                target: "testvisor::process",
                executable = %assembly.executable.display(),
                error = %e,
                "failed to spawn test process"
            );
            RunnerError::LaunchFailed {
                executable: assembly.executable.display().to_string(),
                arguments: all_args.clone(),
            }
        })?;

        tracing::debug!(
            target: "testvisor::process",
            executable = %assembly.executable.display(),
            pid = ?child.id(),
            response_file = response_file.is_some(),
            "test process started"
        );

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        Ok(Arc::new(LocalProcess {
            pid: child.id(),
            child: Mutex::new(child),
            status: Mutex::new(None),
            stdout: Mutex::new(stdout.map(|s| Box::new(s) as ProcessReader)),
            stdin: Mutex::new(stdin.map(|s| Box::new(s) as ProcessWriter)),
            graceful_sent: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            response_file: Mutex::new(response_file),
        }))
    }
}

/// Child process started by [`LocalProcessLauncher`].
pub struct LocalProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
    status: Mutex<Option<ExitStatus>>,
    stdout: Mutex<Option<ProcessReader>>,
    stdin: Mutex<Option<ProcessWriter>>,
    graceful_sent: AtomicBool,
    disposed: AtomicBool,
    response_file: Mutex<Option<ResponseFile>>,
}

impl LocalProcess {
    /// OS process id while running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn poll_status(&self) -> Option<ExitStatus> {
        let mut status = lock(&self.status);
        if status.is_none() {
            match lock(&self.child).try_wait() {
                Ok(found) => *status = found,
                Err(e) => {
                    tracing::warn!(target: "testvisor::process", error = %e, "failed to poll test process")
                }
            }
        }
        *status
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.poll_status().is_some() {
                return true;
            }
            if started.elapsed() >= limit {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    fn kill(&self) {
        if let Err(e) = lock(&self.child).start_kill() {
            tracing::debug!(target: "testvisor::process", error = %e, "kill failed; process probably exited");
        }
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match self.pid.and_then(|p| i32::try_from(p).ok()) {
            Some(pid) => {
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
                    tracing::debug!(target: "testvisor::process", pid, error = %e, "SIGINT failed");
                }
            }
            None => self.kill(),
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) {
        self.kill();
    }
}

#[async_trait]
impl TestProcess for LocalProcess {
    fn has_exited(&self) -> bool {
        self.poll_status().is_some()
    }

    fn take_stdout(&self) -> Option<ProcessReader> {
        lock(&self.stdout).take()
    }

    fn take_stdin(&self) -> Option<ProcessWriter> {
        lock(&self.stdin).take()
    }

    fn cancel(&self, force: bool) {
        if self.has_exited() {
            return;
        }
        if force {
            tracing::debug!(target: "testvisor::process", pid = ?self.pid, "killing test process");
            self.kill();
        } else if !self.graceful_sent.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "testvisor::process", pid = ?self.pid, "interrupting test process");
            self.interrupt();
        }
    }

    fn exit_code(&self) -> Option<i32> {
        let status = self.poll_status()?;
        status.code().or_else(|| signal_code(status))
    }

    async fn dispose(&self, grace: Duration) -> Result<(), RunnerError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(RunnerError::AlreadyDisposed {
                resource: "LocalProcess",
            });
        }
        lock(&self.stdin).take();

        if !self.wait_exit(grace).await {
            tracing::warn!(
                target: "testvisor::process",
                pid = ?self.pid,
                grace_ms = grace.as_millis() as u64,
                "test process did not exit within grace; killing"
            );
            self.kill();
            self.wait_exit(KILL_WAIT).await;
        }

        match lock(&self.response_file).take() {
            Some(file) => file.close(),
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
fn signal_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|s| 128 + s)
}

#[cfg(not(unix))]
fn signal_code(_status: ExitStatus) -> Option<i32> {
    None
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    fn sh(script: &str) -> TestAssembly {
        TestAssembly::new("sh", "/t/app").with_leading_arguments(["-c", script, "sh"])
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let process = LocalProcessLauncher::default()
            .launch(&sh("echo hello; exit 3"), vec!["-automated".into()])
            .unwrap();
        let mut out = String::new();
        process
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
        assert!(process.take_stdout().is_none());

        process.dispose(Duration::from_secs(5)).await.unwrap();
        assert!(process.has_exited());
        assert_eq!(process.exit_code(), Some(3));
        assert!(process.dispose(Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn graceful_cancel_interrupts_once() {
        let process = LocalProcessLauncher::default()
            .launch(&sh("exec sleep 30"), Vec::new())
            .unwrap();
        process.cancel(false);
        process.cancel(false);
        process.dispose(Duration::from_secs(5)).await.unwrap();
        assert_eq!(process.exit_code(), Some(128 + 2));
    }

    #[tokio::test]
    async fn dispose_kills_after_grace() {
        let process = LocalProcessLauncher::default()
            .launch(&sh("trap '' INT; echo ready; exec sleep 30"), Vec::new())
            .unwrap();
        let mut stdout = BufReader::new(process.take_stdout().unwrap());
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        assert_eq!(line, "ready\n");

        // SIGINT is ignored from here on, so only the kill ends the child.
        process.cancel(false);
        process.dispose(Duration::from_millis(100)).await.unwrap();
        assert!(process.has_exited());
        assert_eq!(process.exit_code(), Some(128 + 9));
    }

    #[test]
    fn missing_executable_fails_loudly() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let err = LocalProcessLauncher::default()
            .launch(
                &TestAssembly::new("/definitely/not/here", "/t/app"),
                vec!["-automated".into()],
            )
            .err()
            .unwrap();
        assert_eq!(err.as_label(), "runner_launch_failed");
        assert!(err.to_string().contains("/definitely/not/here"));
    }

    #[test]
    fn foreign_platform_is_unsupported() {
        let err = LocalProcessLauncher::default()
            .launch(
                &TestAssembly::new("sh", "/t/app").with_target_platform("plan9"),
                Vec::new(),
            )
            .err()
            .unwrap();
        assert_eq!(err.as_label(), "runner_launch_unsupported");
    }

    #[tokio::test]
    async fn long_argument_lists_use_a_response_file() {
        let args: Vec<String> = (0..40).map(|i| format!("arg-{i}")).collect();
        let process = LocalProcessLauncher::new(16)
            .launch(&sh("cat \"${1#@@}\""), args.clone())
            .unwrap();
        let mut out = String::new();
        process
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out.lines().collect::<Vec<_>>(), args);
        process.dispose(Duration::from_secs(5)).await.unwrap();
    }
}
