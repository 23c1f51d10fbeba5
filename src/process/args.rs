//! # Command-line arguments for the test process.
//!
//! Builds the switch list handed to a test process and spills it into a
//! response file when it gets too long for a command line.
//!
//! ```text
//! [config]? -automated [-sync] [-diagnostics] [-internalDiagnostics]   -sync: 0.3.0+
//!           [-maxThreads N] [-stopOnFail] (-run <token>)*      ← run
//!           -list discovery                                    ← find
//!
//! too long?  ──► ResponseFile (one argument per line) ──► "@@/tmp/.tmpXXXX"
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use super::launcher::TestAssembly;
use crate::cases::TestCaseDescriptor;
use crate::config::RunnerConfig;
use crate::error::RunnerError;

/// Prefix of the argument that points at a response file.
pub const RESPONSE_FILE_PREFIX: &str = "@@";

/// Arguments for running `cases` (all cases when empty).
pub fn arguments_for_run(
    assembly: &TestAssembly,
    cases: &[TestCaseDescriptor],
    config: &RunnerConfig,
) -> Vec<String> {
    let mut args = common(assembly, config);
    if config.max_concurrency > 0 {
        args.extend(["-maxThreads".to_string(), config.max_concurrency.to_string()]);
    }
    if config.stop_on_fail {
        args.push("-stopOnFail".into());
    }
    for case in cases {
        args.extend(["-run".to_string(), case.serialize()]);
    }
    args
}

/// Arguments for discovering the cases of `assembly`.
pub fn arguments_for_discovery(assembly: &TestAssembly, config: &RunnerConfig) -> Vec<String> {
    let mut args = common(assembly, config);
    args.extend(["-list".to_string(), "discovery".to_string()]);
    args
}

fn common(assembly: &TestAssembly, config: &RunnerConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(config_path) = &assembly.config_path {
        args.push(config_path.clone());
    }
    args.push("-automated".into());
    if config.synchronous_message_reporting && assembly.supports_synchronous_reporting() {
        args.push("-sync".into());
    }
    if config.diagnostic_messages {
        args.push("-diagnostics".into());
    }
    if config.internal_diagnostic_messages {
        args.push("-internalDiagnostics".into());
    }
    args
}

/// Temporary file holding one argument per line; deleted on drop or [`close`](Self::close).
#[derive(Debug)]
pub struct ResponseFile {
    path: TempPath,
}

impl ResponseFile {
    /// Writes `arguments` to a fresh temp file.
    pub fn write(arguments: &[String]) -> Result<Self, RunnerError> {
        let mut file = tempfile::Builder::new()
            .prefix("testvisor-")
            .suffix(".rsp")
            .tempfile()?;
        for arg in arguments {
            writeln!(file, "{arg}")?;
        }
        file.flush()?;
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `@@<path>` token that refers to this file.
    pub fn argument(&self) -> String {
        format!("{RESPONSE_FILE_PREFIX}{}", self.path.display())
    }

    /// Deletes the file now.
    pub fn close(self) -> Result<(), RunnerError> {
        self.path.close().map_err(RunnerError::from)
    }
}

/// Replaces `arguments` with a response-file reference when their joined
/// length exceeds `threshold` characters.
pub fn spill_arguments(
    arguments: Vec<String>,
    threshold: usize,
) -> Result<(Vec<String>, Option<ResponseFile>), RunnerError> {
    let joined = arguments.iter().map(|a| a.len() + 1).sum::<usize>();
    if arguments.is_empty() || joined <= threshold {
        return Ok((arguments, None));
    }
    let file = ResponseFile::write(&arguments)?;
    Ok((vec![file.argument()], Some(file)))
}

/// Expands `@@<path>` tokens into the lines of the referenced file.
///
/// Used by test processes to read back what [`spill_arguments`] wrote.
pub fn expand_response_files<I>(arguments: I) -> Result<Vec<String>, RunnerError>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    for arg in arguments {
        match arg.strip_prefix(RESPONSE_FILE_PREFIX) {
            Some(path) => {
                let content = std::fs::read_to_string(PathBuf::from(path))?;
                out.extend(content.lines().map(str::to_owned));
            }
            None => out.push(arg),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::FrameworkVersion;

    fn assembly() -> TestAssembly {
        TestAssembly::new("/bin/tests", "/t/app").with_config_path("/t/app.json")
    }

    #[test]
    fn run_arguments_carry_switches_and_cases() {
        let config = RunnerConfig {
            synchronous_message_reporting: true,
            stop_on_fail: true,
            max_concurrency: 4,
            ..RunnerConfig::default()
        };
        let case = TestCaseDescriptor::new("c1", "one");
        let args = arguments_for_run(&assembly(), std::slice::from_ref(&case), &config);

        assert_eq!(args[0], "/t/app.json");
        assert_eq!(args[1], "-automated");
        assert!(args.contains(&"-sync".to_string()));
        assert!(args.contains(&"-stopOnFail".to_string()));
        let run = args.iter().position(|a| a == "-run").unwrap();
        assert_eq!(args[run + 1], case.serialize());
        let threads = args.iter().position(|a| a == "-maxThreads").unwrap();
        assert_eq!(args[threads + 1], "4");
    }

    #[test]
    fn sync_switch_requires_a_framework_that_reads_acks() {
        let config = RunnerConfig {
            synchronous_message_reporting: true,
            ..RunnerConfig::default()
        };
        let at = |major, minor, patch| {
            TestAssembly::new("x", "y")
                .with_framework_version(FrameworkVersion::new(major, minor, patch))
        };

        let old = arguments_for_discovery(&at(0, 2, 999), &config);
        assert_eq!(old, vec!["-automated", "-list", "discovery"]);

        let new = arguments_for_discovery(&at(0, 3, 0), &config);
        assert_eq!(new, vec!["-automated", "-sync", "-list", "discovery"]);

        let unknown = arguments_for_run(&TestAssembly::new("x", "y"), &[], &config);
        assert!(unknown.contains(&"-sync".to_string()));
    }

    #[test]
    fn discovery_arguments_without_optional_switches() {
        let args = arguments_for_discovery(&TestAssembly::new("x", "y"), &RunnerConfig::default());
        assert_eq!(args, vec!["-automated", "-list", "discovery"]);
    }

    #[test]
    fn long_lists_spill_to_a_response_file_and_expand_back() {
        let args: Vec<String> = (0..50).map(|i| format!("-run token-{i}")).collect();
        let (spilled, file) = spill_arguments(args.clone(), 100).unwrap();
        let file = file.unwrap();

        assert_eq!(spilled, vec![file.argument()]);
        assert!(spilled[0].starts_with("@@"));
        assert_eq!(expand_response_files(spilled).unwrap(), args);

        let path = file.path().to_path_buf();
        file.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn empty_arguments_survive_a_response_file() {
        let args = vec!["-culture".to_string(), String::new(), "-automated".to_string()];
        let (spilled, file) = spill_arguments(args.clone(), 1).unwrap();
        assert!(file.is_some());
        assert_eq!(expand_response_files(spilled).unwrap(), args);
    }

    #[test]
    fn short_lists_stay_inline() {
        let args = vec!["-automated".to_string()];
        let (inline, file) = spill_arguments(args.clone(), 8000).unwrap();
        assert_eq!(inline, args);
        assert!(file.is_none());
    }
}
