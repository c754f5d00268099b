// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervision of a single test: timeouts, output capture, crash diagnostics and retries.
//!
//! The main structure in this module is [`Runner`]. Each call to [`Runner::run`] executes one
//! test, retrying it once (or rerunning its failing test functions) depending on the installed
//! [plugins](crate::plugins).

mod capture;
mod child;

pub use capture::{ExpectedLog, LogCaptureDir};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        #[path = "unix.rs"]
        mod unix;
        use unix as os;
    } else if #[cfg(windows)] {
        #[path = "windows.rs"]
        mod windows;
        use windows as os;
    } else {
        compile_error!("unsupported target platform");
    }
}

use crate::{
    helpers::{FormattedDuration, command_basename, plural, signal_str},
    plugins::{FlakyMode, PluginSet, reconcile_attempts, vanishing_failure},
    reporter::TestStatus,
    results,
    time::{StopwatchStart, stopwatch},
    transcript::TestSection,
};
use bytes::Bytes;
use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use child::{ChildExit, OutputSink};
use std::{fmt, io::Write as _, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// The default time between the graceful termination signal and the forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Environment variable holding the attempt number (1 for the first attempt, 2 for a retry).
pub const ATTEMPT_ENV: &str = "TESTSCHED_ATTEMPT";

/// Environment variable holding the name of the test being run.
pub const TEST_NAME_ENV: &str = "TESTSCHED_TEST_NAME";

/// Environment variable holding the capture directory, set only when capturing.
pub const LOG_DIR_ENV: &str = "TESTSCHED_LOG_DIR";

/// Environment variable holding the path of the attempt's XML results log, if it was told to write
/// one.
pub const RESULTS_PATH_ENV: &str = "TESTSCHED_RESULTS_PATH";

/// A command to run: program, arguments, working directory and extra environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandLine {
    /// The program to invoke.
    pub program: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// The working directory, or `None` to inherit the current one.
    pub cwd: Option<Utf8PathBuf>,

    /// Environment variables set in addition to the inherited environment.
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    /// Creates a new command line with no working directory or extra environment.
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Sets the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.push((key.into(), value.into()));
    }

    /// Returns the command line quoted for display.
    pub fn display(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(&self.args))
    }
}

/// How a test's output is handled.
#[derive(Clone, Debug, Default)]
pub enum OutputPolicy {
    /// Relay stdout and stderr live to the transcript.
    #[default]
    Relay,

    /// Write stdout and stderr into a log file in the capture directory instead of relaying them.
    Capture(Arc<LogCaptureDir>),

    /// Both relay and capture.
    Tee(Arc<LogCaptureDir>),
}

impl OutputPolicy {
    fn capture_dir(&self) -> Option<&LogCaptureDir> {
        match self {
            Self::Relay => None,
            Self::Capture(dir) | Self::Tee(dir) => Some(dir),
        }
    }

    fn relays(&self) -> bool {
        matches!(self, Self::Relay | Self::Tee(_))
    }
}

/// How an attempt ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttemptStatus {
    /// The process exited normally.
    Exited {
        /// The exit code.
        code: i32,
    },

    /// The process was killed by a signal.
    Signaled {
        /// The signal number.
        signal: i32,

        /// Whether a core dump was produced.
        core_dumped: bool,
    },

    /// The process exceeded its timeout and was terminated.
    TimedOut {
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The attempt could not be started, for example because the command does not exist.
    SetupFailed {
        /// A description of the problem.
        message: String,
    },
}

impl AttemptStatus {
    /// Returns true if the process exited with code 0.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Signaled {
                signal,
                core_dumped,
            } => {
                match signal_str(*signal) {
                    Some(name) => write!(f, "killed by signal {signal} (SIG{name})")?,
                    None => write!(f, "killed by signal {signal}")?,
                }
                if *core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            }
            Self::TimedOut { timeout } => {
                let secs = timeout.as_secs();
                write!(f, "timed out after {secs} {}", plural::seconds_str(secs))
            }
            Self::SetupFailed { message } => write!(f, "{message}"),
        }
    }
}

/// Everything known about one attempt once it has finished.
#[derive(Clone, Debug)]
pub struct AttemptReport {
    /// The name of the test.
    pub name: String,

    /// The attempt number, starting at 1.
    pub attempt: u32,

    /// The test program, before any plugin wrapped it.
    pub program: String,

    /// The arguments the test was run with, after log arguments were rewritten.
    pub args: Vec<String>,

    /// The working directory of the test.
    pub cwd: Option<Utf8PathBuf>,

    /// The process ID, if the process was started.
    pub pid: Option<u32>,

    /// When the attempt started.
    pub start_time: DateTime<Local>,

    /// How long the attempt took.
    pub duration: Duration,

    /// How the attempt ended.
    pub status: AttemptStatus,

    /// Everything the test wrote to stdout.
    pub stdout: Bytes,

    /// Everything the test wrote to stderr.
    pub stderr: Bytes,

    /// The file that stdout and stderr were captured to, if any.
    pub capture_file: Option<Utf8PathBuf>,

    /// The log files the test was told to write.
    pub log_files: Vec<Utf8PathBuf>,

    /// Log files the test was told to write but left missing or empty.
    pub missing_logs: Vec<Utf8PathBuf>,
}

impl AttemptReport {
    /// Returns true if the attempt passed.
    ///
    /// An attempt that exited with code 0 but did not write its expected logs did not pass.
    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.missing_logs.is_empty()
    }

    /// Returns true if both attempts failed in the same way.
    pub fn same_failure(&self, other: &AttemptReport) -> bool {
        let self_badly_behaved = !self.missing_logs.is_empty();
        let other_badly_behaved = !other.missing_logs.is_empty();
        match (&self.status, &other.status) {
            (AttemptStatus::TimedOut { .. }, AttemptStatus::TimedOut { .. }) => true,
            (a, b) => a == b && self_badly_behaved == other_badly_behaved,
        }
    }

    /// Describes why the attempt failed, or how it exited if it passed.
    pub fn description(&self) -> String {
        if self.status.is_success() && !self.missing_logs.is_empty() {
            format!("badly behaved: {}", missing_logs_message(&self.missing_logs))
        } else {
            self.status.to_string()
        }
    }
}

fn missing_logs_message(missing: &[Utf8PathBuf]) -> String {
    let files: Vec<_> = missing.iter().map(|path| format!("`{path}`")).collect();
    format!(
        "test did not write its log {} {}",
        if missing.len() == 1 { "file" } else { "files" },
        files.join(", ")
    )
}

/// A request to run one test.
#[derive(Clone, Debug)]
pub struct RunRequest {
    /// The name of the test.
    pub name: String,

    /// The command to run.
    pub command: CommandLine,

    /// The timeout for each attempt.
    pub timeout: Duration,

    /// Whether failures of this test are insignificant.
    pub insignificant: bool,
}

/// The Runner's verdict for a test, after all attempts.
#[derive(Clone, Debug)]
pub struct RunVerdict {
    /// The final status.
    pub status: TestStatus,

    /// Every attempt that was made, in order.
    pub attempts: Vec<AttemptReport>,

    /// An explanation of how a retry was interpreted, if one happened.
    pub note: Option<String>,
}

impl RunVerdict {
    /// Returns the total time spent across all attempts.
    pub fn duration(&self) -> Duration {
        self.attempts.iter().map(|attempt| attempt.duration).sum()
    }

    /// Returns the failure descriptions of all failing attempts.
    pub fn failure_reasons(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter(|attempt| !attempt.is_success())
            .map(AttemptReport::description)
            .collect()
    }
}

/// Builder for [`Runner`].
#[derive(Clone, Debug)]
pub struct RunnerBuilder {
    grace_period: Duration,
    output: OutputPolicy,
    plugins: PluginSet,
    diagnostics: bool,
}

impl Default for RunnerBuilder {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            output: OutputPolicy::Relay,
            plugins: PluginSet::default(),
            diagnostics: true,
        }
    }
}

impl RunnerBuilder {
    /// Sets the time between the graceful termination signal and the forced kill.
    pub fn set_grace_period(&mut self, grace_period: Duration) -> &mut Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets how test output is handled.
    pub fn set_output_policy(&mut self, output: OutputPolicy) -> &mut Self {
        self.output = output;
        self
    }

    /// Sets the plugins, in the order they are consulted.
    pub fn set_plugins(&mut self, plugins: PluginSet) -> &mut Self {
        self.plugins = plugins;
        self
    }

    /// Sets whether the runner writes its own diagnostic lines to the transcript.
    ///
    /// Test output is always written according to the output policy.
    pub fn set_diagnostics(&mut self, diagnostics: bool) -> &mut Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Creates a new runner.
    pub fn build(&self) -> Runner {
        Runner {
            grace_period: self.grace_period,
            output: self.output.clone(),
            plugins: self.plugins.clone(),
            diagnostics: self.diagnostics,
        }
    }
}

/// Supervises single tests.
#[derive(Clone, Debug)]
pub struct Runner {
    grace_period: Duration,
    output: OutputPolicy,
    plugins: PluginSet,
    diagnostics: bool,
}

impl Runner {
    /// Returns the plugins installed in this runner.
    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    /// Returns the retry mode, if a plugin enables retries.
    pub fn flaky_mode(&self) -> Option<FlakyMode> {
        self.plugins.retry_policy()
    }

    /// Runs a test, retrying once if a plugin asks for it, and returns the verdict.
    pub async fn run(&self, request: &RunRequest, section: &mut TestSection) -> RunVerdict {
        let first = self.run_attempt(request, 1, section).await;
        let retry_mode = self.flaky_mode();

        let (status, attempts, note) = match retry_mode {
            Some(mode) if !first.is_success() => {
                let functions = self.failing_functions(&first);
                if functions.is_empty() {
                    if self.diagnostics {
                        section.line(&format!("{}: retrying after failed attempt", request.name));
                    }
                    let second = self.run_attempt(request, 2, section).await;
                    let reconciled = reconcile_attempts(mode, &first, Some(&second));
                    (reconciled.status, vec![first, second], reconciled.note)
                } else {
                    self.rerun_functions(request, mode, first, &functions, section)
                        .await
                }
            }
            _ => {
                let reconciled = reconcile_attempts(FlakyMode::default(), &first, None);
                (reconciled.status, vec![first], reconciled.note)
            }
        };

        let status = if request.insignificant && status.is_failure() {
            TestStatus::InsignificantFail
        } else {
            status
        };

        if self.diagnostics {
            if let Some(note) = &note {
                section.line(&format!("{}: {note}", request.name));
            }
        }

        RunVerdict {
            status,
            attempts,
            note,
        }
    }

    /// Returns the failing test functions named in the XML results of a failed attempt, if
    /// function reruns are enabled.
    fn failing_functions(&self, first: &AttemptReport) -> Vec<String> {
        if self.plugins.function_repetitions() == 0 {
            return Vec::new();
        }
        first
            .log_files
            .iter()
            .filter(|path| path.extension() == Some("xml") && !first.missing_logs.contains(*path))
            .find_map(|path| match results::failing_functions_in(path) {
                Ok(functions) if !functions.is_empty() => Some(functions),
                Ok(_) => None,
                Err(error) => {
                    debug!("[{}] ignoring results log `{path}`: {error}", first.name);
                    None
                }
            })
            .unwrap_or_default()
    }

    /// Reruns each failing test function on its own, instead of retrying the whole test.
    ///
    /// The test counts as flaky if every rerun passes, and as failed at the first rerun that does
    /// not.
    async fn rerun_functions(
        &self,
        request: &RunRequest,
        mode: FlakyMode,
        first: AttemptReport,
        functions: &[String],
        section: &mut TestSection,
    ) -> (TestStatus, Vec<AttemptReport>, Option<String>) {
        let repetitions = self.plugins.function_repetitions();
        if self.diagnostics {
            section.line(&format!(
                "{}: rerunning failing {} {} ({repetitions} {} each)",
                request.name,
                if functions.len() == 1 { "function" } else { "functions" },
                functions.join(", "),
                if repetitions == 1 { "time" } else { "times" },
            ));
        }

        let base_args = capture::strip_log_args(&request.command.args);
        let mut attempts = vec![first];
        for function in functions {
            let mut rerun = request.clone();
            rerun.command.args = base_args.clone();
            rerun.command.args.push(function.clone());
            for _ in 0..repetitions {
                let attempt = self.run_attempt(&rerun, 2, section).await;
                if !attempt.is_success() {
                    let note = format!(
                        "failure confirmed reproducible in {function}: {}",
                        attempt.description()
                    );
                    attempts.push(attempt);
                    return (TestStatus::Fail, attempts, Some(note));
                }
                attempts.push(attempt);
            }
        }

        let note = format!(
            "flaky (failing functions passed on rerun: {}), mode {mode} applied",
            functions.join(", ")
        );
        (vanishing_failure(mode), attempts, Some(note))
    }

    async fn run_attempt(
        &self,
        request: &RunRequest,
        attempt: u32,
        section: &mut TestSection,
    ) -> AttemptReport {
        let watch = stopwatch();
        let mut command = request.command.clone();
        let program = command.program.clone();
        let basename = command_basename(&program).to_owned();

        let mut report = AttemptReport {
            name: request.name.clone(),
            attempt,
            program: program.clone(),
            args: command.args.clone(),
            cwd: command.cwd.clone(),
            pid: None,
            start_time: watch.start_time(),
            duration: Duration::ZERO,
            status: AttemptStatus::Exited { code: 0 },
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            capture_file: None,
            log_files: Vec::new(),
            missing_logs: Vec::new(),
        };

        let mut expected_logs = Vec::new();
        if let Some(capture) = self.output.capture_dir() {
            let prepared = capture::rewrite_log_args(&command.args, &basename, capture).and_then(
                |rewritten| {
                    let capture_file = if rewritten.expected_logs.is_empty()
                        || rewritten.has_stdout_log
                    {
                        Some(capture.allocate(&basename, None, "txt")?)
                    } else {
                        None
                    };
                    Ok((rewritten, capture_file))
                },
            );
            match prepared {
                Ok((rewritten, capture_file)) => {
                    command.args = rewritten.args;
                    report.args = command.args.clone();
                    report.log_files = rewritten
                        .expected_logs
                        .iter()
                        .map(|log| log.path.clone())
                        .collect();
                    report.capture_file = capture_file;
                    expected_logs = rewritten.expected_logs;
                }
                Err(error) => {
                    report.status = AttemptStatus::SetupFailed {
                        message: format!(
                            "cannot create log file in `{}`: {error}",
                            capture.path()
                        ),
                    };
                    return self.finish_attempt(report, watch, section);
                }
            }
            command.set_env(LOG_DIR_ENV, capture.path().as_str());
            if let Some(xml) = expected_logs
                .iter()
                .find(|log| log.path.extension() == Some("xml"))
            {
                command.set_env(RESULTS_PATH_ENV, xml.path.as_str());
            }
        }

        for plugin in self.plugins.iter() {
            plugin.wrap_command(&mut command);
        }
        command.set_env(ATTEMPT_ENV, attempt.to_string());
        command.set_env(TEST_NAME_ENV, request.name.clone());
        debug!("[{}] attempt {attempt}: {}", request.name, command.display());

        let capture_file = match &report.capture_file {
            Some(path) => match tokio::fs::OpenOptions::new().append(true).open(path).await {
                Ok(file) => Some((path.clone(), file)),
                Err(error) => {
                    warn!("failed to open capture file `{path}`: {error}");
                    None
                }
            },
            None => None,
        };

        let mut spawned = match child::spawn(&command) {
            Ok(spawned) => spawned,
            Err(error) => {
                report.status = AttemptStatus::SetupFailed {
                    message: if error.kind() == std::io::ErrorKind::NotFound {
                        format!("command not found: {}", command.program)
                    } else {
                        format!("could not start {}: {error}", command.program)
                    },
                };
                return self.finish_attempt(report, watch, section);
            }
        };
        report.pid = spawned.child.id();

        let mut sink = OutputSink::new(section, self.output.relays(), capture_file);
        let exit = child::supervise(
            &mut spawned.child,
            &mut spawned.pipes,
            &mut sink,
            request.timeout,
            self.grace_period,
        )
        .await;

        report.status = match exit {
            Ok(ChildExit::Exited(status)) => os::attempt_status(status),
            Ok(ChildExit::TimedOut) => AttemptStatus::TimedOut {
                timeout: request.timeout,
            },
            Err(error) => AttemptStatus::SetupFailed {
                message: format!("failed to wait for {}: {error}", command.program),
            },
        };

        let missing = capture::missing_logs(&expected_logs);
        if !missing.is_empty() {
            let missing_paths: Vec<_> = missing.iter().map(|log| log.path.clone()).collect();
            let diagnostic = format!(
                "{}: badly behaved: {}; it {}",
                request.name,
                missing_logs_message(&missing_paths),
                report.status
            );
            for log in &missing {
                write_badly_behaved_log(&log.path, &diagnostic, sink.stdout(), sink.stderr());
            }
            report.missing_logs = missing_paths;
        } else if report.capture_file.is_none()
            && (!sink.stdout().is_empty() || !sink.stderr().is_empty())
        {
            // Only file logs were requested, but the test wrote to its own streams as well.
            if let Some(capture) = self.output.capture_dir() {
                report.capture_file =
                    write_stray_output(capture, &basename, sink.stdout(), sink.stderr());
            }
        }

        let lines = self.after_attempt_lines(&report).await;
        sink.capture_lines(&lines).await;
        if self.diagnostics {
            for line in &lines {
                sink.section().line(line);
            }
        }

        let (stdout, stderr) = sink.finish().await;
        report.stdout = stdout;
        report.stderr = stderr;
        self.finish_attempt(report, watch, section)
    }

    async fn after_attempt_lines(&self, report: &AttemptReport) -> Vec<String> {
        let mut lines = Vec::new();
        for plugin in self.plugins.iter() {
            lines.extend(plugin.after_attempt(report).await);
        }
        lines
    }

    fn finish_attempt(
        &self,
        mut report: AttemptReport,
        watch: StopwatchStart,
        section: &mut TestSection,
    ) -> AttemptReport {
        report.duration = watch.snapshot().duration;
        if self.diagnostics && !report.is_success() {
            section.line(&format!(
                "{}: {} [{}]",
                report.name,
                report.description(),
                FormattedDuration(report.duration)
            ));
        }
        report
    }
}

/// Writes the badly-behaved diagnostic, followed by the test's raw output, into a log file the test
/// should have written.
fn write_badly_behaved_log(path: &Utf8PathBuf, diagnostic: &str, stdout: &[u8], stderr: &[u8]) {
    let res = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            writeln!(file, "{diagnostic}")?;
            writeln!(file, "--- stdout ---")?;
            file.write_all(stdout)?;
            writeln!(file, "--- stderr ---")?;
            file.write_all(stderr)
        });
    if let Err(error) = res {
        warn!("failed to write diagnostics to `{path}`: {error}");
    }
}

/// Saves output a test wrote next to its file logs into a fresh `<basename>-NN.txt`.
fn write_stray_output(
    capture: &LogCaptureDir,
    basename: &str,
    stdout: &[u8],
    stderr: &[u8],
) -> Option<Utf8PathBuf> {
    let res = capture.allocate(basename, None, "txt").and_then(|path| {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(stdout)?;
        file.write_all(stderr)?;
        Ok(path)
    });
    match res {
        Ok(path) => Some(path),
        Err(error) => {
            warn!("failed to save output of {basename} in `{}`: {error}", capture.path());
            None
        }
    }
}
