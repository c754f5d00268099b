// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::RunnerPlugin;
use crate::{
    helpers::command_basename,
    runner::{AttemptReport, AttemptStatus},
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{BoxFuture, FutureExt};
use std::{process::Stdio, time::Duration};
use tracing::debug;

/// How often the crash report directory is rescanned while waiting for a report.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Retrieves a backtrace or crash report after an attempt dies from a fatal signal.
///
/// On Linux, a core file left in the test's working directory is handed to the debugger. On macOS,
/// the user's diagnostic reports directory is searched for a report newer than the attempt. Failing
/// to find anything is reported as a single line and is never an error.
#[derive(Clone, Debug)]
pub struct CrashPlugin {
    debugger: Option<String>,
    crash_report_dir: Option<Utf8PathBuf>,
    poll_timeout: Duration,
}

impl CrashPlugin {
    /// Creates a crash plugin with the defaults for the current platform.
    pub fn new() -> Self {
        let debugger = cfg!(target_os = "linux").then(|| "gdb".to_owned());
        let crash_report_dir = if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|home| Utf8PathBuf::from(home).join("Library/Logs/DiagnosticReports"))
        } else {
            None
        };
        Self {
            debugger,
            crash_report_dir,
            poll_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the debugger used on core files, or disables core file inspection.
    pub fn with_debugger(mut self, debugger: Option<String>) -> Self {
        self.debugger = debugger;
        self
    }

    /// Sets the directory searched for crash reports.
    pub fn with_crash_report_dir(
        mut self,
        dir: Option<Utf8PathBuf>,
        poll_timeout: Duration,
    ) -> Self {
        self.crash_report_dir = dir;
        self.poll_timeout = poll_timeout;
        self
    }

    async fn diagnose(&self, report: &AttemptReport) -> Vec<String> {
        let AttemptStatus::Signaled { core_dumped, .. } = report.status else {
            return Vec::new();
        };
        let pid = report.pid.unwrap_or_default();

        if core_dumped {
            if let Some(lines) = self.backtrace_from_core(report, pid).await {
                return lines;
            }
        }
        if let Some(dir) = &self.crash_report_dir {
            if let Some(lines) = self.find_crash_report(dir, report, pid).await {
                return lines;
            }
        }

        vec![format!(
            "could not find a crash report for {} (pid {pid})",
            report.name
        )]
    }

    async fn backtrace_from_core(&self, report: &AttemptReport, pid: u32) -> Option<Vec<String>> {
        let debugger = self.debugger.as_deref()?;
        let cwd = report.cwd.clone().unwrap_or_else(|| Utf8PathBuf::from("."));
        let core = [format!("core.{pid}"), "core".to_owned()]
            .into_iter()
            .map(|name| cwd.join(name))
            .find(|path| path.is_file())?;
        let exe = resolve_program(&cwd, &report.program);

        let output = tokio::process::Command::new(debugger)
            .args(["-batch", "-ex", "bt"])
            .arg(exe.as_str())
            .arg(core.as_str())
            .stdin(Stdio::null())
            .output()
            .await;
        let output = match output {
            Ok(output) => output,
            Err(error) => {
                debug!("failed to run `{debugger}` on `{core}`: {error}");
                return None;
            }
        };

        let mut lines = vec![format!(
            "backtrace for {} (pid {pid}) from `{core}`:",
            report.name
        )];
        lines.extend(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_owned),
        );
        Some(lines)
    }

    async fn find_crash_report(
        &self,
        dir: &Utf8Path,
        report: &AttemptReport,
        pid: u32,
    ) -> Option<Vec<String>> {
        let prefix = format!("{}_", command_basename(&report.program));
        let started: std::time::SystemTime = report.start_time.into();
        let deadline = tokio::time::Instant::now() + self.poll_timeout;

        loop {
            if let Some(path) = newest_report(dir, &prefix, started) {
                let contents = match tokio::fs::read_to_string(&path).await {
                    Ok(contents) => contents,
                    Err(error) => {
                        debug!("failed to read crash report `{path}`: {error}");
                        return None;
                    }
                };
                let mut lines = vec![format!(
                    "crash report for {} (pid {pid}) from `{path}`:",
                    report.name
                )];
                lines.extend(contents.lines().map(str::to_owned));
                return Some(lines);
            }

            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Default for CrashPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerPlugin for CrashPlugin {
    fn name(&self) -> &'static str {
        "crash"
    }

    fn after_attempt<'a>(&'a self, report: &'a AttemptReport) -> BoxFuture<'a, Vec<String>> {
        self.diagnose(report).boxed()
    }
}

fn resolve_program(cwd: &Utf8Path, program: &str) -> Utf8PathBuf {
    let program = Utf8Path::new(program);
    if program.is_absolute() || program.components().count() == 1 {
        program.to_owned()
    } else {
        cwd.join(program)
    }
}

/// Returns the most recently modified `<prefix>*.crash` or `<prefix>*.ips` file modified no
/// earlier than `started`.
fn newest_report(dir: &Utf8Path, prefix: &str, started: std::time::SystemTime) -> Option<Utf8PathBuf> {
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(error) => {
            debug!("failed to read crash report directory `{dir}`: {error}");
            return None;
        }
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            name.starts_with(prefix) && (name.ends_with(".crash") || name.ends_with(".ips"))
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            (modified >= started).then(|| (modified, entry.path().to_owned()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}
