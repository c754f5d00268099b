// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Log capture: race-free allocation of log file names, and rewriting of test log arguments.

use crate::errors::CaptureDirError;
use camino::{Utf8Path, Utf8PathBuf};
use std::{fs::OpenOptions, io};
use tracing::debug;

/// The highest sequence number tried before giving up on a `(basename, label)` pair.
const MAX_SEQUENCE: u32 = 9999;

/// A directory that log files are captured into.
///
/// Concurrent attempts share a single `LogCaptureDir` (typically behind an `Arc`). Names are
/// allocated by creating the file with `create_new`, so two allocations never hand out the same
/// path, even across processes.
#[derive(Clone, Debug)]
pub struct LogCaptureDir {
    dir: Utf8PathBuf,
}

impl LogCaptureDir {
    /// Creates the capture directory (and its parents) if necessary.
    pub fn create(dir: impl Into<Utf8PathBuf>) -> Result<Self, CaptureDirError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|err| CaptureDirError::new(dir.clone(), err))?;
        Ok(Self { dir })
    }

    /// Returns the path to the capture directory.
    pub fn path(&self) -> &Utf8Path {
        &self.dir
    }

    /// Reserves the next free log name for `basename` (and `label`, if any), with extension
    /// `ext`.
    ///
    /// Names have the form `<basename>-NN.<ext>` or `<basename>-<label>-NN.<ext>`, where `NN` is
    /// the smallest unused sequence number, at least two digits wide. The returned file has been
    /// created empty; the caller owns it.
    pub fn allocate(&self, basename: &str, label: Option<&str>, ext: &str) -> io::Result<Utf8PathBuf> {
        for seq in 0..=MAX_SEQUENCE {
            let file_name = match label {
                Some(label) => format!("{basename}-{label}-{seq:02}.{ext}"),
                None => format!("{basename}-{seq:02}.{ext}"),
            };
            let path = self.dir.join(file_name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!("allocated log file {path}");
                    return Ok(path);
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(error) => return Err(error),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "all log names for `{basename}` in `{}` are in use",
                self.dir
            ),
        ))
    }
}

/// The test log argument recognized by the runner: `-o <file>[,<format>]`.
pub(crate) const LOG_ARG: &str = "-o";

/// Returns the default file extension for a test log format.
pub(crate) fn extension_for_format(format: Option<&str>) -> &'static str {
    match format {
        Some("xml" | "lightxml" | "junitxml") => "xml",
        Some("tap") => "tap",
        Some("csv") => "csv",
        // txt, teamcity and anything unrecognized.
        _ => "txt",
    }
}

/// A log file the test was told to write, and which is checked once the test exits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExpectedLog {
    /// Where the test was told to write the log.
    pub path: Utf8PathBuf,

    /// The format the test was asked to use, if any.
    pub format: Option<String>,
}

/// The result of rewriting a test's log arguments into a capture directory.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct RewrittenArgs {
    pub(crate) args: Vec<String>,
    pub(crate) expected_logs: Vec<ExpectedLog>,
    pub(crate) has_stdout_log: bool,
}

/// Rewrites every `-o <file>[,<format>]` pair in `args` to point into `capture`.
///
/// A file of `-` means standard output and is left alone. Other files are replaced by a freshly
/// allocated `<basename>-<stem>-NN.<ext>` name, where `ext` is the file's own extension if it has
/// one, and otherwise derived from the format.
pub(crate) fn rewrite_log_args(
    args: &[String],
    basename: &str,
    capture: &LogCaptureDir,
) -> io::Result<RewrittenArgs> {
    let mut out = RewrittenArgs {
        args: Vec::with_capacity(args.len()),
        ..Default::default()
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        out.args.push(arg.clone());
        if arg != LOG_ARG {
            continue;
        }
        let Some(value) = iter.next() else {
            break;
        };

        let (file, format) = match value.rsplit_once(',') {
            Some((file, format)) => (file, Some(format)),
            None => (value.as_str(), None),
        };
        if file == "-" {
            out.has_stdout_log = true;
            out.args.push(value.clone());
            continue;
        }

        let file = Utf8Path::new(file);
        let label = file
            .file_stem()
            .filter(|stem| !stem.is_empty())
            .unwrap_or(basename);
        let ext = file
            .extension()
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| extension_for_format(format));
        let path = capture.allocate(basename, Some(label), ext)?;

        out.args.push(match format {
            Some(format) => format!("{path},{format}"),
            None => path.to_string(),
        });
        out.expected_logs.push(ExpectedLog {
            path,
            format: format.map(str::to_owned),
        });
    }

    Ok(out)
}

/// Returns `args` with every `-o <file>[,<format>]` pair removed.
pub(crate) fn strip_log_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == LOG_ARG {
            iter.next();
        } else {
            out.push(arg.clone());
        }
    }
    out
}

/// Returns the expected logs that are missing or empty.
pub(crate) fn missing_logs(expected: &[ExpectedLog]) -> Vec<&ExpectedLog> {
    expected
        .iter()
        .filter(|log| match std::fs::metadata(&log.path) {
            Ok(metadata) => metadata.len() == 0,
            Err(_) => true,
        })
        .collect()
}
