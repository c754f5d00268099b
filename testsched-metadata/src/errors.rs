// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use std::{error, fmt, io};

/// An error that occurs while parsing the text of a test plan.
///
/// Every variant carries the 1-based line number at which the problem was found. Line 0 is used
/// for problems with the plan as a whole (for example, an empty file).
#[derive(Debug)]
#[non_exhaustive]
pub enum PlanParseError {
    /// The plan did not start with a `testsched-plan` version line.
    MissingVersion {
        /// The line at which a version line was expected.
        line: usize,
    },

    /// The plan declared a format version this crate does not understand.
    UnsupportedVersion {
        /// The line containing the version.
        line: usize,
        /// The version as written in the plan.
        version: String,
    },

    /// A line started with an unknown directive.
    UnknownDirective {
        /// The offending line.
        line: usize,
        /// The directive that was not recognized.
        directive: String,
    },

    /// A line could not be split into words.
    Tokenize {
        /// The offending line.
        line: usize,
        /// The underlying error.
        err: shell_words::ParseError,
    },

    /// A line had the wrong shape for its directive.
    Malformed {
        /// The offending line.
        line: usize,
        /// A description of what was wrong.
        message: &'static str,
    },

    /// The compact flags field of a test line was invalid.
    InvalidFlags {
        /// The offending line.
        line: usize,
        /// The flags as written.
        flags: String,
    },

    /// A timeout was not a positive number of seconds.
    InvalidTimeout {
        /// The offending line.
        line: usize,
        /// The timeout as written.
        input: String,
    },

    /// A test entry could not be added to the plan.
    InvalidEntry {
        /// The offending line.
        line: usize,
        /// The underlying error.
        err: InvalidEntryError,
    },

    /// A subtest line referred to a test that was not declared earlier.
    UnknownSubtestParent {
        /// The offending line.
        line: usize,
        /// The test name the subtest line referred to.
        name: String,
    },
}

impl fmt::Display for PlanParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MissingVersion { line } => write!(
                f,
                "line {line}: expected `{} <version>` before any other directive",
                crate::TestPlan::VERSION_DIRECTIVE
            ),
            Self::UnsupportedVersion { line, version } => write!(
                f,
                "line {line}: unsupported plan format version `{version}` (supported: {})",
                crate::TestPlan::FORMAT_VERSION
            ),
            Self::UnknownDirective { line, directive } => {
                write!(f, "line {line}: unknown directive `{directive}`")
            }
            Self::Tokenize { line, .. } => {
                write!(f, "line {line}: could not split line into words")
            }
            Self::Malformed { line, message } => write!(f, "line {line}: {message}"),
            Self::InvalidFlags { line, flags } => write!(
                f,
                "line {line}: invalid flags `{flags}` (expected `[i-][p-]` with an optional `:<timeout>`)"
            ),
            Self::InvalidTimeout { line, input } => write!(
                f,
                "line {line}: invalid timeout `{input}` (expected a positive number of seconds)"
            ),
            Self::InvalidEntry { line, .. } => write!(f, "line {line}: invalid test entry"),
            Self::UnknownSubtestParent { line, name } => write!(
                f,
                "line {line}: subtest refers to test `{name}`, which was not declared earlier"
            ),
        }
    }
}

impl error::Error for PlanParseError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Tokenize { err, .. } => Some(err),
            Self::InvalidEntry { err, .. } => Some(err),
            Self::MissingVersion { .. }
            | Self::UnsupportedVersion { .. }
            | Self::UnknownDirective { .. }
            | Self::Malformed { .. }
            | Self::InvalidFlags { .. }
            | Self::InvalidTimeout { .. }
            | Self::UnknownSubtestParent { .. } => None,
        }
    }
}

/// An error returned when a [`TestPlanEntry`](crate::TestPlanEntry) cannot be added to a plan.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum InvalidEntryError {
    /// The test name was empty.
    EmptyName,

    /// The command was empty.
    EmptyCommand,

    /// Another entry with the same name already exists in the plan.
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A subtest name was declared twice for the same entry.
    DuplicateSubtest {
        /// The test the subtest belongs to.
        name: String,
        /// The duplicated subtest name.
        subtest: String,
    },

    /// A field contained a line break, which the line-oriented format cannot represent.
    LineBreak {
        /// The field that contained the line break.
        field: &'static str,
    },
}

impl fmt::Display for InvalidEntryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "test name is empty"),
            Self::EmptyCommand => write!(f, "test command is empty"),
            Self::DuplicateName { name } => write!(f, "duplicate test name `{name}`"),
            Self::DuplicateSubtest { name, subtest } => {
                write!(f, "duplicate subtest `{subtest}` for test `{name}`")
            }
            Self::LineBreak { field } => write!(f, "{field} contains a line break"),
        }
    }
}

impl error::Error for InvalidEntryError {}

/// An error that occurs while reading a test plan from disk.
#[derive(Debug)]
#[non_exhaustive]
pub enum PlanReadError {
    /// The file could not be read.
    Read {
        /// The path to the plan.
        path: Utf8PathBuf,
        /// The underlying error.
        err: io::Error,
    },

    /// The file was read but is not a valid plan.
    Parse {
        /// The path to the plan.
        path: Utf8PathBuf,
        /// The underlying error.
        err: PlanParseError,
    },
}

impl fmt::Display for PlanReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Read { path, .. } => write!(f, "failed to read test plan at `{path}`"),
            Self::Parse { path, .. } => write!(f, "failed to parse test plan at `{path}`"),
        }
    }
}

impl error::Error for PlanReadError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Read { err, .. } => Some(err),
            Self::Parse { err, .. } => Some(err),
        }
    }
}

/// An error that occurs while writing a test plan to disk.
#[derive(Debug)]
pub struct PlanWriteError {
    path: Utf8PathBuf,
    err: io::Error,
}

impl PlanWriteError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, err: io::Error) -> Self {
        Self {
            path: path.into(),
            err,
        }
    }

    /// Returns the path that could not be written.
    pub fn path(&self) -> &Utf8PathBuf {
        &self.path
    }
}

impl fmt::Display for PlanWriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "failed to write test plan to `{}`", self.path)
    }
}

impl error::Error for PlanWriteError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.err)
    }
}
