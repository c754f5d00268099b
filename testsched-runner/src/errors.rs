// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testsched.

use camino::Utf8PathBuf;
use testsched_metadata::InvalidEntryError;
use thiserror::Error;

/// An error that occurred while creating a log capture directory.
///
/// This is a systemic failure: if the capture root cannot be created, no test can be captured.
#[derive(Debug, Error)]
#[error("cannot create directory `{dir}`")]
pub struct CaptureDirError {
    dir: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

impl CaptureDirError {
    pub(crate) fn new(dir: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        Self {
            dir: dir.into(),
            err,
        }
    }

    /// Returns the directory that could not be created.
    pub fn dir(&self) -> &Utf8PathBuf {
        &self.dir
    }
}

/// An error that occurred while constructing a plugin from its configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginConfigError {
    /// The coverage wrapper command line could not be split into words.
    #[error("failed to parse coverage wrapper `{input}`")]
    CoverageWrapperParse {
        /// The wrapper as provided.
        input: String,

        /// The underlying error.
        #[source]
        err: shell_words::ParseError,
    },

    /// The coverage plugin was requested without a wrapper command.
    #[error("the coverage plugin requires a non-empty wrapper command")]
    CoverageWrapperMissing,
}

/// An error that occurred while building a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerBuildError {
    /// The async runtime could not be created.
    #[error("failed to create the async runtime")]
    Runtime(#[source] std::io::Error),
}

/// An error that occurred while executing a plan.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecuteError {
    /// Writing to the transcript failed.
    #[error("failed to write test transcript")]
    WriteTranscript(#[source] std::io::Error),
}

/// An error that occurred while building a test plan.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlanBuildError {
    /// The build root does not exist or is not a directory.
    #[error("build directory `{dir}` does not exist")]
    BuildDirMissing {
        /// The build directory.
        dir: Utf8PathBuf,
    },

    /// The path to the current executable could not be determined.
    #[error("failed to determine the path to the current executable")]
    CurrentExe(#[source] std::io::Error),

    /// The temporary directory for recorded invocations could not be created.
    #[error("failed to create a temporary directory for recorded test invocations")]
    TempDir(#[source] std::io::Error),

    /// The build command could not be started.
    #[error("failed to execute `{command}`")]
    MakeExec {
        /// The command line that was run.
        command: String,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The build command exited unsuccessfully.
    #[error("`{command}` {status}")]
    MakeFailed {
        /// The command line that was run.
        command: String,

        /// A description of how the command exited.
        status: String,
    },

    /// A recorded invocation could not be read.
    #[error("failed to read recorded test invocation at `{path}`")]
    FragmentRead {
        /// The path to the fragment.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// A recorded invocation could not be parsed.
    #[error("failed to parse recorded test invocation at `{path}`")]
    FragmentParse {
        /// The path to the fragment.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: serde_json::Error,
    },

    /// A per-directory test configuration file could not be read.
    #[error("failed to read test configuration at `{path}`")]
    ConfigRead {
        /// The path to the configuration file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// A per-directory test configuration file could not be parsed.
    #[error("failed to parse test configuration at `{path}`")]
    ConfigParse {
        /// The path to the configuration file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: toml::de::Error,
    },

    /// A discovered test could not be added to the plan.
    #[error("discovered test `{name}` could not be added to the plan")]
    InvalidEntry {
        /// The name of the test.
        name: String,

        /// The underlying error.
        #[source]
        err: InvalidEntryError,
    },
}

/// An error that occurred while recording a test invocation on behalf of the planner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// The current directory could not be determined or is not UTF-8.
    #[error("failed to determine the current directory")]
    CurrentDir(#[source] std::io::Error),

    /// The fragment file could not be created.
    #[error("failed to create invocation record in `{dir}`")]
    Create {
        /// The fragment directory.
        dir: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The fragment file could not be written.
    #[error("failed to write invocation record to `{path}`")]
    Write {
        /// The path to the fragment.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },
}

/// An error that occurred while reading a QTestLib XML results log.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResultsParseError {
    /// The log could not be read.
    #[error("failed to read results log `{path}`")]
    Read {
        /// The path to the log.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The log is not well-formed XML.
    #[error("failed to parse results log")]
    Xml(#[from] quick_xml::Error),
}
