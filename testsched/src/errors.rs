// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use std::error::Error;
use testsched_metadata::{PlanReadError, PlanWriteError, TestschedExitCode};
use testsched_runner::errors::{
    CaptureDirError, ExecuteError, PlanBuildError, PluginConfigError, RecordError,
    SchedulerBuildError,
};
use thiserror::Error;
use tracing::error;

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method, which colorizes errors.

/// An expected failure of a testsched invocation.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("test plan build error")]
    PlanBuild {
        #[from]
        err: PlanBuildError,
    },
    #[error("test plan read error")]
    PlanRead {
        #[from]
        err: PlanReadError,
    },
    #[error("test plan write error")]
    PlanWrite {
        #[from]
        err: PlanWriteError,
    },
    #[error("failed to write test plan to stdout")]
    PlanWriteStdout {
        #[source]
        err: std::io::Error,
    },
    #[error("capture directory error")]
    CaptureDir {
        #[from]
        err: CaptureDirError,
    },
    #[error("plugin configuration error")]
    PluginConfig {
        #[from]
        err: PluginConfigError,
    },
    #[error("scheduler build error")]
    SchedulerBuild {
        #[from]
        err: SchedulerBuildError,
    },
    #[error("failed to create the async runtime")]
    RuntimeBuild {
        #[source]
        err: std::io::Error,
    },
    #[error("plan execution error")]
    Execute {
        #[from]
        err: ExecuteError,
    },
    #[error("record error")]
    Record {
        fragment_dir: Utf8PathBuf,
        #[source]
        err: RecordError,
    },
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::PlanBuild { .. } => TestschedExitCode::PLAN_BUILD_FAILED,
            Self::PlanRead { .. } => TestschedExitCode::PLAN_READ_FAILED,
            Self::PlanWrite { .. } | Self::PlanWriteStdout { .. } | Self::Execute { .. } => {
                TestschedExitCode::WRITE_OUTPUT_ERROR
            }
            Self::CaptureDir { .. }
            | Self::PluginConfig { .. }
            | Self::SchedulerBuild { .. }
            | Self::RuntimeBuild { .. }
            | Self::Record { .. } => TestschedExitCode::SETUP_ERROR,
        }
    }

    /// Displays this error to stderr, followed by its chain of causes.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::PlanBuild { err } => {
                match err {
                    // The build tool's own output explains what went wrong.
                    PlanBuildError::MakeFailed { command, status } => {
                        error!("`{}` {status}", command.style(styles.bold));
                    }
                    _ => error!("{err}"),
                }
                err.source()
            }
            Self::PlanRead { err } => {
                error!("{err}");
                err.source()
            }
            Self::PlanWrite { err } => {
                error!("{err}");
                err.source()
            }
            Self::PlanWriteStdout { err } => {
                error!("failed to write test plan to stdout");
                Some(err as &dyn Error)
            }
            Self::CaptureDir { err } => {
                error!(
                    "cannot create log capture directory `{}`",
                    err.dir().style(styles.bold)
                );
                err.source()
            }
            Self::PluginConfig { err } => {
                error!("invalid plugin configuration: {err}");
                err.source()
            }
            Self::SchedulerBuild { err } => {
                error!("{err}");
                err.source()
            }
            Self::RuntimeBuild { err } => {
                error!("failed to create the async runtime");
                Some(err as &dyn Error)
            }
            Self::Execute { err } => {
                error!("{err}");
                err.source()
            }
            Self::Record { fragment_dir, err } => {
                error!(
                    "failed to record test invocation into `{}`",
                    fragment_dir.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
