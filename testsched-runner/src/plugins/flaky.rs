// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::RunnerPlugin;
use crate::{reporter::TestStatus, runner::AttemptReport};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// How a failed attempt followed by a retry is interpreted.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum FlakyMode {
    /// Prefer the passing attempt, if there is one.
    Best,

    /// Any failure counts.
    #[default]
    Worst,

    /// Flaky failures are reported but do not fail the run.
    Ignore,
}

impl FlakyMode {
    /// Returns the name of this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Worst => "worst",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for FlakyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned when parsing an unknown [`FlakyMode`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown flaky mode `{input}` (expected best, worst or ignore)")]
pub struct FlakyModeParseError {
    input: String,
}

impl FromStr for FlakyMode {
    type Err = FlakyModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best" => Ok(Self::Best),
            "worst" => Ok(Self::Worst),
            "ignore" => Ok(Self::Ignore),
            other => Err(FlakyModeParseError {
                input: other.to_owned(),
            }),
        }
    }
}

/// Retries failing tests once and reconciles the two attempts according to a [`FlakyMode`].
///
/// With function repetitions enabled, a test whose XML results log names its failing test
/// functions has just those functions rerun, each the given number of times, instead of a
/// whole-test retry.
#[derive(Clone, Debug)]
pub struct FlakyPlugin {
    mode: FlakyMode,
    function_repetitions: u32,
}

impl FlakyPlugin {
    /// Creates a new flaky plugin with the given mode.
    pub fn new(mode: FlakyMode) -> Self {
        Self {
            mode,
            function_repetitions: 0,
        }
    }

    /// Sets how many times each failing test function is rerun.
    pub fn with_function_repetitions(mut self, repetitions: u32) -> Self {
        self.function_repetitions = repetitions;
        self
    }
}

impl RunnerPlugin for FlakyPlugin {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn retry_policy(&self) -> Option<FlakyMode> {
        Some(self.mode)
    }

    fn function_repetitions(&self) -> u32 {
        self.function_repetitions
    }
}

/// The result of reconciling one or two attempts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reconciled {
    /// The status of the test.
    pub status: TestStatus,

    /// An explanation of how the attempts were interpreted, if there was a retry.
    pub note: Option<String>,
}

/// Returns the status of a test whose failure went away on retry.
pub fn vanishing_failure(mode: FlakyMode) -> TestStatus {
    match mode {
        FlakyMode::Best => TestStatus::FlakyPass { ignored: false },
        FlakyMode::Worst => TestStatus::FlakyFail,
        FlakyMode::Ignore => TestStatus::FlakyPass { ignored: true },
    }
}

/// Reconciles a first attempt and an optional retry.
///
/// | first | retry            | best      | worst     | ignore             |
/// |-------|------------------|-----------|-----------|--------------------|
/// | pass  | none             | Pass      | Pass      | Pass               |
/// | fail  | pass             | FlakyPass | FlakyFail | FlakyPass, ignored |
/// | fail  | same failure     | Fail      | Fail      | Fail               |
/// | fail  | differing fail   | FlakyFail | FlakyFail | FlakyPass, ignored |
pub fn reconcile_attempts(
    mode: FlakyMode,
    first: &AttemptReport,
    retry: Option<&AttemptReport>,
) -> Reconciled {
    if first.is_success() {
        return Reconciled {
            status: TestStatus::Pass,
            note: None,
        };
    }
    let Some(retry) = retry else {
        return Reconciled {
            status: TestStatus::Fail,
            note: None,
        };
    };

    if retry.is_success() {
        return Reconciled {
            status: vanishing_failure(mode),
            note: Some(format!("flaky (vanishing failure), mode {mode} applied")),
        };
    }

    if first.same_failure(retry) {
        return Reconciled {
            status: TestStatus::Fail,
            note: Some(format!(
                "failure confirmed reproducible: {}",
                retry.description()
            )),
        };
    }

    let status = match mode {
        FlakyMode::Best | FlakyMode::Worst => TestStatus::FlakyFail,
        FlakyMode::Ignore => TestStatus::FlakyPass { ignored: true },
    };
    Reconciled {
        status,
        note: Some(format!(
            "flaky (differing failures: {}; {}), mode {mode} applied",
            first.description(),
            retry.description()
        )),
    }
}
