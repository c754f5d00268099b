// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test outcomes and their aggregation into a [`ResultSet`].
//!
//! Outcomes are recorded as tests complete, in whatever order that happens to be. Once the
//! scheduler is done, [`ResultSet::finalize`] restores plan order and attaches timing, after which
//! the summary can be rendered with [`ResultSet::write_summary`].

mod summary;

pub use summary::Styles;

use indexmap::IndexMap;
use std::{fmt, time::Duration};

/// The final verdict for one test, after all attempts.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TestStatus {
    /// The test passed on its first attempt.
    Pass,

    /// The test failed.
    Fail,

    /// The test failed, but it is marked insignificant.
    InsignificantFail,

    /// The test failed once and then passed, or failed in differing ways, and the flaky mode
    /// counts that as a pass.
    FlakyPass {
        /// True if the flakiness was only tolerated because the flaky mode is `ignore`.
        ignored: bool,
    },

    /// The test behaved non-deterministically and the flaky mode counts that as a failure.
    FlakyFail,
}

impl TestStatus {
    /// Returns true if this status fails the run.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::FlakyFail)
    }

    /// Returns true if this status counts as a pass.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Pass | Self::FlakyPass { .. })
    }

    /// Returns true if the test ran into flakiness.
    pub fn is_flaky(self) -> bool {
        matches!(self, Self::FlakyPass { .. } | Self::FlakyFail)
    }

    /// Returns true if time spent on a test with this status was spent for nothing: its result
    /// does not count either way.
    pub fn is_insignificant(self) -> bool {
        matches!(
            self,
            Self::InsignificantFail | Self::FlakyPass { ignored: true }
        )
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::InsignificantFail => write!(f, "insignificant fail"),
            Self::FlakyPass { ignored: false } => write!(f, "flaky pass"),
            Self::FlakyPass { ignored: true } => write!(f, "flaky pass (ignored)"),
            Self::FlakyFail => write!(f, "flaky fail"),
        }
    }
}

/// The scheduler's record of one test (or subtest) once it has finished.
#[derive(Clone, Debug)]
pub struct TestOutcome {
    /// The name of the test. Subtests are named `entry (subtest)`.
    pub name: String,

    /// The position of this test in plan order, with subtests expanded in place.
    pub index: usize,

    /// The final status.
    pub status: TestStatus,

    /// The time spent across all attempts.
    pub duration: Duration,

    /// True if the test ran in the parallel pool.
    pub parallel: bool,

    /// The names of the other parallel tests that were running at some point while this one was.
    pub concurrent_with: Vec<String>,

    /// How a retry was interpreted, if one happened.
    pub note: Option<String>,

    /// The reasons each failing attempt failed, in order.
    pub reasons: Vec<String>,
}

/// How a test behaved when run under parallel stress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StressVerdict {
    /// Not marked parallel-safe, but passed under stress: a candidate for marking it so.
    Candidate,

    /// Passed in the ordinary run but failed under stress.
    Unsafe,

    /// Nothing can be concluded.
    Unknown,
}

impl StressVerdict {
    /// Returns a short description of this verdict.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "candidate for parallel-safe",
            Self::Unsafe => "parallel-unsafe",
            Self::Unknown => "unknown",
        }
    }
}

/// The results of a parallel-stress pass.
#[derive(Clone, Debug, Default)]
pub struct StressReport {
    /// Each test's verdict, in plan order.
    pub verdicts: Vec<(String, StressVerdict)>,
}

impl StressReport {
    /// Returns the names of tests with the given verdict.
    pub fn with_verdict(&self, verdict: StressVerdict) -> impl Iterator<Item = &str> {
        self.verdicts
            .iter()
            .filter(move |(_, v)| *v == verdict)
            .map(|(name, _)| name.as_str())
    }
}

/// Wall-clock timing measured by the scheduler.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunTiming {
    /// Time from the start of the run to the end of the last test.
    pub wall: Duration,

    /// Time taken by the parallel pool, from first dispatch until it drained.
    pub parallel_wall: Duration,

    /// Time taken by the serial queue.
    pub serial_wall: Duration,
}

/// Counts of outcomes by category.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Totals {
    /// The number of tests (and subtests) run.
    pub tests: usize,

    /// Passes, including flaky passes.
    pub passes: usize,

    /// Significant failures, including flaky failures.
    pub fails: usize,

    /// Insignificant failures.
    pub insignificant_fails: usize,
}

/// The accumulated outcomes of a plan run.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    outcomes: IndexMap<String, TestOutcome>,
    timing: RunTiming,
    stress: Option<StressReport>,
}

impl ResultSet {
    /// Creates an empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome. A later outcome with the same name replaces the earlier one.
    pub fn record(&mut self, outcome: TestOutcome) {
        self.outcomes.insert(outcome.name.clone(), outcome);
    }

    /// Restores plan order and attaches the measured timing.
    pub fn finalize(&mut self, timing: RunTiming) {
        self.outcomes.sort_by(|_, a, _, b| a.index.cmp(&b.index));
        self.timing = timing;
    }

    /// Attaches the results of a parallel-stress pass.
    pub fn set_stress_report(&mut self, report: StressReport) {
        self.stress = Some(report);
    }

    /// Iterates over outcomes, in plan order once finalized.
    pub fn outcomes(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.values()
    }

    /// Looks up an outcome by name.
    pub fn get(&self, name: &str) -> Option<&TestOutcome> {
        self.outcomes.get(name)
    }

    /// Returns the number of recorded outcomes.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns true if no outcomes were recorded.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Returns the wall-clock timing.
    pub fn timing(&self) -> RunTiming {
        self.timing
    }

    /// Returns the parallel-stress report, if a stress pass was run.
    pub fn stress_report(&self) -> Option<&StressReport> {
        self.stress.as_ref()
    }

    /// Returns counts of outcomes by category.
    pub fn totals(&self) -> Totals {
        let mut totals = Totals {
            tests: self.outcomes.len(),
            ..Totals::default()
        };
        for outcome in self.outcomes.values() {
            match outcome.status {
                TestStatus::Pass | TestStatus::FlakyPass { .. } => totals.passes += 1,
                TestStatus::Fail | TestStatus::FlakyFail => totals.fails += 1,
                TestStatus::InsignificantFail => totals.insignificant_fails += 1,
            }
        }
        totals
    }

    /// Returns true if no significant test failed.
    pub fn is_success(&self) -> bool {
        !self
            .outcomes
            .values()
            .any(|outcome| outcome.status.is_failure())
    }

    /// Returns the names of failing tests in plan order, including insignificant failures.
    pub fn failed_names(&self) -> Vec<&str> {
        self.outcomes
            .values()
            .filter(|outcome| {
                outcome.status.is_failure() || outcome.status == TestStatus::InsignificantFail
            })
            .map(|outcome| outcome.name.as_str())
            .collect()
    }

    /// Returns the total duration of tests that ran in the parallel pool, as if they had run one
    /// after the other.
    pub fn parallel_serial_equivalent(&self) -> Duration {
        self.outcomes
            .values()
            .filter(|outcome| outcome.parallel)
            .map(|outcome| outcome.duration)
            .sum()
    }

    /// Returns the estimated time saved by running the parallel pool concurrently, or `None` if
    /// no test ran in the parallel pool.
    pub fn time_saved(&self) -> Option<Duration> {
        self.outcomes
            .values()
            .any(|outcome| outcome.parallel)
            .then(|| {
                self.parallel_serial_equivalent()
                    .saturating_sub(self.timing.parallel_wall)
            })
    }

    /// Returns the time spent on tests whose results did not count.
    pub fn insignificant_time(&self) -> Duration {
        self.outcomes
            .values()
            .filter(|outcome| outcome.status.is_insignificant())
            .map(|outcome| outcome.duration)
            .sum()
    }
}
