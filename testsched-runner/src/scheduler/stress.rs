// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classification of tests after a parallel-stress pass.

use crate::reporter::{ResultSet, StressReport, StressVerdict, TestStatus};
use std::collections::{HashMap, HashSet};

/// Compares each test's ordinary outcome with its outcome under stress.
///
/// * Passed both times and is not already marked parallel-safe: [`StressVerdict::Candidate`].
/// * Passed the ordinary run but failed under stress: [`StressVerdict::Unsafe`].
/// * Anything else: [`StressVerdict::Unknown`].
pub(crate) fn classify(
    ordinary: &ResultSet,
    stressed: &HashMap<String, TestStatus>,
    parallel_safe: &HashSet<String>,
) -> StressReport {
    let verdicts = ordinary
        .outcomes()
        .map(|outcome| {
            let passed = outcome.status.is_success();
            let verdict = match stressed.get(&outcome.name).copied() {
                Some(status) if passed && !status.is_success() => StressVerdict::Unsafe,
                Some(status)
                    if passed && status.is_success() && !parallel_safe.contains(&outcome.name) =>
                {
                    StressVerdict::Candidate
                }
                _ => StressVerdict::Unknown,
            };
            (outcome.name.clone(), verdict)
        })
        .collect();
    StressReport { verdicts }
}
