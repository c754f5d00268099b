// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `testsched` failures.
///
/// `testsched` runs may fail for a variety of reasons. This structure documents the exit codes
/// that may occur in case of expected failures.
///
/// Unknown/unexpected failures will always result in exit code 1. Command-line usage errors
/// result in exit code 2.
pub enum TestschedExitCode {}

impl TestschedExitCode {
    /// No errors occurred and every significant test passed.
    pub const OK: i32 = 0;

    /// One or more significant tests failed.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// Discovering tests in the build tree produced an error.
    pub const PLAN_BUILD_FAILED: i32 = 101;

    /// The test plan could not be read, or it was not a valid plan.
    pub const PLAN_READ_FAILED: i32 = 102;

    /// Writing data to stdout, stderr or the plan file produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;

    /// A user issue happened while setting up a testsched invocation, for example the log
    /// capture directory could not be created.
    pub const SETUP_ERROR: i32 = 96;
}
