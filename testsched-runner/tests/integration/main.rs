// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests driving real child processes. The fixtures are small shell scripts, so these
//! tests only run on Unix.

#![cfg(unix)]

mod planner;
mod runner;
mod scheduler;
