// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core logic for testsched: single-test supervision, plugins, plan generation and scheduling.
//!
//! The pipeline is:
//!
//! 1. [`planner`] discovers test binaries through the project's own build system and emits a
//!    [`TestPlan`](testsched_metadata::TestPlan).
//! 2. [`scheduler`] reads a plan, runs parallel-safe entries in a bounded pool and the rest
//!    serially, and accumulates a [`ResultSet`](reporter::ResultSet).
//! 3. Each test attempt is supervised by a [`Runner`](runner::Runner), which enforces timeouts,
//!    captures output and consults its [`plugins`].

#![warn(missing_docs)]

pub mod errors;
pub mod helpers;
pub mod planner;
pub mod plugins;
pub mod reporter;
pub mod results;
pub mod runner;
pub mod scheduler;
mod time;
pub mod transcript;
