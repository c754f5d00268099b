// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Test plans for [testsched](https://crates.io/crates/testsched).
//!
//! A test plan is produced once by `testsched plan` and consumed by one or more
//! `testsched run` invocations. This crate contains the plan data model and the
//! line-oriented file format, so that other tools can produce and inspect
//! plans without depending on the scheduler.

mod errors;
mod exit_codes;
mod plan;

pub use errors::*;
pub use exit_codes::*;
pub use plan::*;
