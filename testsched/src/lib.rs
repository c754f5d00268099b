// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discovers the tests of a make-based project and runs them.
//!
//! `testsched plan` asks the project's build system which tests it would run and writes them to a
//! plan file. `testsched run` executes a plan, running parallel-safe tests in a bounded pool and
//! the rest one at a time, and prints a summary. `testsched exec` supervises a single command.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
