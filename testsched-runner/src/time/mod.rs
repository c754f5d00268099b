// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod stopwatch;

pub(crate) use stopwatch::{StopwatchStart, stopwatch};
