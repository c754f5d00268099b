// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    AttemptStatus,
    child::{ChildPipes, OutputSink},
};
use std::{process::ExitStatus, time::Duration};
use tokio::process::Child;

// Process groups are a Unix concept; this is a no-op on Windows.
pub(super) fn set_process_group(_cmd: &mut std::process::Command) {}

pub(super) fn attempt_status(status: ExitStatus) -> AttemptStatus {
    AttemptStatus::Exited {
        code: status.code().unwrap_or(-1),
    }
}

/// Windows has no graceful termination signal, so the child is killed immediately.
pub(super) async fn terminate_child(
    child: &mut Child,
    _pipes: &mut ChildPipes,
    _sink: &mut OutputSink<'_>,
    _grace_period: Duration,
) {
    _ = child.start_kill();
    _ = child.wait().await;
}
