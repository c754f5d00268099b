// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    AttemptStatus,
    child::{ChildPipes, OutputSink},
};
use libc::{SIGKILL, SIGTERM};
use std::{
    os::unix::process::{CommandExt, ExitStatusExt},
    process::ExitStatus,
    time::Duration,
};
use tokio::process::Child;
use tracing::debug;

/// Puts the child in its own process group, so the whole tree can be signalled at once.
pub(super) fn set_process_group(cmd: &mut std::process::Command) {
    cmd.process_group(0);
}

pub(super) fn attempt_status(status: ExitStatus) -> AttemptStatus {
    match status.signal() {
        Some(signal) => AttemptStatus::Signaled {
            signal,
            core_dumped: status.core_dumped(),
        },
        None => AttemptStatus::Exited {
            code: status.code().unwrap_or(-1),
        },
    }
}

fn kill_group(pid: u32, signal: libc::c_int) {
    // The child is the leader of its own process group, so a negative pid addresses the group.
    let pgid = -(pid as libc::pid_t);
    unsafe {
        libc::kill(pgid, signal);
    }
}

/// Sends SIGTERM to the child's process group, waits up to `grace_period` while still draining
/// output, then sends SIGKILL.
pub(super) async fn terminate_child(
    child: &mut Child,
    pipes: &mut ChildPipes,
    sink: &mut OutputSink<'_>,
    grace_period: Duration,
) {
    let Some(pid) = child.id() else {
        // The child has already been reaped.
        return;
    };

    if grace_period.is_zero() {
        kill_group(pid, SIGKILL);
        _ = child.wait().await;
        return;
    }

    debug!("sending SIGTERM to process group {pid}");
    kill_group(pid, SIGTERM);

    let sleep = tokio::time::sleep(grace_period);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            res = pipes.read_chunk(), if !pipes.is_done() => sink.accept(res).await,
            _ = child.wait() => break,
            () = &mut sleep => {
                debug!("grace period elapsed, sending SIGKILL to process group {pid}");
                kill_group(pid, SIGKILL);
                _ = child.wait().await;
                break;
            }
        }
    }

    // Other members of the group may have outlived the leader.
    kill_group(pid, SIGKILL);
}
