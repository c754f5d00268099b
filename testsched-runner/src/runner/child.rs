// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Spawning and supervising a single child process.

use super::{CommandLine, os};
use crate::transcript::TestSection;
use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use std::{io, process::ExitStatus, process::Stdio, time::Duration};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdout},
};
use tracing::debug;

/// The size of each buffered reader's buffer.
///
/// This is the (normal) page size on most systems.
const CHUNK_SIZE: usize = 4 * 1024;

/// How long to keep reading output after the child exits.
///
/// Grandchildren that inherited the pipes can keep them open indefinitely, so output is only
/// drained for a short while.
const LEAK_TIMEOUT: Duration = Duration::from_millis(100);

/// A spawned child process along with its output pipes.
pub(super) struct SpawnedChild {
    pub(super) child: Child,
    pub(super) pipes: ChildPipes,
}

pub(super) fn spawn(command: &CommandLine) -> io::Result<SpawnedChild> {
    // Build systems invoke tests as `./tst_foo` from the test's own directory.
    let program = match &command.cwd {
        Some(cwd)
            if command.program.contains('/') && Utf8Path::new(&command.program).is_relative() =>
        {
            cwd.join(&command.program).into_string()
        }
        _ => command.program.clone(),
    };
    let mut cmd = std::process::Command::new(program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    os::set_process_group(&mut cmd);

    let mut cmd: tokio::process::Command = cmd.into();
    cmd.kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take().expect("stdout was set");
    let stderr = child.stderr.take().expect("stderr was set");

    Ok(SpawnedChild {
        child,
        pipes: ChildPipes {
            stdout: FusedBufReader::new(stdout),
            stderr: FusedBufReader::new(stderr),
        },
    })
}

/// Which stream a chunk of output came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum ChildStream {
    Stdout,
    Stderr,
}

/// A `BufReader` that remembers whether it has reached end of file.
struct FusedBufReader<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FusedBufReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            done: false,
        }
    }

    /// Reads whatever is available. Returns `None` at end of file.
    ///
    /// This is cancel-safe, since [`AsyncBufReadExt::fill_buf`] is cancel-safe.
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }

        match self.reader.fill_buf().await {
            Ok(buf) if buf.is_empty() => {
                self.done = true;
                Ok(None)
            }
            Ok(buf) => {
                let chunk = Bytes::copy_from_slice(buf);
                self.reader.consume(chunk.len());
                Ok(Some(chunk))
            }
            Err(error) => {
                self.done = true;
                Err(error)
            }
        }
    }
}

/// The stdout and stderr pipes of a child process.
pub(super) struct ChildPipes {
    stdout: FusedBufReader<ChildStdout>,
    stderr: FusedBufReader<ChildStderr>,
}

impl ChildPipes {
    pub(super) fn is_done(&self) -> bool {
        self.stdout.done && self.stderr.done
    }

    /// Waits until either pipe makes progress.
    pub(super) async fn read_chunk(&mut self) -> io::Result<Option<(ChildStream, Bytes)>> {
        let Self { stdout, stderr } = self;
        tokio::select! {
            res = stdout.read_chunk(), if !stdout.done => {
                res.map(|chunk| chunk.map(|chunk| (ChildStream::Stdout, chunk)))
            }
            res = stderr.read_chunk(), if !stderr.done => {
                res.map(|chunk| chunk.map(|chunk| (ChildStream::Stderr, chunk)))
            }
            else => Ok(None),
        }
    }
}

/// How the supervised child finished.
#[derive(Debug)]
pub(super) enum ChildExit {
    Exited(ExitStatus),
    TimedOut,
}

/// Relays, captures and accumulates the output of one attempt.
pub(super) struct OutputSink<'a> {
    section: &'a mut TestSection,
    relay: bool,
    capture: Option<(Utf8PathBuf, File)>,
    stdout: BytesMut,
    stderr: BytesMut,
}

impl<'a> OutputSink<'a> {
    pub(super) fn new(
        section: &'a mut TestSection,
        relay: bool,
        capture: Option<(Utf8PathBuf, File)>,
    ) -> Self {
        Self {
            section,
            relay,
            capture,
            stdout: BytesMut::with_capacity(CHUNK_SIZE),
            stderr: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    pub(super) async fn accept(&mut self, res: io::Result<Option<(ChildStream, Bytes)>>) {
        let (stream, chunk) = match res {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(error) => {
                debug!("error reading child output: {error}");
                return;
            }
        };

        match stream {
            ChildStream::Stdout => self.stdout.extend_from_slice(&chunk),
            ChildStream::Stderr => self.stderr.extend_from_slice(&chunk),
        }
        if self.relay {
            self.section.write(&chunk);
        }
        self.write_capture(&chunk).await;
    }

    async fn write_capture(&mut self, data: &[u8]) {
        if let Some((path, file)) = &mut self.capture {
            if let Err(error) = file.write_all(data).await {
                // Losing the capture file must not abort supervision of the test.
                tracing::warn!("failed to write to capture file `{path}`: {error}");
                self.capture = None;
            }
        }
    }

    /// Appends diagnostic lines to the capture file, if any.
    pub(super) async fn capture_lines(&mut self, lines: &[String]) {
        for line in lines {
            self.write_capture(line.as_bytes()).await;
            self.write_capture(b"\n").await;
        }
    }

    pub(super) fn section(&mut self) -> &mut TestSection {
        &mut *self.section
    }

    pub(super) fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub(super) fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Flushes the capture file and returns the accumulated output.
    pub(super) async fn finish(mut self) -> (Bytes, Bytes) {
        if let Some((path, file)) = &mut self.capture {
            if let Err(error) = file.flush().await {
                tracing::warn!("failed to flush capture file `{path}`: {error}");
            }
        }
        (self.stdout.freeze(), self.stderr.freeze())
    }
}

/// Races the child's exit, its output and the timeout, escalating to termination if the deadline
/// is reached first.
pub(super) async fn supervise(
    child: &mut Child,
    pipes: &mut ChildPipes,
    sink: &mut OutputSink<'_>,
    timeout: Duration,
    grace_period: Duration,
) -> io::Result<ChildExit> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let exit = loop {
        tokio::select! {
            res = pipes.read_chunk(), if !pipes.is_done() => sink.accept(res).await,
            status = child.wait() => break ChildExit::Exited(status?),
            () = &mut deadline => {
                os::terminate_child(child, pipes, sink, grace_period).await;
                break ChildExit::TimedOut;
            }
        }
    };

    let drain = async {
        while !pipes.is_done() {
            let res = pipes.read_chunk().await;
            sink.accept(res).await;
        }
    };
    if tokio::time::timeout(LEAK_TIMEOUT, drain).await.is_err() {
        debug!("child output pipes still open after exit, leaving them behind");
    }

    Ok(exit)
}
