// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transcript: the stream of test output and diagnostic lines that testsched produces.
//!
//! Transcripts are distinct from logging. Test output, begin/end lines and the summary all go
//! here, so that callers which parse test output can rely on it.
//!
//! Each running test writes through its own [`TestSection`]. A synchronized section buffers
//! everything until [`TestSection::finish`], then writes it out under the transcript lock in one
//! piece, so two tests' output never interleave. An unsynchronized section writes through as soon
//! as data arrives.

use bytes::BytesMut;
use std::{
    io::{self, Write},
    sync::{Arc, Mutex, MutexGuard},
};

/// Where a transcript's bytes end up.
#[derive(Debug)]
enum TranscriptSink {
    /// Standard output.
    Terminal,
    /// An in-memory buffer, used for tests and for capturing a summary.
    Buffer(Vec<u8>),
    /// Dropped on the floor, used by parallel-stress runs.
    Discard,
}

/// A shared, thread-safe transcript.
#[derive(Clone, Debug)]
pub struct Transcript {
    sink: Arc<Mutex<TranscriptSink>>,
}

impl Transcript {
    /// Creates a transcript that writes to standard output.
    pub fn terminal() -> Self {
        Self::new(TranscriptSink::Terminal)
    }

    /// Creates a transcript that accumulates output in memory.
    pub fn buffer() -> Self {
        Self::new(TranscriptSink::Buffer(Vec::new()))
    }

    /// Creates a transcript that discards everything written to it.
    pub fn discard() -> Self {
        Self::new(TranscriptSink::Discard)
    }

    fn new(sink: TranscriptSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Returns the contents accumulated so far by a buffer transcript.
    ///
    /// Returns an empty vector for other kinds of transcripts.
    pub fn contents(&self) -> Vec<u8> {
        match &*self.lock() {
            TranscriptSink::Buffer(buf) => buf.clone(),
            TranscriptSink::Terminal | TranscriptSink::Discard => Vec::new(),
        }
    }

    /// Returns the contents of a buffer transcript as a lossily-decoded string.
    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    /// Writes `data` to the transcript as one unit.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        match &mut *self.lock() {
            TranscriptSink::Terminal => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(data)?;
                stdout.flush()
            }
            TranscriptSink::Buffer(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            TranscriptSink::Discard => Ok(()),
        }
    }

    /// Writes a single line, appending a newline.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write_all(&data)
    }

    /// Starts a section for one test.
    pub fn section(&self, synchronized: bool) -> TestSection {
        TestSection {
            transcript: self.clone(),
            buffered: synchronized.then(BytesMut::new),
            error: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TranscriptSink> {
        // A panic while holding the lock leaves the sink in a usable state.
        self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The part of a transcript that belongs to a single test.
///
/// Write errors are remembered rather than returned immediately, so that supervision of the test
/// is never interrupted by a broken transcript. The first error is reported by
/// [`finish`](Self::finish).
#[derive(Debug)]
pub struct TestSection {
    transcript: Transcript,
    buffered: Option<BytesMut>,
    error: Option<io::Error>,
}

impl TestSection {
    /// Returns true if this section holds its output until it is finished.
    pub fn is_synchronized(&self) -> bool {
        self.buffered.is_some()
    }

    /// Writes raw bytes produced by the test.
    pub fn write(&mut self, data: &[u8]) {
        match &mut self.buffered {
            Some(buf) => buf.extend_from_slice(data),
            None => {
                if let Err(error) = self.transcript.write_all(data) {
                    self.error.get_or_insert(error);
                }
            }
        }
    }

    /// Writes a diagnostic line.
    pub fn line(&mut self, line: &str) {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write(&data);
    }

    /// Flushes any buffered output to the transcript in one piece.
    pub fn finish(mut self) -> io::Result<()> {
        if let Some(buf) = self.buffered.take() {
            if !buf.is_empty() {
                if let Err(error) = self.transcript.write_all(&buf) {
                    self.error.get_or_insert(error);
                }
            }
        }
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
