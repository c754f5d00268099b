// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recording of test invocations on behalf of the planner.
//!
//! During discovery the build system runs `$TESTRUNNER <test> <args>` for each of its tests. The
//! planner points `TESTRUNNER` at testsched's hidden record subcommand, which writes one JSON
//! fragment per invocation instead of running the test.

use crate::errors::RecordError;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io::{self, Write},
};

/// The name of the hidden subcommand that records an invocation.
pub const RECORD_SUBCOMMAND: &str = "__record-test";

/// The prefix of environment variables through which the build system passes per-test metadata.
pub const TESTCASE_ENV_PREFIX: &str = "TESTCASE_";

/// A single test invocation as seen by the recorder.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecordedInvocation {
    /// The test program.
    pub command: String,

    /// Arguments passed to the test program.
    pub args: Vec<String>,

    /// The directory the build system ran the test in.
    pub cwd: Utf8PathBuf,

    /// `TESTCASE_*` environment variables set by the build system.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RecordedInvocation {
    /// Captures an invocation of `command` and `args` from the current process's environment.
    pub fn from_current_process(command: String, args: Vec<String>) -> Result<Self, RecordError> {
        let cwd = std::env::current_dir().map_err(RecordError::CurrentDir)?;
        let cwd = Utf8PathBuf::try_from(cwd)
            .map_err(|err| RecordError::CurrentDir(err.into_io_error()))?;
        let env = std::env::vars()
            .filter(|(key, _)| key.starts_with(TESTCASE_ENV_PREFIX))
            .collect();
        Ok(Self {
            command,
            args,
            cwd,
            env,
        })
    }

    /// Writes this invocation into a new fragment file in `fragment_dir`.
    ///
    /// Fragments are named after the time they were recorded and the recorder's process ID, so
    /// concurrent recorders (as with `make -j`) never overwrite each other's fragments and the
    /// planner can restore recording order.
    pub fn write_fragment(&self, fragment_dir: &Utf8Path) -> Result<Utf8PathBuf, RecordError> {
        let create_err = |err| RecordError::Create {
            dir: fragment_dir.to_owned(),
            err,
        };
        std::fs::create_dir_all(fragment_dir).map_err(create_err)?;

        let pid = std::process::id();
        let mut nanos = Utc::now()
            .timestamp_nanos_opt()
            .and_then(|nanos| u64::try_from(nanos).ok())
            .unwrap_or_default();
        let (path, mut file) = loop {
            let path = fragment_dir.join(format!("invocation-{nanos:020}-{pid}.json"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                // Only this process writes names with its pid: move past its own earlier fragment.
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => nanos += 1,
                Err(err) => return Err(create_err(err)),
            }
        };

        let json = serde_json::to_vec_pretty(self).map_err(|err| RecordError::Write {
            path: path.clone(),
            err: err.into(),
        })?;
        file.write_all(&json).map_err(|err| RecordError::Write {
            path: path.clone(),
            err,
        })?;
        Ok(path)
    }
}

/// The order key of a fragment: its recording time in nanoseconds, then the recorder's pid.
pub(crate) type FragmentKey = (u64, u32);

/// Parses the order key out of a fragment's file name.
pub(crate) fn fragment_key(file_name: &str) -> Option<FragmentKey> {
    let (nanos, pid) = file_name
        .strip_prefix("invocation-")?
        .strip_suffix(".json")?
        .split_once('-')?;
    Some((nanos.parse().ok()?, pid.parse().ok()?))
}
