// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for testsched-runner.

use std::{fmt, time::Duration};

/// Utilities for pluralizing various words based on count.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "pass" if `count` is 1, otherwise "passes".
    pub fn passes_str(count: usize) -> &'static str {
        if count == 1 { "pass" } else { "passes" }
    }

    /// Returns "fail" if `count` is 1, otherwise "fails".
    pub fn fails_str(count: usize) -> &'static str {
        if count == 1 { "fail" } else { "fails" }
    }

    /// Returns "second" if `count` is 1, otherwise "seconds".
    pub fn seconds_str(count: u64) -> &'static str {
        if count == 1 { "second" } else { "seconds" }
    }
}

/// Writes `count` followed by a pluralized noun, using `no <plural>` for zero.
///
/// For example, `counted(0, plural::tests_str)` is `no tests` and
/// `counted(2, plural::passes_str)` is `2 passes`.
pub(crate) fn counted(count: usize, noun: fn(usize) -> &'static str) -> String {
    if count == 0 {
        format!("no {}", noun(0))
    } else {
        format!("{count} {}", noun(count))
    }
}

/// The maximum number of names displayed before eliding the middle of a list.
pub(crate) const ELIDE_THRESHOLD: usize = 6;

/// The number of names preserved at each end of an elided list.
pub(crate) const ELIDE_KEEP: usize = 3;

/// Joins names with `, `, eliding the middle of long lists as `[K other tests]`.
pub fn elide_names<S: AsRef<str>>(names: &[S]) -> String {
    if names.len() <= ELIDE_THRESHOLD {
        return names
            .iter()
            .map(|name| name.as_ref())
            .collect::<Vec<_>>()
            .join(", ");
    }

    let elided = names.len() - 2 * ELIDE_KEEP;
    let head = names[..ELIDE_KEEP].iter().map(|name| name.as_ref());
    let tail = names[names.len() - ELIDE_KEEP..]
        .iter()
        .map(|name| name.as_ref());
    let middle = format!("[{elided} other {}]", plural::tests_str(elided));

    head.chain(std::iter::once(middle.as_str()))
        .chain(tail)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct FormattedDuration(pub(crate) Duration);

impl fmt::Display for FormattedDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let duration = self.0.as_secs_f64();
        if duration > 60.0 {
            write!(f, "{}m {:.2}s", duration as u32 / 60, duration % 60.0)
        } else {
            write!(f, "{duration:.2}s")
        }
    }
}

/// Returns the abbreviated name of a signal, without the `SIG` prefix.
pub(crate) fn signal_str(signal: i32) -> Option<&'static str> {
    // These signal numbers are the same on at least Linux, macOS, FreeBSD and illumos.
    match signal {
        1 => Some("HUP"),
        2 => Some("INT"),
        3 => Some("QUIT"),
        4 => Some("ILL"),
        5 => Some("TRAP"),
        6 => Some("ABRT"),
        8 => Some("FPE"),
        9 => Some("KILL"),
        11 => Some("SEGV"),
        13 => Some("PIPE"),
        14 => Some("ALRM"),
        15 => Some("TERM"),
        _ => None,
    }
}

/// Returns the final path component of a command, which is used for log names and test names.
pub fn command_basename(command: &str) -> &str {
    let name = command
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(command);
    name.strip_suffix(".exe").unwrap_or(name)
}
