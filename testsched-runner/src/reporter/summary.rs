// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rendering of the end-of-run summary.

use super::{ResultSet, StressVerdict, TestStatus};
use crate::helpers::{FormattedDuration, counted, elide_names, plural};
use owo_colors::{OwoColorize, Style};
use swrite::{SWrite, swrite, swriteln};

/// Styles used when rendering the summary.
#[derive(Clone, Debug, Default)]
pub struct Styles {
    is_colorized: bool,
    header: Style,
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
}

impl Styles {
    /// Enables colors.
    pub fn colorize(&mut self) {
        self.is_colorized = true;
        self.header = Style::new().bold();
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
    }
}

impl ResultSet {
    /// Renders the summary: timing, failures, flakiness and stress sections, followed by the
    /// totals line, which is always last.
    pub fn write_summary(&self, styles: &Styles) -> String {
        let mut out = String::new();
        if !self.is_empty() {
            self.write_timing(styles, &mut out);
        }
        self.write_failures(styles, &mut out);
        self.write_flaky(styles, &mut out);
        self.write_stress(styles, &mut out);
        self.write_totals(styles, &mut out);
        out
    }

    fn write_timing(&self, styles: &Styles, out: &mut String) {
        let timing = self.timing();
        write_header("Timing:", styles, out);
        swriteln!(out, "wall time: {}", FormattedDuration(timing.wall));
        swriteln!(out, "serial tests: {}", FormattedDuration(timing.serial_wall));
        if let Some(saved) = self.time_saved() {
            swriteln!(
                out,
                "parallel tests: {} (serial equivalent {}, saved {})",
                FormattedDuration(timing.parallel_wall),
                FormattedDuration(self.parallel_serial_equivalent()),
                FormattedDuration(saved),
            );
        }
        let insignificant = self.insignificant_time();
        if !insignificant.is_zero() {
            swriteln!(
                out,
                "insignificant tests: {}",
                FormattedDuration(insignificant)
            );
        }
    }

    fn write_failures(&self, styles: &Styles, out: &mut String) {
        let failures: Vec<_> = self
            .outcomes()
            .filter(|o| o.status.is_failure() || o.status == TestStatus::InsignificantFail)
            .collect();
        if failures.is_empty() {
            return;
        }

        write_header("Failures:", styles, out);
        for outcome in failures {
            let style = if outcome.status.is_failure() {
                styles.fail
            } else {
                styles.skip
            };
            swrite!(out, "{}", outcome.name.style(style));
            if !outcome.reasons.is_empty() {
                swrite!(out, ": {}", outcome.reasons.join("; "));
            }
            if outcome.status == TestStatus::InsignificantFail {
                swrite!(out, " [insignificant]");
            }
            if !outcome.concurrent_with.is_empty() {
                swrite!(
                    out,
                    " (run concurrently with {})",
                    elide_names(&outcome.concurrent_with)
                );
            }
            out.push('\n');
        }
    }

    fn write_flaky(&self, styles: &Styles, out: &mut String) {
        let flaky: Vec<_> = self.outcomes().filter(|o| o.status.is_flaky()).collect();
        if flaky.is_empty() {
            return;
        }

        write_header("Flaky:", styles, out);
        for outcome in flaky {
            swrite!(
                out,
                "{} [{}]",
                outcome.name.style(styles.skip),
                outcome.status
            );
            if let Some(note) = &outcome.note {
                swrite!(out, ": {note}");
            }
            out.push('\n');
        }
    }

    fn write_stress(&self, styles: &Styles, out: &mut String) {
        let Some(report) = self.stress_report() else {
            return;
        };

        write_header("Parallel stress:", styles, out);
        for verdict in [
            StressVerdict::Candidate,
            StressVerdict::Unsafe,
            StressVerdict::Unknown,
        ] {
            let names: Vec<_> = report.with_verdict(verdict).collect();
            if names.is_empty() {
                continue;
            }
            let style = match verdict {
                StressVerdict::Candidate => styles.pass,
                StressVerdict::Unsafe => styles.fail,
                StressVerdict::Unknown => styles.skip,
            };
            swriteln!(
                out,
                "{} ({}): {}",
                verdict.as_str().style(style),
                names.len().style(styles.count),
                names.join(", ")
            );
        }
    }

    fn write_totals(&self, styles: &Styles, out: &mut String) {
        let totals = self.totals();
        let mut parts = vec![
            counted(totals.tests, plural::tests_str)
                .style(styles.count)
                .to_string(),
            counted(totals.passes, plural::passes_str)
                .style(styles.pass)
                .to_string(),
        ];
        if totals.fails > 0 {
            parts.push(
                counted(totals.fails, plural::fails_str)
                    .style(styles.fail)
                    .to_string(),
            );
        }
        if totals.insignificant_fails > 0 {
            parts.push(
                format!(
                    "{} insignificant {}",
                    totals.insignificant_fails,
                    plural::fails_str(totals.insignificant_fails)
                )
                .style(styles.skip)
                .to_string(),
            );
        }
        swriteln!(
            out,
            "{} {} {}",
            "=== Totals:".style(styles.header),
            parts.join(", "),
            "===".style(styles.header)
        );
    }
}

fn write_header(title: &str, styles: &Styles, out: &mut String) {
    swriteln!(out, "{}", format!("=== {title} ===").style(styles.header));
}
