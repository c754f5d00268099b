// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use testsched_metadata::TestPlan;
use testsched_runner::{
    plugins::{FlakyMode, FlakyPlugin, PluginSet},
    reporter::{ResultSet, StressVerdict, TestStatus},
    runner::RunnerBuilder,
    scheduler::SchedulerBuilder,
    transcript::Transcript,
};

fn execute(plan: &TestPlan, configure: impl FnOnce(&mut SchedulerBuilder)) -> (ResultSet, String) {
    let mut builder = SchedulerBuilder::new(RunnerBuilder::default());
    configure(&mut builder);
    let transcript = Transcript::buffer();
    let scheduler = builder.build(transcript.clone()).expect("built scheduler");
    let results = scheduler.execute(plan).expect("executed plan");
    (results, transcript.contents_lossy())
}

fn last_line(transcript: &str) -> &str {
    transcript.lines().last().unwrap_or_default()
}

#[test]
fn single_passing_test() {
    let scripts = ScriptDir::new();
    let plan = plan([scripts.entry("tst_one", "echo one line")]);
    let (results, transcript) = execute(&plan, |_| {});

    assert!(results.is_success());
    assert!(transcript.starts_with("one line\n"), "transcript: {transcript}");
    assert_eq!(last_line(&transcript), "=== Totals: 1 test, 1 pass ===");
}

#[test]
fn mixed_outcomes_totals() {
    let scripts = ScriptDir::new();
    let mut insignificant = scripts.entry("tst_i1", "exit 1");
    insignificant.insignificant = true;
    let plan = plan([
        scripts.entry("tst_p1", "exit 0"),
        scripts.entry("tst_f1", "exit 1"),
        scripts.entry("tst_p2", "exit 0"),
        insignificant,
        scripts.entry("tst_f2", "exit 2"),
        scripts.entry("tst_p3", "exit 0"),
    ]);
    let (results, transcript) = execute(&plan, |_| {});

    assert!(!results.is_success());
    assert_eq!(
        last_line(&transcript),
        "=== Totals: 6 tests, 3 passes, 2 fails, 1 insignificant fail ==="
    );
    assert_eq!(results.failed_names(), vec!["tst_f1", "tst_i1", "tst_f2"]);
    assert!(transcript.contains("tst_i1: exited with code 1 [insignificant]"));
}

#[test]
fn insignificant_failure_succeeds() {
    let scripts = ScriptDir::new();
    let mut entry = scripts.entry("tst_meh", "exit 1");
    entry.insignificant = true;
    let (results, transcript) = execute(&plan([entry]), |_| {});

    assert!(results.is_success());
    assert_eq!(
        last_line(&transcript),
        "=== Totals: 1 test, no passes, 1 insignificant fail ==="
    );
}

#[test]
fn zero_tests() {
    let (results, transcript) = execute(&TestPlan::default(), |_| {});
    assert!(results.is_success());
    assert_eq!(transcript, "=== Totals: no tests, no passes ===\n");
}

#[test]
fn no_summary() {
    let scripts = ScriptDir::new();
    let plan = plan([scripts.entry("tst_fail", "echo raw; exit 1")]);
    let (results, transcript) = execute(&plan, |builder| {
        builder.set_summary(false);
    });
    assert!(!results.is_success());
    assert_eq!(transcript, "raw\n");
}

#[test]
fn timeout_attribution() {
    let scripts = ScriptDir::new();
    let mut entry = scripts.entry("tst_hang", "sleep 30");
    entry.timeout_secs = Some(1);
    let (results, transcript) = execute(&plan([entry]), |_| {});

    assert!(!results.is_success());
    assert_eq!(
        results.get("tst_hang").unwrap().reasons,
        vec!["timed out after 1 second"]
    );
    assert!(transcript.contains("=== Failures: ===\ntst_hang: timed out after 1 second\n"));
}

#[test]
fn concurrency_is_bounded() -> Result<()> {
    let scripts = ScriptDir::new();
    let journal = scripts.path().join("journal");
    let entries = (0..6).map(|i| {
        let mut entry = scripts.entry(
            &format!("tst_par{i}"),
            &format!("echo start >> '{journal}'; sleep 0.3; echo end >> '{journal}'"),
        );
        entry.parallel_safe = true;
        entry
    });
    let (results, _) = execute(&plan(entries), |builder| {
        builder.set_concurrency(2);
    });
    ensure!(results.is_success(), "all parallel tests pass");

    let journal = std::fs::read_to_string(&journal)?;
    let mut running = 0_i32;
    let mut peak = 0;
    for line in journal.lines() {
        match line {
            "start" => running += 1,
            "end" => running -= 1,
            other => panic!("unexpected journal line {other:?}"),
        }
        peak = peak.max(running);
    }
    ensure!(peak <= 2, "at most 2 tests ran at once, saw {peak}");
    assert_eq!(journal.lines().count(), 12);
    Ok(())
}

#[test]
fn serial_phase_follows_parallel_pool() -> Result<()> {
    let scripts = ScriptDir::new();
    let journal = scripts.path().join("journal");
    let journaled = |label: &str, secs: &str| {
        format!("echo \"start {label}\" >> '{journal}'; sleep {secs}; echo \"end {label}\" >> '{journal}'")
    };
    let serial = |name: &str| scripts.entry(name, &journaled(name, "0.05"));
    let parallel = |name: &str| {
        let mut entry = scripts.entry(name, &journaled(name, "0.3"));
        entry.parallel_safe = true;
        entry
    };
    let mut with_subtests = scripts.entry("tst_parsub", &journaled("sub $1", "0.1"));
    with_subtests.parallel_safe = true;
    with_subtests.subtests = vec!["one".to_owned(), "two".to_owned(), "three".to_owned()];

    // Serial and parallel-safe entries are interleaved in the plan.
    let plan = plan([
        serial("tst_ser_a"),
        parallel("tst_par0"),
        serial("tst_ser_b"),
        with_subtests,
        parallel("tst_par1"),
        serial("tst_ser_c"),
        parallel("tst_par2"),
    ]);
    let (results, _) = execute(&plan, |builder| {
        builder.set_concurrency(4);
    });
    ensure!(results.is_success(), "all tests pass");

    let journal = std::fs::read_to_string(&journal)?;
    let events: Vec<(&str, &str)> = journal
        .lines()
        .map(|line| line.split_once(' ').expect("journal lines are `start|end label`"))
        .collect();
    assert_eq!(events.len(), 2 * 9, "journal:\n{journal}");

    let is_serial = |label: &str| label.starts_with("tst_ser");
    let last_parallel_end = events
        .iter()
        .rposition(|&(event, label)| event == "end" && !is_serial(label))
        .expect("parallel tests ran");
    let first_serial_start = events
        .iter()
        .position(|&(event, label)| event == "start" && is_serial(label))
        .expect("serial tests ran");
    ensure!(
        first_serial_start > last_parallel_end,
        "serial tests start after the parallel pool drains:\n{journal}"
    );

    // The serial phase runs one test at a time, in plan order.
    let serial_events: Vec<_> = events[first_serial_start..].to_vec();
    assert_eq!(
        serial_events,
        vec![
            ("start", "tst_ser_a"),
            ("end", "tst_ser_a"),
            ("start", "tst_ser_b"),
            ("end", "tst_ser_b"),
            ("start", "tst_ser_c"),
            ("end", "tst_ser_c"),
        ]
    );

    // Subtests of a parallel-safe entry never overlap each other.
    let subtest_events: Vec<_> = events
        .iter()
        .filter(|(_, label)| label.starts_with("sub "))
        .collect();
    assert_eq!(
        subtest_events,
        vec![
            &("start", "sub one"),
            &("end", "sub one"),
            &("start", "sub two"),
            &("end", "sub two"),
            &("start", "sub three"),
            &("end", "sub three"),
        ]
    );
    Ok(())
}

#[test]
fn synchronized_output_does_not_interleave() -> Result<()> {
    let scripts = ScriptDir::new();
    let names = ["tst_a", "tst_b", "tst_c"];
    let entries = names.iter().map(|name| {
        let mut entry = scripts.entry(
            name,
            &format!("for i in 1 2 3 4 5; do echo \"{name} $i\"; sleep 0.05; done"),
        );
        entry.parallel_safe = true;
        entry
    });
    let (results, transcript) = execute(&plan(entries), |builder| {
        builder.set_concurrency(3).set_sync_output(true);
    });
    ensure!(results.is_success(), "all tests pass");

    let test_lines: Vec<&str> = transcript
        .lines()
        .filter(|line| line.starts_with("tst_"))
        .collect();
    assert_eq!(test_lines.len(), 15);
    for chunk in test_lines.chunks(5) {
        let owner = chunk[0].split(' ').next().unwrap_or_default();
        for (i, line) in chunk.iter().enumerate() {
            ensure!(
                *line == format!("{owner} {}", i + 1),
                "interleaved output: {transcript}"
            );
        }
    }
    Ok(())
}

#[test]
fn parallel_failure_lists_concurrent_tests() {
    let scripts = ScriptDir::new();
    let mut entries = vec![{
        let mut entry = scripts.entry("tst_racy", "sleep 1; exit 1");
        entry.parallel_safe = true;
        entry
    }];
    entries.extend((1..=9).map(|i| {
        let mut entry = scripts.entry(&format!("tst_{i}"), "sleep 1");
        entry.parallel_safe = true;
        entry
    }));
    let (results, transcript) = execute(&plan(entries), |builder| {
        builder.set_concurrency(10);
    });

    let racy = results.get("tst_racy").unwrap();
    assert_eq!(racy.status, TestStatus::Fail);
    assert_eq!(racy.concurrent_with.len(), 9);
    assert!(
        transcript.contains(
            "tst_racy: run concurrently with tst_1, tst_2, tst_3, [3 other tests], tst_7, tst_8, \
             tst_9"
        ),
        "transcript: {transcript}"
    );
    assert!(transcript.contains("parallel tests: "));
}

#[test]
fn subtests_are_separate_outcomes() {
    let scripts = ScriptDir::new();
    let mut entry = scripts.entry("tst_sub", r#"[ "$1" = broken ] && exit 1; exit 0"#);
    entry.subtests = vec!["works".to_owned(), "broken".to_owned()];
    let (results, transcript) = execute(&plan([entry]), |_| {});

    let statuses: Vec<_> = results
        .outcomes()
        .map(|outcome| (outcome.name.as_str(), outcome.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("tst_sub (works)", TestStatus::Pass),
            ("tst_sub (broken)", TestStatus::Fail),
        ]
    );
    assert_eq!(
        last_line(&transcript),
        "=== Totals: 2 tests, 1 pass, 1 fail ==="
    );
}

#[test]
fn flaky_ignore_mode_succeeds() {
    let scripts = ScriptDir::new();
    let plan = plan([scripts.entry(
        "tst_flaky",
        r#"if [ "$TESTSCHED_ATTEMPT" = 1 ]; then exit 1; fi"#,
    )]);
    let mut plugins = PluginSet::new();
    plugins.push(Arc::new(FlakyPlugin::new(FlakyMode::Ignore)));
    let mut runner = RunnerBuilder::default();
    runner.set_plugins(plugins);

    let transcript = Transcript::buffer();
    let results = SchedulerBuilder::new(runner)
        .build(transcript.clone())
        .unwrap()
        .execute(&plan)
        .unwrap();
    let transcript = transcript.contents_lossy();

    assert!(results.is_success());
    assert!(transcript.contains(
        "=== Flaky: ===\ntst_flaky [flaky pass (ignored)]: flaky (vanishing failure), mode \
         ignore applied\n"
    ));
    assert_eq!(last_line(&transcript), "=== Totals: 1 test, 1 pass ===");
}

#[test]
fn verbose_lines() {
    let scripts = ScriptDir::new();
    let plan = plan([scripts.entry("tst_v", "echo body")]);
    let (_, transcript) = execute(&plan, |builder| {
        builder.set_verbose(true);
    });

    let lines: Vec<_> = transcript.lines().collect();
    assert!(lines[0].contains("] begin test tst_v: "), "transcript: {transcript}");
    assert_eq!(lines[1], "body");
    assert!(
        lines[2].contains("] end test tst_v: ") && lines[2].ends_with(", exited with code 0, pass"),
        "transcript: {transcript}"
    );
}

#[test]
fn parallel_stress_report() {
    let scripts = ScriptDir::new();
    let marker = scripts.path().join("busy");
    // Fails whenever another copy of a stress-sensitive test is running at the same time.
    let sensitive = format!(
        "if ! mkdir '{marker}' 2>/dev/null; then exit 1; fi; sleep 0.5; rmdir '{marker}'"
    );
    let plan = plan([
        scripts.entry("tst_serial_ok", "exit 0"),
        scripts.entry("tst_lock_a", &sensitive),
        scripts.entry("tst_lock_b", &sensitive),
        scripts.entry("tst_broken", "exit 1"),
    ]);
    let (results, transcript) = execute(&plan, |builder| {
        builder.set_concurrency(4).set_parallel_stress(true);
    });

    // The stress pass does not change the ordinary verdicts.
    assert_eq!(results.totals().passes, 3);
    let report = results.stress_report().expect("stress pass ran");
    let verdict = |name: &str| {
        report
            .verdicts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    };
    assert_eq!(verdict("tst_serial_ok"), Some(StressVerdict::Candidate));
    assert_eq!(verdict("tst_broken"), Some(StressVerdict::Unknown));
    // At least one of the two lock-sensitive tests loses the race under stress.
    assert!(
        verdict("tst_lock_a") == Some(StressVerdict::Unsafe)
            || verdict("tst_lock_b") == Some(StressVerdict::Unsafe),
        "transcript: {transcript}"
    );
    assert!(transcript.contains("=== Parallel stress: ===\n"));
}
