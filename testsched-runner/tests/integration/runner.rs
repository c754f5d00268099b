// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use pretty_assertions::assert_eq;
use std::{sync::Arc, time::Duration};
use test_case::test_case;
use testsched_runner::{
    plugins::{CrashPlugin, FlakyMode, FlakyPlugin, PluginSet},
    reporter::TestStatus,
    runner::{AttemptStatus, LogCaptureDir, OutputPolicy, Runner, RunnerBuilder},
};

fn runner_with(plugins: PluginSet) -> Runner {
    let mut builder = RunnerBuilder::default();
    builder
        .set_plugins(plugins)
        .set_grace_period(Duration::from_millis(500));
    builder.build()
}

fn flaky(mode: FlakyMode) -> PluginSet {
    let mut plugins = PluginSet::new();
    plugins.push(Arc::new(FlakyPlugin::new(mode)));
    plugins
}

fn capturing(policy: OutputPolicy) -> Runner {
    let mut builder = RunnerBuilder::default();
    builder.set_output_policy(policy);
    builder.build()
}

#[tokio::test]
async fn passing_test_relays_output() {
    let scripts = ScriptDir::new();
    let request = scripts.request("tst_hello", "echo hello; echo oops >&2");
    let (verdict, transcript) = run(&runner_with(PluginSet::new()), &request).await;

    assert_eq!(verdict.status, TestStatus::Pass);
    assert_eq!(verdict.attempts.len(), 1);
    assert_eq!(verdict.attempts[0].stdout.as_ref(), b"hello\n");
    assert_eq!(verdict.attempts[0].stderr.as_ref(), b"oops\n");
    assert!(transcript.contains("hello\n"), "transcript: {transcript}");
    assert!(transcript.contains("oops\n"), "transcript: {transcript}");
}

#[tokio::test]
async fn exit_code_failure() {
    let scripts = ScriptDir::new();
    let request = scripts.request("tst_exit", "exit 3");
    let (verdict, transcript) = run(&runner_with(PluginSet::new()), &request).await;

    assert_eq!(verdict.status, TestStatus::Fail);
    assert_eq!(verdict.attempts[0].status, AttemptStatus::Exited { code: 3 });
    assert!(
        transcript.starts_with("tst_exit: exited with code 3 ["),
        "transcript: {transcript}"
    );
}

#[tokio::test]
async fn timeout_is_not_a_signal_death() {
    let scripts = ScriptDir::new();
    let mut request = scripts.request("tst_hang", "echo started; sleep 30");
    request.timeout = Duration::from_secs(1);

    let start = std::time::Instant::now();
    let (verdict, transcript) = run(&runner_with(PluginSet::new()), &request).await;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(verdict.status, TestStatus::Fail);
    assert_eq!(
        verdict.attempts[0].status,
        AttemptStatus::TimedOut {
            timeout: Duration::from_secs(1)
        }
    );
    assert!(transcript.contains("started\n"));
    assert!(
        transcript.contains("tst_hang: timed out after 1 second ["),
        "transcript: {transcript}"
    );
    assert!(!transcript.contains("killed by signal"));
}

#[tokio::test]
async fn timeout_escalates_to_sigkill() {
    let scripts = ScriptDir::new();
    let mut request = scripts.request("tst_stubborn", "trap '' TERM; sleep 30 & wait; sleep 30");
    request.timeout = Duration::from_secs(1);

    let start = std::time::Instant::now();
    let (verdict, _) = run(&runner_with(PluginSet::new()), &request).await;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(matches!(
        verdict.attempts[0].status,
        AttemptStatus::TimedOut { .. }
    ));
}

#[tokio::test]
async fn crash_without_report() {
    let scripts = ScriptDir::new();
    let request = scripts.request("tst_segv", "kill -SEGV $$");
    let mut plugins = PluginSet::new();
    plugins.push(Arc::new(
        CrashPlugin::new()
            .with_debugger(None)
            .with_crash_report_dir(None, Duration::ZERO),
    ));
    let (verdict, transcript) = run(&runner_with(plugins), &request).await;

    assert_eq!(verdict.status, TestStatus::Fail);
    let attempt = &verdict.attempts[0];
    assert!(
        matches!(attempt.status, AttemptStatus::Signaled { signal: 11, .. }),
        "status: {:?}",
        attempt.status
    );
    let pid = attempt.pid.expect("process was started");
    assert!(
        transcript.contains(&format!(
            "could not find a crash report for tst_segv (pid {pid})"
        )),
        "transcript: {transcript}"
    );
    assert!(transcript.contains("tst_segv: killed by signal 11 (SIGSEGV)"));
}

#[tokio::test]
async fn missing_command() {
    let scripts = ScriptDir::new();
    let mut request = scripts.request("tst_gone", "exit 0");
    request.command.program = scripts.path().join("does-not-exist").to_string();

    let (verdict, transcript) = run(&runner_with(PluginSet::new()), &request).await;
    assert_eq!(verdict.status, TestStatus::Fail);
    assert_eq!(
        verdict.attempts[0].status,
        AttemptStatus::SetupFailed {
            message: format!("command not found: {}", request.command.program)
        }
    );
    assert!(transcript.contains("command not found"));
}

#[test_case(FlakyMode::Best, TestStatus::FlakyPass { ignored: false } ; "best")]
#[test_case(FlakyMode::Worst, TestStatus::FlakyFail ; "worst")]
#[test_case(FlakyMode::Ignore, TestStatus::FlakyPass { ignored: true } ; "ignore")]
#[tokio::test]
async fn vanishing_failure(mode: FlakyMode, expected: TestStatus) {
    let scripts = ScriptDir::new();
    let request = scripts.request(
        "tst_vanishing",
        r#"if [ "$TESTSCHED_ATTEMPT" = 1 ]; then exit 1; fi"#,
    );
    let (verdict, transcript) = run(&runner_with(flaky(mode)), &request).await;

    assert_eq!(verdict.status, expected);
    assert_eq!(verdict.attempts.len(), 2);
    assert!(verdict.attempts[1].is_success());
    assert!(transcript.contains("tst_vanishing: retrying after failed attempt"));
    assert!(transcript.contains(&format!(
        "tst_vanishing: flaky (vanishing failure), mode {mode} applied"
    )));
}

#[test_case(FlakyMode::Best ; "best")]
#[test_case(FlakyMode::Worst ; "worst")]
#[test_case(FlakyMode::Ignore ; "ignore")]
#[tokio::test]
async fn stable_failure(mode: FlakyMode) {
    let scripts = ScriptDir::new();
    let request = scripts.request("tst_stable", "exit 2");
    let (verdict, transcript) = run(&runner_with(flaky(mode)), &request).await;

    assert_eq!(verdict.status, TestStatus::Fail);
    assert_eq!(verdict.attempts.len(), 2);
    assert_eq!(
        verdict.note.as_deref(),
        Some("failure confirmed reproducible: exited with code 2")
    );
    assert_eq!(
        transcript
            .matches("confirmed reproducible")
            .count(),
        1
    );
}

#[test_case(FlakyMode::Best, TestStatus::FlakyFail ; "best")]
#[test_case(FlakyMode::Worst, TestStatus::FlakyFail ; "worst")]
#[test_case(FlakyMode::Ignore, TestStatus::FlakyPass { ignored: true } ; "ignore")]
#[tokio::test]
async fn differing_failure(mode: FlakyMode, expected: TestStatus) {
    let scripts = ScriptDir::new();
    let request = scripts.request("tst_differing", r#"exit "$TESTSCHED_ATTEMPT""#);
    let (verdict, _) = run(&runner_with(flaky(mode)), &request).await;

    assert_eq!(verdict.status, expected);
    assert_eq!(
        verdict.failure_reasons(),
        vec!["exited with code 1", "exited with code 2"]
    );
}

#[tokio::test]
async fn retry_sees_same_arguments() {
    let scripts = ScriptDir::new();
    let mut request = scripts.request(
        "tst_args",
        r#"echo "attempt $TESTSCHED_ATTEMPT: $*"; exit 1"#,
    );
    request.command.args = vec!["-v2".to_owned(), "case".to_owned()];
    let (verdict, transcript) = run(&runner_with(flaky(FlakyMode::Worst)), &request).await;

    assert_eq!(verdict.status, TestStatus::Fail);
    assert!(transcript.contains("attempt 1: -v2 case\n"));
    assert!(transcript.contains("attempt 2: -v2 case\n"));
}

#[tokio::test]
async fn insignificant_failure() {
    let scripts = ScriptDir::new();
    let mut request = scripts.request("tst_meh", "exit 1");
    request.insignificant = true;
    let (verdict, _) = run(&runner_with(flaky(FlakyMode::Worst)), &request).await;
    assert_eq!(verdict.status, TestStatus::InsignificantFail);
}

#[tokio::test]
async fn capture_names_are_sequenced() {
    let scripts = ScriptDir::new();
    let logs = camino_tempfile::tempdir().unwrap();
    let capture = Arc::new(LogCaptureDir::create(logs.path()).unwrap());
    let runner = capturing(OutputPolicy::Capture(capture));
    let request = scripts.request("tst_cap", r#"echo "out $TESTSCHED_LOG_DIR"; echo err >&2"#);

    let (first, transcript) = run(&runner, &request).await;
    let (second, _) = run(&runner, &request).await;

    assert_eq!(first.status, TestStatus::Pass);
    assert_eq!(
        first.attempts[0].capture_file.as_deref(),
        Some(logs.path().join("tst_cap-00.txt").as_path())
    );
    assert_eq!(
        second.attempts[0].capture_file.as_deref(),
        Some(logs.path().join("tst_cap-01.txt").as_path())
    );
    let captured = std::fs::read_to_string(logs.path().join("tst_cap-00.txt")).unwrap();
    assert!(captured.contains(&format!("out {}\n", logs.path())));
    assert!(captured.contains("err\n"));
    // Captured output is not relayed.
    assert!(!transcript.contains("out "), "transcript: {transcript}");
}

#[tokio::test]
async fn tee_relays_and_captures() {
    let scripts = ScriptDir::new();
    let logs = camino_tempfile::tempdir().unwrap();
    let capture = Arc::new(LogCaptureDir::create(logs.path()).unwrap());
    let runner = capturing(OutputPolicy::Tee(capture));
    let request = scripts.request("tst_tee", "echo both");

    let (_, transcript) = run(&runner, &request).await;
    assert!(transcript.contains("both\n"));
    assert_eq!(
        std::fs::read_to_string(logs.path().join("tst_tee-00.txt")).unwrap(),
        "both\n"
    );
}

const WRITES_LOGS: &str = r#"
while [ $# -gt 0 ]; do
    if [ "$1" = -o ]; then
        echo '<testcase/>' > "${2%,*}"
        shift
    fi
    shift
done
"#;

#[tokio::test]
async fn log_arguments_are_rewritten() {
    let scripts = ScriptDir::new();
    let logs = camino_tempfile::tempdir().unwrap();
    let capture = Arc::new(LogCaptureDir::create(logs.path()).unwrap());
    let runner = capturing(OutputPolicy::Capture(capture));
    let mut request = scripts.request("tst_logs", WRITES_LOGS);
    request.command.args = vec![
        "-o".to_owned(),
        "results.xml,xml".to_owned(),
        "-o".to_owned(),
        "plain,txt".to_owned(),
    ];

    let (verdict, _) = run(&runner, &request).await;
    assert_eq!(verdict.status, TestStatus::Pass);

    let attempt = &verdict.attempts[0];
    let xml = logs.path().join("tst_logs-results-00.xml");
    let txt = logs.path().join("tst_logs-plain-00.txt");
    assert_eq!(attempt.log_files, vec![xml.clone(), txt.clone()]);
    assert_eq!(
        attempt.args,
        vec![
            "-o".to_owned(),
            format!("{xml},xml"),
            "-o".to_owned(),
            format!("{txt},txt"),
        ]
    );
    assert_eq!(std::fs::read_to_string(&xml).unwrap(), "<testcase/>\n");
    // With file logs only, no separate capture file is created.
    assert_eq!(attempt.capture_file, None);
    assert!(!logs.path().join("tst_logs-00.txt").exists());
}

#[tokio::test]
async fn output_next_to_file_logs_is_kept() {
    let scripts = ScriptDir::new();
    let logs = camino_tempfile::tempdir().unwrap();
    let capture = Arc::new(LogCaptureDir::create(logs.path()).unwrap());
    let runner = capturing(OutputPolicy::Capture(capture));
    let body = format!("echo 'stray warning' >&2\n{WRITES_LOGS}");
    let mut request = scripts.request("tst_chatty", &body);
    request.command.args = vec!["-o".to_owned(), "results.xml,xml".to_owned()];

    let (verdict, transcript) = run(&runner, &request).await;
    assert_eq!(verdict.status, TestStatus::Pass);
    assert!(!transcript.contains("stray warning"), "{transcript}");

    let attempt = &verdict.attempts[0];
    let stray = logs.path().join("tst_chatty-00.txt");
    assert_eq!(attempt.capture_file.as_ref(), Some(&stray));
    assert_eq!(std::fs::read_to_string(&stray).unwrap(), "stray warning\n");
    assert_eq!(
        std::fs::read_to_string(logs.path().join("tst_chatty-results-00.xml")).unwrap(),
        "<testcase/>\n"
    );
}

#[tokio::test]
async fn ignoring_log_arguments_is_badly_behaved() {
    let scripts = ScriptDir::new();
    let logs = camino_tempfile::tempdir().unwrap();
    let capture = Arc::new(LogCaptureDir::create(logs.path()).unwrap());
    let runner = capturing(OutputPolicy::Capture(capture));
    let mut request = scripts.request("tst_rude", "echo 'PASS: everything'; exit 0");
    request.command.args = vec!["-o".to_owned(), "out.xml,xml".to_owned()];

    let (verdict, transcript) = run(&runner, &request).await;
    assert_eq!(verdict.status, TestStatus::Fail);

    let log = logs.path().join("tst_rude-out-00.xml");
    assert_eq!(verdict.attempts[0].missing_logs, vec![log.clone()]);
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(
        contents.contains("tst_rude: badly behaved: test did not write its log file"),
        "log: {contents}"
    );
    assert!(contents.contains("--- stdout ---\nPASS: everything\n"));
    assert!(transcript.contains("tst_rude: badly behaved: test did not write its log file"));
}

#[tokio::test]
async fn stdout_log_is_captured_normally() {
    let scripts = ScriptDir::new();
    let logs = camino_tempfile::tempdir().unwrap();
    let capture = Arc::new(LogCaptureDir::create(logs.path()).unwrap());
    let runner = capturing(OutputPolicy::Capture(capture));
    let mut request = scripts.request("tst_stdout", "echo 'ok 1'");
    request.command.args = vec!["-o".to_owned(), "-,tap".to_owned()];

    let (verdict, _) = run(&runner, &request).await;
    assert_eq!(verdict.status, TestStatus::Pass);
    assert_eq!(verdict.attempts[0].args, vec!["-o", "-,tap"]);
    assert_eq!(
        std::fs::read_to_string(logs.path().join("tst_stdout-00.txt")).unwrap(),
        "ok 1\n"
    );
}

/// A QTestLib-style test: with `-o <file>,xml` it records `{failing}` as failed and exits 1; given
/// a function name it reruns just that function, which passes only for `flakyFunc`.
const QTEST_LIKE: &str = r#"
xml=""
func=""
while [ $# -gt 0 ]; do
    case "$1" in
        -o) case "$2" in *,xml) xml="${2%,*}" ;; esac; shift ;;
        *) func="$1" ;;
    esac
    shift
done
if [ -n "$func" ]; then
    echo "rerun $func"
    [ "$func" = flakyFunc ]
    exit
fi
echo "results at $TESTSCHED_RESULTS_PATH"
printf '%s\n' \
    '<TestCase name="tst_qt">' \
    '<TestFunction name="stableFunc"><Incident type="pass" file="" line="0"/></TestFunction>' \
    '<TestFunction name="{failing}"><Incident type="fail" file="tst_qt.cpp" line="7"/></TestFunction>' \
    '</TestCase>' > "$xml"
exit 1
"#;

fn rerunning_functions(repetitions: u32, capture: Arc<LogCaptureDir>) -> Runner {
    let mut plugins = PluginSet::new();
    plugins.push(Arc::new(
        FlakyPlugin::new(FlakyMode::Best).with_function_repetitions(repetitions),
    ));
    let mut builder = RunnerBuilder::default();
    builder
        .set_plugins(plugins)
        .set_output_policy(OutputPolicy::Capture(capture));
    builder.build()
}

#[tokio::test]
async fn failing_functions_are_rerun() {
    let scripts = ScriptDir::new();
    let logs = camino_tempfile::tempdir().unwrap();
    let capture = Arc::new(LogCaptureDir::create(logs.path()).unwrap());
    let runner = rerunning_functions(2, capture);
    let mut request = scripts.request("tst_qt", &QTEST_LIKE.replace("{failing}", "flakyFunc"));
    request.command.args = vec![
        "-maxwarnings".to_owned(),
        "0".to_owned(),
        "-o".to_owned(),
        "results.xml,xml".to_owned(),
    ];

    let (verdict, transcript) = run(&runner, &request).await;
    assert_eq!(
        verdict.status,
        TestStatus::FlakyPass { ignored: false },
        "{transcript}"
    );
    assert!(
        transcript.contains("tst_qt: rerunning failing function flakyFunc (2 times each)"),
        "{transcript}"
    );
    assert!(
        transcript.contains(
            "tst_qt: flaky (failing functions passed on rerun: flakyFunc), mode best applied"
        ),
        "{transcript}"
    );

    let xml = logs.path().join("tst_qt-results-00.xml");
    let first = &verdict.attempts[0];
    assert_eq!(
        String::from_utf8_lossy(&first.stdout),
        format!("results at {xml}\n")
    );

    // The whole test ran once, then the failing function twice on its own.
    assert_eq!(verdict.attempts.len(), 3);
    for rerun in &verdict.attempts[1..] {
        assert_eq!(rerun.attempt, 2);
        assert_eq!(
            rerun.args,
            vec!["-maxwarnings".to_owned(), "0".to_owned(), "flakyFunc".to_owned()]
        );
        assert_eq!(String::from_utf8_lossy(&rerun.stdout), "rerun flakyFunc\n");
    }
}

#[tokio::test]
async fn failing_function_that_fails_again_fails_the_test() {
    let scripts = ScriptDir::new();
    let logs = camino_tempfile::tempdir().unwrap();
    let capture = Arc::new(LogCaptureDir::create(logs.path()).unwrap());
    let runner = rerunning_functions(3, capture);
    let mut request = scripts.request("tst_qt", &QTEST_LIKE.replace("{failing}", "brokenFunc"));
    request.command.args = vec!["-o".to_owned(), "results.xml,xml".to_owned()];

    let (verdict, transcript) = run(&runner, &request).await;
    assert_eq!(verdict.status, TestStatus::Fail, "{transcript}");
    // The first failing rerun settles it.
    assert_eq!(verdict.attempts.len(), 2);
    assert_eq!(
        verdict.note.as_deref(),
        Some("failure confirmed reproducible in brokenFunc: exited with code 1")
    );
}

#[tokio::test]
async fn without_results_log_the_whole_test_is_retried() {
    let scripts = ScriptDir::new();
    let logs = camino_tempfile::tempdir().unwrap();
    let capture = Arc::new(LogCaptureDir::create(logs.path()).unwrap());
    let runner = rerunning_functions(2, capture);
    let request = scripts.request("tst_plain", "echo plain; exit 1");

    let (verdict, transcript) = run(&runner, &request).await;
    assert_eq!(verdict.status, TestStatus::Fail);
    assert_eq!(verdict.attempts.len(), 2);
    assert!(
        transcript.contains("tst_plain: retrying after failed attempt"),
        "{transcript}"
    );
}
