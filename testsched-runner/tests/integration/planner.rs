// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use testsched_metadata::TestPlan;
use testsched_runner::{errors::PlanBuildError, planner::PlannerBuilder};

/// A stand-in for testsched's record subcommand: writes a fragment for the test after `--`.
const FAKE_RECORDER: &str = r#"
[ "$1" = __record-test ] && [ "$2" = --fragment-dir ] && [ "$4" = -- ] || exit 64
dir="$3"
shift 4
command="$1"
shift
args=""
for arg in "$@"; do
    args="$args${args:+,}\"$arg\""
done
seq=$(printf '%020d' $(($(ls "$dir" | wc -l))))
printf '{"command":"%s","args":[%s],"cwd":"%s","env":{"TESTCASE_TIMEOUT":"%s"}}' \
    "$command" "$args" "$PWD" "${TESTCASE_TIMEOUT:-}" > "$dir/invocation-$seq-$$.json"
"#;

/// A make that runs two tests in subdirectories, the way `make check` would.
const FAKE_MAKE: &str = indoc! {r#"
    [ "$1" = -k ] && [ "$2" = check ] || exit 64
    cd one && TESTCASE_TIMEOUT=45 $TESTRUNNER ./tst_alpha -v2 && cd ..
    cd two && $TESTRUNNER ./tst_beta
"#};

#[test]
fn discovers_tests_through_make() -> Result<()> {
    let scripts = ScriptDir::new();
    let recorder = scripts.script("recorder", FAKE_RECORDER);
    let make = scripts.script("fake-make", FAKE_MAKE);

    let root = camino_tempfile::tempdir()?;
    std::fs::create_dir(root.path().join("one"))?;
    std::fs::create_dir(root.path().join("two"))?;
    std::fs::write(
        root.path().join("two/testsched.toml"),
        "parallel-safe = true\ninsignificant = true\n",
    )?;

    let plan = PlannerBuilder::new(root.path())
        .set_make(make.as_str())
        .add_make_args(["-k"])
        .set_default_timeout_secs(120)
        .set_recorder(recorder)
        .build()?
        .build_plan()?;

    assert_eq!(plan.len(), 2);
    assert_eq!(plan.default_timeout_secs(), 120);

    let alpha = plan.get("tst_alpha").expect("alpha was discovered");
    assert_eq!(alpha.command, "./tst_alpha");
    assert_eq!(alpha.args, vec!["-v2"]);
    assert_eq!(
        alpha.cwd.canonicalize_utf8()?,
        root.path().join("one").canonicalize_utf8()?
    );
    assert_eq!(alpha.timeout_secs, Some(45));
    assert!(!alpha.parallel_safe);

    let beta = plan.get("tst_beta").expect("beta was discovered");
    assert_eq!(beta.timeout_secs, None);
    assert!(beta.parallel_safe);
    assert!(beta.insignificant);

    // The plan survives a trip through its file format.
    let reread = TestPlan::parse(&plan.to_plan_string())?;
    assert_eq!(reread.entries(), plan.entries());
    Ok(())
}

#[test]
fn empty_tree() -> Result<()> {
    let scripts = ScriptDir::new();
    let make = scripts.script("fake-make", "exit 0");
    let root = camino_tempfile::tempdir()?;

    let plan = PlannerBuilder::new(root.path())
        .set_make(make.as_str())
        .set_recorder("/bin/false")
        .build()?
        .build_plan()?;
    assert!(plan.is_empty());
    Ok(())
}

#[test]
fn make_failure_is_an_error() -> Result<()> {
    let scripts = ScriptDir::new();
    let make = scripts.script("fake-make", "echo 'no rule to make target' >&2; exit 2");
    let root = camino_tempfile::tempdir()?;

    let err = PlannerBuilder::new(root.path())
        .set_make(make.as_str())
        .set_recorder("/bin/false")
        .build()?
        .build_plan()
        .unwrap_err();
    match err {
        PlanBuildError::MakeFailed { command, status } => {
            assert!(command.ends_with("fake-make check"), "command: {command}");
            assert_eq!(status, "exited with code 2");
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}
