// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plan generation: discovering tests through the project's own build system.
//!
//! The planner runs `make check` in the build tree with `TESTRUNNER` pointing at testsched's
//! hidden record subcommand. Each test the build system would have run is recorded instead, and
//! the recordings are turned into a [`TestPlan`], with metadata taken from the environment the
//! build system set and from `testsched.toml` files.

mod config;
mod record;

pub use config::CONFIG_FILE_NAME;
pub use record::{RECORD_SUBCOMMAND, RecordedInvocation, TESTCASE_ENV_PREFIX};

use crate::{errors::PlanBuildError, helpers::command_basename};
use camino::{Utf8Path, Utf8PathBuf};
use config::{DirConfig, TestSettings};
use std::collections::{BTreeMap, HashMap};
use testsched_metadata::{TestPlan, TestPlanEntry};
use tracing::{debug, info, warn};

/// The environment variable through which the build system is told how to run tests.
pub const TESTRUNNER_ENV: &str = "TESTRUNNER";

/// Builder for [`Planner`].
#[derive(Clone, Debug)]
pub struct PlannerBuilder {
    build_root: Utf8PathBuf,
    make: String,
    make_args: Vec<String>,
    default_timeout_secs: u64,
    recorder: Option<Utf8PathBuf>,
}

impl PlannerBuilder {
    /// Creates a new builder for the build tree rooted at `build_root`.
    pub fn new(build_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            make: "make".to_owned(),
            make_args: Vec::new(),
            default_timeout_secs: TestPlan::DEFAULT_TIMEOUT_SECS,
            recorder: None,
        }
    }

    /// Sets the make program.
    pub fn set_make(&mut self, make: impl Into<String>) -> &mut Self {
        self.make = make.into();
        self
    }

    /// Adds arguments passed to make before the `check` target.
    pub fn add_make_args(&mut self, args: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.make_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the default timeout written into the plan.
    pub fn set_default_timeout_secs(&mut self, secs: u64) -> &mut Self {
        self.default_timeout_secs = secs;
        self
    }

    /// Sets the executable that provides the record subcommand. Defaults to the current
    /// executable.
    pub fn set_recorder(&mut self, recorder: impl Into<Utf8PathBuf>) -> &mut Self {
        self.recorder = Some(recorder.into());
        self
    }

    /// Creates the planner, resolving the recorder executable.
    pub fn build(&self) -> Result<Planner, PlanBuildError> {
        if !self.build_root.is_dir() {
            return Err(PlanBuildError::BuildDirMissing {
                dir: self.build_root.clone(),
            });
        }
        let recorder = match &self.recorder {
            Some(recorder) => recorder.clone(),
            None => {
                let exe = std::env::current_exe().map_err(PlanBuildError::CurrentExe)?;
                Utf8PathBuf::try_from(exe)
                    .map_err(|err| PlanBuildError::CurrentExe(err.into_io_error()))?
            }
        };

        Ok(Planner {
            build_root: self.build_root.clone(),
            make: self.make.clone(),
            make_args: self.make_args.clone(),
            default_timeout_secs: self.default_timeout_secs,
            recorder,
        })
    }
}

/// Discovers the tests in a build tree and produces a [`TestPlan`].
#[derive(Clone, Debug)]
pub struct Planner {
    build_root: Utf8PathBuf,
    make: String,
    make_args: Vec<String>,
    default_timeout_secs: u64,
    recorder: Utf8PathBuf,
}

impl Planner {
    /// Runs discovery and builds the plan.
    pub fn build_plan(&self) -> Result<TestPlan, PlanBuildError> {
        let fragment_dir = camino_tempfile::Builder::new()
            .prefix("testsched-plan-")
            .tempdir()
            .map_err(PlanBuildError::TempDir)?;

        self.run_make(fragment_dir.path())?;
        let invocations = read_fragments(fragment_dir.path())?;
        info!(
            "discovered {} test {} in `{}`",
            invocations.len(),
            if invocations.len() == 1 {
                "invocation"
            } else {
                "invocations"
            },
            self.build_root
        );

        plan_from_invocations(&self.build_root, self.default_timeout_secs, invocations)
    }

    /// Returns the `TESTRUNNER` value handed to the build system.
    pub fn testrunner_value(&self, fragment_dir: &Utf8Path) -> String {
        shell_words::join([
            self.recorder.as_str(),
            RECORD_SUBCOMMAND,
            "--fragment-dir",
            fragment_dir.as_str(),
            "--",
        ])
    }

    fn run_make(&self, fragment_dir: &Utf8Path) -> Result<(), PlanBuildError> {
        let args: Vec<&str> = self
            .make_args
            .iter()
            .map(String::as_str)
            .chain(std::iter::once("check"))
            .collect();
        let command =
            shell_words::join(std::iter::once(self.make.as_str()).chain(args.iter().copied()));
        debug!("running `{command}` in `{}`", self.build_root);

        // The build's own output would get mixed up with a plan written to stdout.
        let output = duct::cmd(self.make.as_str(), args)
            .dir(self.build_root.as_std_path())
            .env(TESTRUNNER_ENV, self.testrunner_value(fragment_dir))
            .stdout_to_stderr()
            .unchecked()
            .run()
            .map_err(|err| PlanBuildError::MakeExec {
                command: command.clone(),
                err,
            })?;

        if !output.status.success() {
            let status = match output.status.code() {
                Some(code) => format!("exited with code {code}"),
                None => "was terminated by a signal".to_owned(),
            };
            return Err(PlanBuildError::MakeFailed { command, status });
        }
        Ok(())
    }
}

fn read_fragments(dir: &Utf8Path) -> Result<Vec<RecordedInvocation>, PlanBuildError> {
    let entries = dir.read_dir_utf8().map_err(|err| PlanBuildError::FragmentRead {
        path: dir.to_owned(),
        err,
    })?;

    let mut fragments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PlanBuildError::FragmentRead {
            path: dir.to_owned(),
            err,
        })?;
        match record::fragment_key(entry.file_name()) {
            Some(key) => fragments.push((key, entry.path().to_owned())),
            None => debug!("ignoring unexpected file `{}`", entry.path()),
        }
    }
    fragments.sort_by_key(|(key, _)| *key);

    fragments
        .into_iter()
        .map(|(_, path)| {
            let contents =
                std::fs::read(&path).map_err(|err| PlanBuildError::FragmentRead {
                    path: path.clone(),
                    err,
                })?;
            serde_json::from_slice(&contents)
                .map_err(|err| PlanBuildError::FragmentParse { path, err })
        })
        .collect()
}

/// Turns recorded invocations into a plan.
///
/// Tests are named after their command's basename. When several tests share a basename, each is
/// qualified with its directory relative to the build root. Identical invocations are recorded
/// only once.
pub(crate) fn plan_from_invocations(
    build_root: &Utf8Path,
    default_timeout_secs: u64,
    invocations: Vec<RecordedInvocation>,
) -> Result<TestPlan, PlanBuildError> {
    let mut unique: Vec<RecordedInvocation> = Vec::with_capacity(invocations.len());
    for invocation in invocations {
        if unique.contains(&invocation) {
            debug!(
                "ignoring repeated invocation of `{}` in `{}`",
                invocation.command, invocation.cwd
            );
            continue;
        }
        unique.push(invocation);
    }

    let mut basename_counts: HashMap<&str, usize> = HashMap::new();
    for invocation in &unique {
        *basename_counts
            .entry(command_basename(&invocation.command))
            .or_default() += 1;
    }

    let mut configs: BTreeMap<Utf8PathBuf, Option<DirConfig>> = BTreeMap::new();
    let mut plan = TestPlan::new(default_timeout_secs);
    for invocation in &unique {
        let basename = command_basename(&invocation.command);
        let name = if basename_counts[basename] > 1 {
            let rel = invocation
                .cwd
                .strip_prefix(build_root)
                .unwrap_or(&invocation.cwd);
            format!("{basename} ({rel})")
        } else {
            basename.to_owned()
        };

        if !configs.contains_key(&invocation.cwd) {
            let config = DirConfig::read_from_dir(&invocation.cwd)?;
            configs.insert(invocation.cwd.clone(), config);
        }
        let mut settings = settings_from_env(&invocation.env);
        if let Some(config) = &configs[&invocation.cwd] {
            settings.overlay(&config.settings_for(basename));
        }

        let mut entry = TestPlanEntry::new(
            name.clone(),
            invocation.command.clone(),
            invocation.args.clone(),
            invocation.cwd.clone(),
        );
        entry.timeout_secs = settings.timeout_secs(&name);
        entry.insignificant = settings.insignificant.unwrap_or(false);
        entry.parallel_safe = settings.parallel_safe.unwrap_or(false);
        entry.subtests = settings.subtests.unwrap_or_default();

        plan.push(entry)
            .map_err(|err| PlanBuildError::InvalidEntry { name, err })?;
    }
    Ok(plan)
}

/// Reads `TESTCASE_TIMEOUT`, `TESTCASE_INSIGNIFICANT` and `TESTCASE_PARALLEL_SAFE`.
fn settings_from_env(env: &BTreeMap<String, String>) -> TestSettings {
    let flag = |key: &str| {
        let value = env.get(key)?;
        match value.trim() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            other => {
                warn!("ignoring invalid value `{other}` for {key}");
                None
            }
        }
    };

    TestSettings {
        timeout: env
            .get("TESTCASE_TIMEOUT")
            .filter(|value| !value.trim().is_empty())
            .map(|value| toml::Value::String(value.clone())),
        insignificant: flag("TESTCASE_INSIGNIFICANT"),
        parallel_safe: flag("TESTCASE_PARALLEL_SAFE"),
        subtests: None,
    }
}
