// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::ExpectedError,
    output::{OutputContext, OutputOpts, clap_styles},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use std::{io::Write, sync::Arc, time::Duration};
use testsched_metadata::{TestPlan, TestschedExitCode};
use testsched_runner::{
    helpers::{command_basename, plural},
    planner::{PlannerBuilder, RECORD_SUBCOMMAND, RecordedInvocation},
    plugins::{FlakyMode, PluginConfig, PluginKind, PluginSet},
    runner::{CommandLine, LogCaptureDir, OutputPolicy, RunRequest, RunnerBuilder},
    scheduler::SchedulerBuilder,
    transcript::Transcript,
};
use tracing::{debug, info};

/// Discovers and runs the tests of a make-based project.
///
/// Use `testsched plan` to produce a plan from a build tree, then `testsched run` to execute it.
#[derive(Debug, Parser)]
#[command(version, styles = clap_styles::style())]
pub struct TestschedApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(subcommand)]
    command: Command,
}

impl TestschedApp {
    /// Initializes logging and colors.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32, ExpectedError> {
        match self.command {
            Command::Plan(opts) => opts.exec(),
            Command::Run(opts) => opts.exec(output),
            Command::Exec(opts) => opts.exec(),
            Command::RecordTest(opts) => opts.exec(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover the tests of a build tree and write a test plan
    ///
    /// Runs `make check` in the build directory with `TESTRUNNER` pointing back at testsched, so
    /// the project's own build rules decide which tests exist and how they are invoked.
    Plan(PlanOpts),

    /// Run the tests in a test plan
    Run(RunOpts),

    /// Run a single command under supervision
    ///
    /// The command gets the same timeout handling, log capture, crash diagnostics and flaky
    /// retries as a test in a plan. Exits with 0 if and only if the command passed.
    Exec(ExecOpts),

    #[command(name = RECORD_SUBCOMMAND, hide = true)]
    RecordTest(RecordOpts),
}

#[derive(Debug, Args)]
struct PlanOpts {
    /// Root of the build tree
    #[arg(long, value_name = "DIR")]
    build_dir: Utf8PathBuf,

    /// Make program used to enumerate tests
    #[arg(long, value_name = "CMD", default_value = "make")]
    make: String,

    /// Extra argument passed to make before the `check` target (may be repeated)
    #[arg(long = "make-arg", value_name = "ARG", allow_hyphen_values = true)]
    make_args: Vec<String>,

    /// Timeout for tests that do not set their own, in seconds
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = TestPlan::DEFAULT_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    default_timeout: u64,

    /// Write the plan to this file instead of stdout
    #[arg(long, short = 'o', value_name = "FILE")]
    output: Option<Utf8PathBuf>,
}

impl PlanOpts {
    fn exec(self) -> Result<i32, ExpectedError> {
        let plan = PlannerBuilder::new(self.build_dir)
            .set_make(self.make)
            .add_make_args(self.make_args)
            .set_default_timeout_secs(self.default_timeout)
            .build()?
            .build_plan()?;

        match &self.output {
            Some(path) => {
                plan.write_to_path(path)?;
                info!("wrote {} to `{path}`", plural_tests(plan.len()));
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(plan.to_plan_string().as_bytes())
                    .and_then(|()| stdout.flush())
                    .map_err(|err| ExpectedError::PlanWriteStdout { err })?;
            }
        }
        Ok(TestschedExitCode::OK)
    }
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Test plan to run
    #[arg(long, value_name = "FILE")]
    plan: Utf8PathBuf,

    /// Number of parallel-safe tests to run at once
    #[arg(
        long,
        short = 'j',
        value_name = "N",
        env = "TESTSCHED_JOBS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    jobs: u64,

    /// Hold back each test's output until it finishes, so that output never interleaves
    #[arg(long)]
    sync_output: bool,

    /// Print timestamped begin and end lines around each test
    #[arg(long, short = 'v', env = "TESTSCHED_VERBOSE")]
    verbose: bool,

    /// Print nothing but the tests' own output
    #[arg(long)]
    no_summary: bool,

    /// After the run, run every test again under parallel load and report which ones cope
    #[arg(long)]
    parallel_stress: bool,

    #[clap(flatten)]
    runner: RunnerOpts,
}

impl RunOpts {
    fn exec(self, output: OutputContext) -> Result<i32, ExpectedError> {
        let plan = TestPlan::from_path(&self.plan)?;
        debug!("read {} from `{}`", plural_tests(plan.len()), self.plan);

        let mut builder = SchedulerBuilder::new(self.runner.runner_builder()?);
        builder
            .set_concurrency(usize::try_from(self.jobs).unwrap_or(usize::MAX))
            .set_sync_output(self.sync_output)
            .set_verbose(self.verbose)
            .set_summary(!self.no_summary)
            .set_parallel_stress(self.parallel_stress);
        if output.colorize_stdout() {
            builder.colorize();
        }

        let scheduler = builder.build(Transcript::terminal())?;
        let results = scheduler.execute(&plan)?;
        Ok(if results.is_success() {
            TestschedExitCode::OK
        } else {
            TestschedExitCode::TEST_RUN_FAILED
        })
    }
}

/// Options shared by everything that runs tests.
#[derive(Debug, Args)]
struct RunnerOpts {
    /// Write test output to log files in DIR instead of the terminal
    #[arg(long, value_name = "DIR", conflicts_with = "tee_logs")]
    capture_logs: Option<Utf8PathBuf>,

    /// Write test output to log files in DIR as well as the terminal
    #[arg(long, value_name = "DIR")]
    tee_logs: Option<Utf8PathBuf>,

    /// Plugin to enable, in order (may be repeated) [default: crash, flaky]
    #[arg(long = "plugin", value_name = "NAME")]
    plugins: Vec<PluginKind>,

    /// How a failure followed by a retry is judged: best, worst or ignore
    #[arg(
        long,
        value_name = "MODE",
        env = "TESTSCHED_FLAKY_MODE",
        default_value_t = FlakyMode::default(),
    )]
    flaky_mode: FlakyMode,

    /// Instead of retrying a failed test, rerun each failing function named in its XML results
    /// log N times
    #[arg(
        long,
        value_name = "N",
        env = "TESTSCHED_RERUN_FAILING_FUNCTIONS",
        default_value_t = 0
    )]
    rerun_failing_functions: u32,

    /// Command line that wraps each test for coverage (enables the coverage plugin)
    #[arg(long, value_name = "CMD")]
    coverage_wrapper: Option<String>,

    /// Directory exported to the coverage wrapper
    #[arg(long, value_name = "DIR", requires = "coverage_wrapper")]
    coverage_dir: Option<Utf8PathBuf>,

    /// Seconds between asking a timed-out test to stop and killing it
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    grace_period: u64,
}

impl RunnerOpts {
    fn runner_builder(&self) -> Result<RunnerBuilder, ExpectedError> {
        let mut kinds = if self.plugins.is_empty() {
            PluginKind::DEFAULT.to_vec()
        } else {
            self.plugins.clone()
        };
        if self.coverage_wrapper.is_some() && !kinds.contains(&PluginKind::Coverage) {
            kinds.push(PluginKind::Coverage);
        }
        let plugins = PluginSet::from_config(&PluginConfig {
            kinds,
            flaky_mode: self.flaky_mode,
            function_repetitions: self.rerun_failing_functions,
            coverage_wrapper: self.coverage_wrapper.clone(),
            coverage_dir: self.coverage_dir.clone(),
        })?;
        debug!("enabled plugins: {}", plugins.names().join(", "));

        // The capture root is created up front: without it no test could be captured.
        let output = match (&self.capture_logs, &self.tee_logs) {
            (Some(dir), _) => OutputPolicy::Capture(Arc::new(LogCaptureDir::create(dir)?)),
            (None, Some(dir)) => OutputPolicy::Tee(Arc::new(LogCaptureDir::create(dir)?)),
            (None, None) => OutputPolicy::Relay,
        };

        let mut builder = RunnerBuilder::default();
        builder
            .set_grace_period(Duration::from_secs(self.grace_period))
            .set_output_policy(output)
            .set_plugins(plugins);
        Ok(builder)
    }
}

#[derive(Debug, Args)]
struct ExecOpts {
    /// Timeout for each attempt, in seconds
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = TestPlan::DEFAULT_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    timeout: u64,

    /// Name used in diagnostics and log names [default: the command's basename]
    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    /// Treat a failure as insignificant: report it but exit with 0
    #[arg(long)]
    insignificant: bool,

    #[clap(flatten)]
    runner: RunnerOpts,

    /// The command to run, followed by its arguments
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl ExecOpts {
    fn exec(self) -> Result<i32, ExpectedError> {
        let runner = self.runner.runner_builder()?.build();
        let mut command = self.command.into_iter();
        let program = command.next().expect("clap requires at least one value");
        let name = self
            .name
            .unwrap_or_else(|| command_basename(&program).to_owned());
        let request = RunRequest {
            name,
            command: CommandLine::new(program, command),
            timeout: Duration::from_secs(self.timeout),
            insignificant: self.insignificant,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ExpectedError::RuntimeBuild { err })?;
        let transcript = Transcript::terminal();
        let verdict = runtime.block_on(async {
            let mut section = transcript.section(false);
            let verdict = runner.run(&request, &mut section).await;
            if let Err(error) = section.finish() {
                debug!("failed to write transcript for {}: {error}", request.name);
            }
            verdict
        });
        debug!("{}: {}", request.name, verdict.status);

        // Insignificant failures and ignored flakiness do not fail the invocation.
        Ok(if verdict.status.is_failure() {
            TestschedExitCode::TEST_RUN_FAILED
        } else {
            TestschedExitCode::OK
        })
    }
}

#[derive(Debug, Args)]
struct RecordOpts {
    /// Directory that receives the recorded invocation
    #[arg(long, value_name = "DIR")]
    fragment_dir: Utf8PathBuf,

    /// The test command the build system would have run
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl RecordOpts {
    fn exec(self) -> Result<i32, ExpectedError> {
        let mut command = self.command.into_iter();
        let program = command.next().expect("clap requires at least one value");
        let record = |err| ExpectedError::Record {
            fragment_dir: self.fragment_dir.clone(),
            err,
        };

        let invocation =
            RecordedInvocation::from_current_process(program, command.collect()).map_err(record)?;
        let path = invocation
            .write_fragment(&self.fragment_dir)
            .map_err(record)?;
        debug!("recorded `{}` into `{path}`", invocation.command);
        Ok(TestschedExitCode::OK)
    }
}

fn plural_tests(count: usize) -> String {
    format!("{count} {}", plural::tests_str(count))
}
