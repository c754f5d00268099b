// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution of a [`TestPlan`].
//!
//! Parallel-safe entries run first, in a pool bounded by the concurrency level. Once the pool has
//! drained, the remaining entries run one at a time in plan order. Subtests of an entry always run
//! one after the other, wherever the entry itself runs.

mod concurrency;
mod stress;

use crate::{
    errors::{ExecuteError, SchedulerBuildError},
    helpers::{FormattedDuration, elide_names},
    reporter::{ResultSet, RunTiming, StressReport, Styles, TestOutcome, TestStatus},
    runner::{CommandLine, OutputPolicy, RunRequest, Runner, RunnerBuilder},
    time::stopwatch,
    transcript::Transcript,
};
use chrono::Local;
use concurrency::ConcurrencyTracker;
use futures::{StreamExt, stream};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use testsched_metadata::TestPlan;
use tokio::runtime::Runtime;
use tracing::debug;

/// Builder for [`Scheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerBuilder {
    runner: RunnerBuilder,
    concurrency: usize,
    sync_output: bool,
    verbose: bool,
    summary: bool,
    parallel_stress: bool,
    styles: Styles,
}

impl SchedulerBuilder {
    /// Creates a new builder that runs tests with runners built from `runner`.
    pub fn new(runner: RunnerBuilder) -> Self {
        Self {
            runner,
            concurrency: 1,
            sync_output: false,
            verbose: false,
            summary: true,
            parallel_stress: false,
            styles: Styles::default(),
        }
    }

    /// Sets the maximum number of parallel-safe tests running at once. Zero is treated as one.
    pub fn set_concurrency(&mut self, concurrency: usize) -> &mut Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets whether each test's output is held back until it finishes.
    pub fn set_sync_output(&mut self, sync_output: bool) -> &mut Self {
        self.sync_output = sync_output;
        self
    }

    /// Sets whether timestamped begin and end lines are written around each test.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Sets whether the summary is written at the end of the run.
    ///
    /// Without a summary, the transcript holds nothing but the tests' own output.
    pub fn set_summary(&mut self, summary: bool) -> &mut Self {
        self.summary = summary;
        self
    }

    /// Sets whether every test is run again under parallel stress after the ordinary run.
    pub fn set_parallel_stress(&mut self, parallel_stress: bool) -> &mut Self {
        self.parallel_stress = parallel_stress;
        self
    }

    /// Enables colors in the summary.
    pub fn colorize(&mut self) -> &mut Self {
        self.styles.colorize();
        self
    }

    /// Creates the scheduler and its async runtime.
    pub fn build(&self, transcript: Transcript) -> Result<Scheduler, SchedulerBuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("testsched-worker")
            .build()
            .map_err(SchedulerBuildError::Runtime)?;

        let mut runner = self.runner.clone();
        if !self.summary {
            runner.set_diagnostics(false);
        }
        let runner = runner.build();
        let stress_runner = self
            .runner
            .clone()
            .set_output_policy(OutputPolicy::Relay)
            .set_plugins(runner.plugins().without_retries())
            .set_diagnostics(false)
            .build();

        Ok(Scheduler {
            runtime,
            runner,
            stress_runner,
            transcript,
            concurrency: self.concurrency,
            sync_output: self.sync_output,
            verbose: self.verbose,
            summary: self.summary,
            parallel_stress: self.parallel_stress,
            styles: self.styles.clone(),
        })
    }
}

/// Runs test plans.
#[derive(Debug)]
pub struct Scheduler {
    runtime: Runtime,
    runner: Runner,
    stress_runner: Runner,
    transcript: Transcript,
    concurrency: usize,
    sync_output: bool,
    verbose: bool,
    summary: bool,
    parallel_stress: bool,
    styles: Styles,
}

/// One schedulable entry: a test, or a test's subtests, which run in order.
#[derive(Debug)]
struct Unit {
    first_index: usize,
    parallel: bool,
    requests: Vec<RunRequest>,
}

impl Unit {
    fn from_plan(plan: &TestPlan) -> Vec<Unit> {
        let mut next_index = 0;
        plan.entries()
            .iter()
            .map(|entry| {
                let command = CommandLine::new(&entry.command, &entry.args).with_cwd(&entry.cwd);
                let request = |name: String, command: CommandLine| RunRequest {
                    name,
                    command,
                    timeout: plan.timeout_for(entry),
                    insignificant: entry.insignificant,
                };

                let requests: Vec<_> = if entry.subtests.is_empty() {
                    vec![request(entry.name.clone(), command)]
                } else {
                    entry
                        .subtests
                        .iter()
                        .map(|subtest| {
                            let mut command = command.clone();
                            command.args.push(subtest.clone());
                            request(format!("{} ({subtest})", entry.name), command)
                        })
                        .collect()
                };

                let unit = Unit {
                    first_index: next_index,
                    parallel: entry.parallel_safe,
                    requests,
                };
                next_index += unit.requests.len();
                unit
            })
            .collect()
    }
}

impl Scheduler {
    /// Runs every entry in `plan` and returns the results.
    ///
    /// Failing tests never stop the run. An error is only returned if the transcript cannot be
    /// written.
    pub fn execute(&self, plan: &TestPlan) -> Result<ResultSet, ExecuteError> {
        self.runtime.block_on(self.execute_impl(plan))
    }

    async fn execute_impl(&self, plan: &TestPlan) -> Result<ResultSet, ExecuteError> {
        let units = Unit::from_plan(plan);
        let (parallel, serial): (Vec<_>, Vec<_>) = units.iter().partition(|unit| unit.parallel);
        debug!(
            "scheduling {} parallel and {} serial entries, concurrency {}",
            parallel.len(),
            serial.len(),
            self.concurrency
        );

        let mut results = ResultSet::new();
        let run_watch = stopwatch();

        let mut parallel_wall = Duration::ZERO;
        if !parallel.is_empty() {
            let pool_watch = stopwatch();
            let tracker = ConcurrencyTracker::new();
            let mut pool = stream::iter(
                parallel
                    .iter()
                    .map(|unit| self.run_unit(&self.runner, unit, Some(&tracker))),
            )
            .buffer_unordered(self.concurrency);
            while let Some(outcomes) = pool.next().await {
                for outcome in outcomes? {
                    results.record(outcome);
                }
            }
            parallel_wall = pool_watch.snapshot().duration;
            debug!(
                "parallel pool drained after {}, at most {} tests at once",
                FormattedDuration(parallel_wall),
                tracker.peak()
            );
        }

        let serial_watch = stopwatch();
        for unit in &serial {
            for outcome in self.run_unit(&self.runner, unit, None).await? {
                results.record(outcome);
            }
        }
        let serial_wall = serial_watch.snapshot().duration;

        results.finalize(RunTiming {
            wall: run_watch.snapshot().duration,
            parallel_wall,
            serial_wall,
        });

        if self.parallel_stress {
            let report = self.run_stress(&units, &results).await?;
            results.set_stress_report(report);
        }

        if self.summary {
            self.transcript
                .write_all(results.write_summary(&self.styles).as_bytes())
                .map_err(ExecuteError::WriteTranscript)?;
        }
        Ok(results)
    }

    async fn run_unit(
        &self,
        runner: &Runner,
        unit: &Unit,
        tracker: Option<&ConcurrencyTracker>,
    ) -> Result<Vec<TestOutcome>, ExecuteError> {
        self.run_unit_to(runner, unit, tracker, &self.transcript, self.verbose)
            .await
    }

    async fn run_unit_to(
        &self,
        runner: &Runner,
        unit: &Unit,
        tracker: Option<&ConcurrencyTracker>,
        transcript: &Transcript,
        verbose: bool,
    ) -> Result<Vec<TestOutcome>, ExecuteError> {
        let mut outcomes = Vec::with_capacity(unit.requests.len());
        for (offset, request) in unit.requests.iter().enumerate() {
            let mut section = transcript.section(self.sync_output);
            if verbose {
                section.line(&format!(
                    "[{}] begin test {}: {}",
                    timestamp(),
                    request.name,
                    request.command.display()
                ));
            }

            if let Some(tracker) = tracker {
                tracker.start(&request.name);
            }
            let verdict = runner.run(request, &mut section).await;
            let concurrent_with = match tracker {
                Some(tracker) => tracker.finish(&request.name),
                None => Vec::new(),
            };

            if verbose {
                let exit = verdict
                    .attempts
                    .last()
                    .map(|attempt| attempt.description())
                    .unwrap_or_default();
                section.line(&format!(
                    "[{}] end test {}: {}, {exit}, {}",
                    timestamp(),
                    request.name,
                    FormattedDuration(verdict.duration()),
                    verdict.status
                ));
            }
            let failed =
                verdict.status.is_failure() || verdict.status == TestStatus::InsignificantFail;
            if failed && self.summary && !concurrent_with.is_empty() {
                section.line(&format!(
                    "{}: run concurrently with {}",
                    request.name,
                    elide_names(&concurrent_with)
                ));
            }
            section.finish().map_err(ExecuteError::WriteTranscript)?;

            outcomes.push(TestOutcome {
                name: request.name.clone(),
                index: unit.first_index + offset,
                status: verdict.status,
                duration: verdict.duration(),
                parallel: unit.parallel,
                concurrent_with,
                reasons: verdict.failure_reasons(),
                note: verdict.note,
            });
        }
        Ok(outcomes)
    }

    /// Runs every unit concurrently with the others, with retries disabled and output discarded,
    /// and classifies each test by comparing with the ordinary run.
    async fn run_stress(
        &self,
        units: &[Unit],
        ordinary: &ResultSet,
    ) -> Result<StressReport, ExecuteError> {
        let concurrency = self.concurrency.max(2);
        debug!("running parallel stress pass, concurrency {concurrency}");

        let discard = Transcript::discard();
        let mut stressed = HashMap::new();
        let mut pool = stream::iter(units.iter().map(|unit| {
            self.run_unit_to(&self.stress_runner, unit, None, &discard, false)
        }))
        .buffer_unordered(concurrency);
        while let Some(outcomes) = pool.next().await {
            for outcome in outcomes? {
                stressed.insert(outcome.name, outcome.status);
            }
        }

        let parallel_safe: HashSet<String> = units
            .iter()
            .filter(|unit| unit.parallel)
            .flat_map(|unit| unit.requests.iter().map(|request| request.name.clone()))
            .collect();
        Ok(stress::classify(ordinary, &stressed, &parallel_safe))
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}
