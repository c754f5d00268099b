// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugins that hook into the [`Runner`](crate::runner::Runner).
//!
//! A plugin can rewrite the command before it is spawned, contribute diagnostic lines after an
//! attempt finishes, and enable a single retry of failing tests. Plugins are consulted in the order
//! they were configured, which determines the order of their diagnostic lines.

mod coverage;
mod crash;
mod flaky;

pub use coverage::{COVERAGE_DIR_ENV, CoveragePlugin};
pub use crash::CrashPlugin;
pub use flaky::{
    FlakyMode, FlakyModeParseError, FlakyPlugin, Reconciled, reconcile_attempts, vanishing_failure,
};

use crate::{
    errors::PluginConfigError,
    runner::{AttemptReport, CommandLine},
};
use camino::Utf8PathBuf;
use futures::future::{BoxFuture, FutureExt};
use std::{fmt, str::FromStr, sync::Arc};

/// A hook into the runner.
///
/// All methods have no-op defaults.
pub trait RunnerPlugin: fmt::Debug + Send + Sync {
    /// The name of this plugin, as used on the command line.
    fn name(&self) -> &'static str;

    /// Modifies the command before it is spawned.
    fn wrap_command(&self, _command: &mut CommandLine) {}

    /// Returns diagnostic lines to append after an attempt has finished.
    fn after_attempt<'a>(&'a self, _report: &'a AttemptReport) -> BoxFuture<'a, Vec<String>> {
        futures::future::ready(Vec::new()).boxed()
    }

    /// Returns the retry mode, if this plugin enables retrying failed attempts.
    fn retry_policy(&self) -> Option<FlakyMode> {
        None
    }

    /// Returns how many times each failing test function is rerun in place of a whole-test retry,
    /// or 0 to always retry the whole test.
    fn function_repetitions(&self) -> u32 {
        0
    }
}

/// The plugins known to testsched.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PluginKind {
    /// Crash diagnostics: backtraces and crash reports after fatal signals.
    Crash,

    /// Retry failed tests once and reconcile the attempts.
    Flaky,

    /// Wrap the command to produce coverage data.
    Coverage,
}

impl PluginKind {
    /// The plugins enabled when none are configured explicitly.
    pub const DEFAULT: &'static [PluginKind] = &[PluginKind::Crash, PluginKind::Flaky];

    /// Returns the name of this plugin.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Flaky => "flaky",
            Self::Coverage => "coverage",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crash" => Ok(Self::Crash),
            "flaky" => Ok(Self::Flaky),
            "coverage" => Ok(Self::Coverage),
            other => Err(format!(
                "unknown plugin `{other}` (known plugins: crash, flaky, coverage)"
            )),
        }
    }
}

/// Configuration from which a [`PluginSet`] is built.
#[derive(Clone, Debug)]
pub struct PluginConfig {
    /// The plugins to enable, in order. Duplicates are ignored.
    pub kinds: Vec<PluginKind>,

    /// The reconciliation mode used by the flaky plugin.
    pub flaky_mode: FlakyMode,

    /// How often the flaky plugin reruns each failing test function; 0 retries the whole test.
    pub function_repetitions: u32,

    /// The wrapper command line used by the coverage plugin.
    pub coverage_wrapper: Option<String>,

    /// The directory coverage data is written to, exported to the wrapped command.
    pub coverage_dir: Option<Utf8PathBuf>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            kinds: PluginKind::DEFAULT.to_vec(),
            flaky_mode: FlakyMode::default(),
            function_repetitions: 0,
            coverage_wrapper: None,
            coverage_dir: None,
        }
    }
}

/// An ordered list of plugins.
#[derive(Clone, Debug, Default)]
pub struct PluginSet {
    plugins: Vec<Arc<dyn RunnerPlugin>>,
}

impl PluginSet {
    /// Creates an empty plugin set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the plugins named in `config`, preserving their order.
    pub fn from_config(config: &PluginConfig) -> Result<Self, PluginConfigError> {
        let mut set = Self::new();
        let mut seen = Vec::with_capacity(config.kinds.len());
        for &kind in &config.kinds {
            if seen.contains(&kind) {
                continue;
            }
            seen.push(kind);

            let plugin: Arc<dyn RunnerPlugin> = match kind {
                PluginKind::Crash => Arc::new(CrashPlugin::new()),
                PluginKind::Flaky => Arc::new(
                    FlakyPlugin::new(config.flaky_mode)
                        .with_function_repetitions(config.function_repetitions),
                ),
                PluginKind::Coverage => {
                    let wrapper = config
                        .coverage_wrapper
                        .as_deref()
                        .ok_or(PluginConfigError::CoverageWrapperMissing)?;
                    Arc::new(CoveragePlugin::parse(wrapper, config.coverage_dir.clone())?)
                }
            };
            set.push(plugin);
        }
        Ok(set)
    }

    /// Appends a plugin.
    pub fn push(&mut self, plugin: Arc<dyn RunnerPlugin>) {
        self.plugins.push(plugin);
    }

    /// Iterates over the plugins in order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn RunnerPlugin>> {
        self.plugins.iter()
    }

    /// Returns the names of the plugins in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    /// Returns the retry mode of the first plugin that enables retries.
    pub fn retry_policy(&self) -> Option<FlakyMode> {
        self.plugins.iter().find_map(|plugin| plugin.retry_policy())
    }

    /// Returns the function repetitions of the plugin that enables retries.
    pub fn function_repetitions(&self) -> u32 {
        self.plugins
            .iter()
            .find(|plugin| plugin.retry_policy().is_some())
            .map_or(0, |plugin| plugin.function_repetitions())
    }

    /// Returns a copy of this set without the plugins that enable retries.
    pub fn without_retries(&self) -> Self {
        Self {
            plugins: self
                .plugins
                .iter()
                .filter(|plugin| plugin.retry_policy().is_none())
                .cloned()
                .collect(),
        }
    }
}
