// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::RunnerPlugin;
use crate::{errors::PluginConfigError, runner::CommandLine};
use camino::Utf8PathBuf;

/// Environment variable holding the coverage output directory, set when one is configured.
pub const COVERAGE_DIR_ENV: &str = "TESTSCHED_COVERAGE_DIR";

/// Runs each test under an external coverage tool.
///
/// The wrapper command line is prepended to the test's command, so a wrapper of
/// `cov-run --output x --` turns `./tst_foo -v` into `cov-run --output x -- ./tst_foo -v`.
#[derive(Clone, Debug)]
pub struct CoveragePlugin {
    wrapper: Vec<String>,
    coverage_dir: Option<Utf8PathBuf>,
}

impl CoveragePlugin {
    /// Parses a wrapper command line, splitting it into words with shell quoting rules.
    pub fn parse(
        wrapper: &str,
        coverage_dir: Option<Utf8PathBuf>,
    ) -> Result<Self, PluginConfigError> {
        let wrapper =
            shell_words::split(wrapper).map_err(|err| PluginConfigError::CoverageWrapperParse {
                input: wrapper.to_owned(),
                err,
            })?;
        if wrapper.is_empty() {
            return Err(PluginConfigError::CoverageWrapperMissing);
        }
        Ok(Self {
            wrapper,
            coverage_dir,
        })
    }
}

impl RunnerPlugin for CoveragePlugin {
    fn name(&self) -> &'static str {
        "coverage"
    }

    fn wrap_command(&self, command: &mut CommandLine) {
        let (program, rest) = self
            .wrapper
            .split_first()
            .expect("wrapper is non-empty (checked in parse)");

        let old_program = std::mem::replace(&mut command.program, program.clone());
        let old_args = std::mem::take(&mut command.args);
        command.args = rest
            .iter()
            .cloned()
            .chain(std::iter::once(old_program))
            .chain(old_args)
            .collect();

        if let Some(dir) = &self.coverage_dir {
            command.set_env(COVERAGE_DIR_ENV, dir.as_str());
        }
    }
}
