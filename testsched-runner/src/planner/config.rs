// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-directory test configuration, read from `testsched.toml` next to the test binaries.
//!
//! ```toml
//! timeout = 300
//! parallel-safe = true
//!
//! [test.tst_network]
//! insignificant = true
//! subtests = ["ipv4", "ipv6"]
//! ```

use crate::errors::PlanBuildError;
use camino::Utf8Path;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::warn;

/// The name of the per-directory configuration file.
pub const CONFIG_FILE_NAME: &str = "testsched.toml";

/// Settings that apply to a test target. Every field is optional, so that more specific settings
/// can be layered on top of less specific ones.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct TestSettings {
    /// Kept as a raw value so that malformed overrides can be reported and ignored.
    pub(crate) timeout: Option<toml::Value>,
    pub(crate) insignificant: Option<bool>,
    pub(crate) parallel_safe: Option<bool>,
    pub(crate) subtests: Option<Vec<String>>,
}

impl TestSettings {
    /// Layers `other` over `self`: fields set in `other` win.
    pub(crate) fn overlay(&mut self, other: &TestSettings) {
        if other.timeout.is_some() {
            self.timeout.clone_from(&other.timeout);
        }
        if other.insignificant.is_some() {
            self.insignificant = other.insignificant;
        }
        if other.parallel_safe.is_some() {
            self.parallel_safe = other.parallel_safe;
        }
        if other.subtests.is_some() {
            self.subtests.clone_from(&other.subtests);
        }
    }

    /// Returns the timeout override in seconds. Invalid overrides are ignored with a warning.
    pub(crate) fn timeout_secs(&self, test_name: &str) -> Option<u64> {
        let value = self.timeout.as_ref()?;
        let parsed = match value {
            toml::Value::Integer(secs) => u64::try_from(*secs).ok(),
            toml::Value::String(secs) => secs.trim().parse::<u64>().ok(),
            _ => None,
        };
        match parsed {
            Some(secs) if secs > 0 => Some(secs),
            _ => {
                warn!(
                    "ignoring invalid timeout override {value} for test `{test_name}`, \
                     using the plan default"
                );
                None
            }
        }
    }
}

/// The contents of a `testsched.toml` file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct DirConfig {
    #[serde(flatten)]
    pub(crate) defaults: TestSettings,

    #[serde(default)]
    pub(crate) test: BTreeMap<String, TestSettings>,
}

impl DirConfig {
    /// Reads the configuration file in `dir`, returning `None` if there isn't one.
    pub(crate) fn read_from_dir(dir: &Utf8Path) -> Result<Option<Self>, PlanBuildError> {
        let path = dir.join(CONFIG_FILE_NAME);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PlanBuildError::ConfigRead { path, err }),
        };
        toml::from_str(&contents)
            .map(Some)
            .map_err(|err| PlanBuildError::ConfigParse { path, err })
    }

    /// Returns the settings for the test target named `name`: the directory-wide defaults with
    /// the `[test.<name>]` table layered on top.
    pub(crate) fn settings_for(&self, name: &str) -> TestSettings {
        let mut settings = self.defaults.clone();
        if let Some(specific) = self.test.get(name) {
            settings.overlay(specific);
        }
        settings
    }
}
