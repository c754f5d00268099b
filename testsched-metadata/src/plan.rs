// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{InvalidEntryError, PlanParseError, PlanReadError, PlanWriteError};
use camino::{Utf8Path, Utf8PathBuf};
use std::{borrow::Cow, collections::HashMap, fmt::Write as _, io::Write as _, time::Duration};

/// One schedulable test definition within a [`TestPlan`].
///
/// Entries are created by the planner and are immutable once they have been added to a plan.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestPlanEntry {
    /// The human-readable identifier of this entry, unique within a plan.
    pub name: String,

    /// The program to invoke.
    pub command: String,

    /// The arguments passed to the program.
    pub args: Vec<String>,

    /// The directory the program is run in.
    pub cwd: Utf8PathBuf,

    /// A timeout override in seconds. If `None`, the plan-wide default applies.
    pub timeout_secs: Option<u64>,

    /// If true, failures of this test do not affect the overall verdict.
    pub insignificant: bool,

    /// If true, this test may run concurrently with other parallel-safe tests.
    pub parallel_safe: bool,

    /// Sub-entries sharing this binary, each invoked with its name appended to the arguments.
    pub subtests: Vec<String>,
}

impl TestPlanEntry {
    /// Creates a new entry with default flags: significant, not parallel-safe, no timeout override
    /// and no subtests.
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
        cwd: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            timeout_secs: None,
            insignificant: false,
            parallel_safe: false,
            subtests: Vec::new(),
        }
    }

    /// Returns the compact flags encoding used by the plan format, e.g. `ip:300` or `--`.
    pub fn flags_str(&self) -> String {
        let mut out = String::with_capacity(8);
        out.push(if self.insignificant { 'i' } else { '-' });
        out.push(if self.parallel_safe { 'p' } else { '-' });
        if let Some(timeout) = self.timeout_secs {
            _ = write!(out, ":{timeout}");
        }
        out
    }

    fn validate(&self) -> Result<(), InvalidEntryError> {
        if self.name.is_empty() {
            return Err(InvalidEntryError::EmptyName);
        }
        if self.command.is_empty() {
            return Err(InvalidEntryError::EmptyCommand);
        }

        let fields = std::iter::once(("test name", self.name.as_str()))
            .chain(std::iter::once(("command", self.command.as_str())))
            .chain(std::iter::once(("working directory", self.cwd.as_str())))
            .chain(self.args.iter().map(|arg| ("argument", arg.as_str())))
            .chain(self.subtests.iter().map(|s| ("subtest name", s.as_str())));
        for (field, value) in fields {
            if value.contains(['\n', '\r']) {
                return Err(InvalidEntryError::LineBreak { field });
            }
        }

        for (index, subtest) in self.subtests.iter().enumerate() {
            if self.subtests[..index].contains(subtest) {
                return Err(InvalidEntryError::DuplicateSubtest {
                    name: self.name.clone(),
                    subtest: subtest.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Compact flags parsed from a plan line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct EntryFlags {
    insignificant: bool,
    parallel_safe: bool,
    timeout_secs: Option<u64>,
}

impl EntryFlags {
    fn parse(line: usize, input: &str) -> Result<Self, PlanParseError> {
        let invalid = || PlanParseError::InvalidFlags {
            line,
            flags: input.to_owned(),
        };

        let mut chars = input.chars();
        let insignificant = match chars.next() {
            Some('i') => true,
            Some('-') => false,
            _ => return Err(invalid()),
        };
        let parallel_safe = match chars.next() {
            Some('p') => true,
            Some('-') => false,
            _ => return Err(invalid()),
        };
        let rest = chars.as_str();
        let timeout_secs = if rest.is_empty() {
            None
        } else {
            let timeout = rest.strip_prefix(':').ok_or_else(invalid)?;
            Some(parse_timeout(line, timeout)?)
        };

        Ok(Self {
            insignificant,
            parallel_safe,
            timeout_secs,
        })
    }
}

fn parse_timeout(line: usize, input: &str) -> Result<u64, PlanParseError> {
    match input.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(PlanParseError::InvalidTimeout {
            line,
            input: input.to_owned(),
        }),
    }
}

/// An ordered collection of [`TestPlanEntry`] instances, plus a plan-wide default timeout.
///
/// A plan is written once by the planner and may be read by several scheduler runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestPlan {
    default_timeout_secs: u64,
    entries: Vec<TestPlanEntry>,
    by_name: HashMap<String, usize>,
}

impl TestPlan {
    /// The version of the plan format written by this crate.
    pub const FORMAT_VERSION: u32 = 1;

    /// The directive that introduces the format version.
    pub const VERSION_DIRECTIVE: &'static str = "testsched-plan";

    /// The default per-test timeout, in seconds, used when a plan does not specify one.
    pub const DEFAULT_TIMEOUT_SECS: u64 = 900;

    /// Creates an empty plan with the given default timeout in seconds.
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout_secs,
            entries: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Adds an entry to the end of the plan.
    ///
    /// Returns an error if the name is already used by another entry, or if the entry cannot be
    /// represented in the plan format.
    pub fn push(&mut self, entry: TestPlanEntry) -> Result<(), InvalidEntryError> {
        entry.validate()?;
        if self.by_name.contains_key(&entry.name) {
            return Err(InvalidEntryError::DuplicateName { name: entry.name });
        }
        self.by_name.insert(entry.name.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Returns the plan-wide default timeout in seconds.
    pub fn default_timeout_secs(&self) -> u64 {
        self.default_timeout_secs
    }

    /// Returns the timeout that applies to the given entry.
    pub fn timeout_for(&self, entry: &TestPlanEntry) -> Duration {
        Duration::from_secs(entry.timeout_secs.unwrap_or(self.default_timeout_secs))
    }

    /// Returns the entries in plan order.
    pub fn entries(&self) -> &[TestPlanEntry] {
        &self.entries
    }

    /// Looks up an entry by name.
    pub fn get(&self, name: &str) -> Option<&TestPlanEntry> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    /// Returns the number of entries in the plan.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the plan has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reads and parses a plan from the given path.
    pub fn from_path(path: impl AsRef<Utf8Path>) -> Result<Self, PlanReadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| PlanReadError::Read {
            path: path.to_owned(),
            err,
        })?;
        Self::parse(&contents).map_err(|err| PlanReadError::Parse {
            path: path.to_owned(),
            err,
        })
    }

    /// Parses a plan from its textual representation.
    pub fn parse(input: &str) -> Result<Self, PlanParseError> {
        let mut plan: Option<TestPlan> = None;
        let mut default_timeout_secs = None;

        for (index, raw_line) in input.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let words = shell_words::split(trimmed)
                .map_err(|err| PlanParseError::Tokenize { line, err })?;
            let Some((directive, rest)) = words.split_first() else {
                continue;
            };

            if directive == Self::VERSION_DIRECTIVE {
                if plan.is_some() {
                    return Err(PlanParseError::Malformed {
                        line,
                        message: "version line may only appear once",
                    });
                }
                let [version] = rest else {
                    return Err(PlanParseError::Malformed {
                        line,
                        message: "expected exactly one version number",
                    });
                };
                if version.parse::<u32>().ok() != Some(Self::FORMAT_VERSION) {
                    return Err(PlanParseError::UnsupportedVersion {
                        line,
                        version: version.clone(),
                    });
                }
                plan = Some(TestPlan::new(Self::DEFAULT_TIMEOUT_SECS));
                continue;
            }

            let Some(plan) = plan.as_mut() else {
                return Err(PlanParseError::MissingVersion { line });
            };

            match directive.as_str() {
                "default-timeout" => {
                    let [timeout] = rest else {
                        return Err(PlanParseError::Malformed {
                            line,
                            message: "expected exactly one timeout value",
                        });
                    };
                    if default_timeout_secs.is_some() {
                        return Err(PlanParseError::Malformed {
                            line,
                            message: "default timeout may only be set once",
                        });
                    }
                    let timeout = parse_timeout(line, timeout)?;
                    default_timeout_secs = Some(timeout);
                    plan.default_timeout_secs = timeout;
                }
                "test" => {
                    let entry = parse_test_line(line, rest)?;
                    plan.push(entry)
                        .map_err(|err| PlanParseError::InvalidEntry { line, err })?;
                }
                "subtest" => {
                    let [name, subtest] = rest else {
                        return Err(PlanParseError::Malformed {
                            line,
                            message: "expected a test name and a subtest name",
                        });
                    };
                    let Some(&entry_index) = plan.by_name.get(name) else {
                        return Err(PlanParseError::UnknownSubtestParent {
                            line,
                            name: name.clone(),
                        });
                    };
                    let entry = &mut plan.entries[entry_index];
                    if entry.subtests.contains(subtest) {
                        return Err(PlanParseError::InvalidEntry {
                            line,
                            err: InvalidEntryError::DuplicateSubtest {
                                name: name.clone(),
                                subtest: subtest.clone(),
                            },
                        });
                    }
                    entry.subtests.push(subtest.clone());
                }
                other => {
                    return Err(PlanParseError::UnknownDirective {
                        line,
                        directive: other.to_owned(),
                    });
                }
            }
        }

        plan.ok_or(PlanParseError::MissingVersion { line: 0 })
    }

    /// Serializes this plan into its textual representation.
    pub fn to_plan_string(&self) -> String {
        let mut out = String::new();
        _ = writeln!(out, "# testsched test plan: {} tests", self.entries.len());
        _ = writeln!(out, "{} {}", Self::VERSION_DIRECTIVE, Self::FORMAT_VERSION);
        _ = writeln!(out, "default-timeout {}", self.default_timeout_secs);

        for entry in &self.entries {
            let flags = entry.flags_str();
            let words = [
                Cow::Borrowed("test"),
                shell_words::quote(&entry.name),
                Cow::Borrowed(flags.as_str()),
                shell_words::quote(entry.cwd.as_str()),
                Cow::Borrowed("--"),
                shell_words::quote(&entry.command),
            ]
            .into_iter()
            .chain(entry.args.iter().map(|arg| shell_words::quote(arg)));
            out.push_str(&words.collect::<Vec<_>>().join(" "));
            out.push('\n');

            for subtest in &entry.subtests {
                _ = writeln!(
                    out,
                    "subtest {} {}",
                    shell_words::quote(&entry.name),
                    shell_words::quote(subtest)
                );
            }
        }

        out
    }

    /// Atomically writes this plan to the given path.
    pub fn write_to_path(&self, path: impl AsRef<Utf8Path>) -> Result<(), PlanWriteError> {
        let path = path.as_ref();
        let contents = self.to_plan_string();
        atomicwrites::AtomicFile::new(path, atomicwrites::AllowOverwrite)
            .write(|file| file.write_all(contents.as_bytes()))
            .map_err(|error| {
                let error = match error {
                    atomicwrites::Error::Internal(error) | atomicwrites::Error::User(error) => error,
                };
                PlanWriteError::new(path, error)
            })
    }
}

impl Default for TestPlan {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT_SECS)
    }
}

fn parse_test_line(line: usize, words: &[String]) -> Result<TestPlanEntry, PlanParseError> {
    let [name, flags, cwd, separator, command, args @ ..] = words else {
        return Err(PlanParseError::Malformed {
            line,
            message: "expected `test <name> <flags> <cwd> -- <command> [args...]`",
        });
    };
    if separator != "--" {
        return Err(PlanParseError::Malformed {
            line,
            message: "expected `--` between the working directory and the command",
        });
    }

    let flags = EntryFlags::parse(line, flags)?;
    Ok(TestPlanEntry {
        name: name.clone(),
        command: command.clone(),
        args: args.to_vec(),
        cwd: Utf8PathBuf::from(cwd),
        timeout_secs: flags.timeout_secs,
        insignificant: flags.insignificant,
        parallel_safe: flags.parallel_safe,
        subtests: Vec::new(),
    })
}
