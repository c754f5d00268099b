// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard},
};

/// Tracks which parallel tests overlap in time.
///
/// Each running test accumulates the names of every other test that was running at some point
/// during its lifetime: the ones already running when it started, and the ones that started
/// after it.
#[derive(Debug, Default)]
pub(crate) struct ConcurrencyTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    running: BTreeMap<String, BTreeSet<String>>,
    peak: usize,
}

impl ConcurrencyTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Marks `name` as running.
    pub(crate) fn start(&self, name: &str) {
        let mut inner = self.lock();
        let mut overlapping = BTreeSet::new();
        for (other, seen) in inner.running.iter_mut() {
            seen.insert(name.to_owned());
            overlapping.insert(other.clone());
        }
        inner.running.insert(name.to_owned(), overlapping);
        inner.peak = inner.peak.max(inner.running.len());
    }

    /// Marks `name` as finished, returning the sorted names of the tests it overlapped with.
    pub(crate) fn finish(&self, name: &str) -> Vec<String> {
        self.lock()
            .running
            .remove(name)
            .map(|seen| seen.into_iter().collect())
            .unwrap_or_default()
    }

    /// Returns the largest number of tests that were running at once.
    pub(crate) fn peak(&self) -> usize {
        self.lock().peak
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
