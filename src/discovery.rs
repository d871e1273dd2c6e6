// src/discovery.rs

use crate::error::MineError;
use crate::runner::TestRunner;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Separates the file part of a test identifier from the test name
pub const NODE_SEPARATOR: &str = "::";

/// Commits allowed to pass before discovery is forced to run again
pub const DEFAULT_REFRESH_INTERVAL: usize = 10;

/// Test file -> test names, as reported by the runner's collection mode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestIndex {
    tests: BTreeMap<String, Vec<String>>,
}

impl TestIndex {
    /// Parses collection output. Lines without a node separator (summaries, warnings) are ignored.
    pub fn parse(listing: &str, root: Option<&Path>) -> Self {
        let mut tests: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in listing.lines() {
            let line = line.trim();
            let Some((file, test)) = line.split_once(NODE_SEPARATOR) else {
                continue;
            };
            let file = normalize_test_path(file, root);
            if file.is_empty() {
                continue;
            }
            tests.entry(file).or_default().push(test.to_string());
        }
        Self { tests }
    }

    pub fn files(&self) -> BTreeSet<String> {
        self.tests.keys().cloned().collect()
    }

    pub fn tests_in(&self, file: &str) -> &[String] {
        self.tests.get(file).map_or(&[][..], Vec::as_slice)
    }

    pub fn file_count(&self) -> usize {
        self.tests.len()
    }

    pub fn test_count(&self) -> usize {
        self.tests.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Makes a reported test path comparable with repository-relative diff paths
fn normalize_test_path(file: &str, root: Option<&Path>) -> String {
    let mut file = file.trim().replace('\\', "/");
    if let Some(root) = root {
        let prefix = root.to_string_lossy().replace('\\', "/");
        let prefix = prefix.trim_end_matches('/');
        if !prefix.is_empty() {
            if let Some(rest) = file.strip_prefix(prefix) {
                file = rest.trim_start_matches('/').to_string();
            }
        }
    }
    while let Some(rest) = file.strip_prefix("./") {
        file = rest.to_string();
    }
    file
}

/// Expected test count after `added_files` new source files appear.
///
/// Each new file is weighted by the average number of tests per known test file.
pub fn estimate_tests(previous_tests: usize, previous_files: usize, added_files: usize) -> usize {
    if previous_files == 0 {
        return previous_tests + added_files;
    }
    let per_file = previous_tests as f64 / previous_files as f64;
    previous_tests + (per_file * added_files as f64).round() as usize
}

/// Keeps a conservative set of known test files, re-collected on a hysteresis schedule
#[derive(Debug)]
pub struct TestDiscovery {
    refresh_interval: usize,
    commits_since_refresh: usize,
    discovered: bool,
    index: TestIndex,
    files: BTreeSet<String>,
    expected_tests: usize,
}

impl TestDiscovery {
    pub fn new(refresh_interval: usize) -> Self {
        Self {
            refresh_interval,
            commits_since_refresh: 0,
            discovered: false,
            index: TestIndex::default(),
            files: BTreeSet::new(),
            expected_tests: 0,
        }
    }

    /// Known test files, repository-relative
    pub fn files(&self) -> &BTreeSet<String> {
        &self.files
    }

    pub fn index(&self) -> &TestIndex {
        &self.index
    }

    /// Estimated test count, for progress reporting only
    pub fn expected_tests(&self) -> usize {
        self.expected_tests
    }

    pub fn needs_refresh(&self, added_files: usize) -> bool {
        !self.discovered || added_files > 0 || self.commits_since_refresh > self.refresh_interval
    }

    /// Counts one walked commit and re-runs discovery if the policy asks for it.
    ///
    /// `prepare` runs right before collection, e.g. to check out the commit being classified.
    /// Returns whether discovery ran.
    pub fn observe_commit<R, F>(
        &mut self,
        added_files: usize,
        runner: &mut R,
        workdir: &Path,
        prepare: F,
    ) -> Result<bool, MineError>
    where
        R: TestRunner + ?Sized,
        F: FnOnce() -> Result<(), MineError>,
    {
        self.commits_since_refresh += 1;
        if added_files > 0 {
            self.expected_tests =
                estimate_tests(self.index.test_count(), self.index.file_count(), added_files);
        }
        if !self.needs_refresh(added_files) {
            return Ok(false);
        }
        prepare()?;
        self.refresh(runner, workdir)?;
        Ok(true)
    }

    /// Runs collection now, regardless of the schedule
    pub fn refresh<R>(&mut self, runner: &mut R, workdir: &Path) -> Result<&BTreeSet<String>, MineError>
    where
        R: TestRunner + ?Sized,
    {
        let listing = runner.collect(workdir)?;
        let index = TestIndex::parse(&listing, Some(workdir));

        if index.is_empty() && !self.index.is_empty() {
            // Keep the stale set; the overdue counter makes the next commit retry.
            warn!(
                known = self.index.file_count(),
                "test discovery returned no tests, keeping previous set"
            );
            return Ok(&self.files);
        }

        if index.is_empty() {
            info!("test discovery found no tests");
        } else {
            debug!(files = index.file_count(), tests = index.test_count(), "tests discovered");
        }
        self.files = index.files();
        self.expected_tests = index.test_count();
        self.index = index;
        self.discovered = true;
        self.commits_since_refresh = 0;
        Ok(&self.files)
    }
}
