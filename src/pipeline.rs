// src/pipeline.rs

use crate::config::Config;
use crate::diff::{added_source_files, is_bugfix_candidate, modified_lines};
use crate::discovery::TestDiscovery;
use crate::error::MineError;
use crate::model::*;
use crate::runner::{StatePaths, TestRunner};
use crate::store::{self, PairStore};
use crate::vcs::GitRepo;
use chrono::{TimeZone, Utc};
use git2::Oid;
use indicatif::ProgressBar;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A walked pair whose child does not descend from the current commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonLinearPair {
    pub parent: Oid,
    pub child: Oid,
}

/// What one repository run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Adjacent pairs walked
    pub walked: usize,
    pub candidates: usize,
    pub skipped_existing: usize,
    pub negatives: usize,
    pub positives: usize,
    /// Pairs or halves abandoned after a recoverable error
    pub failures: usize,
    /// Recorded for audit, never processed
    pub nonlinear: Vec<NonLinearPair>,
}

fn format_time(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map_or_else(|| secs.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// The shared working tree; at most one commit is checked out at a time
struct WorkTree {
    repo: GitRepo,
    checked_out: Option<Oid>,
}

impl WorkTree {
    fn checkout(&mut self, id: Oid) -> Result<(), MineError> {
        if self.checked_out != Some(id) {
            // forget the old state first so a failed checkout is retried
            self.checked_out = None;
            self.repo.checkout(id)?;
            self.checked_out = Some(id);
        }
        Ok(())
    }
}

/// Walks one repository's history and mines an example pair for every bug-fix commit
pub struct PairRunner<'a, R: TestRunner + ?Sized> {
    name: String,
    config: &'a Config,
    runner: &'a mut R,
    tree: WorkTree,
    workdir: PathBuf,
    discovery: TestDiscovery,
    store: PairStore,
    state: StatePaths,
    progress: ProgressBar,
}

impl<'a, R: TestRunner + ?Sized> PairRunner<'a, R> {
    /// Opens `<repos_dir>/<name>`
    pub fn new(name: &str, config: &'a Config, runner: &'a mut R) -> Result<Self, MineError> {
        Self::open(&config.repo_path(name), name, config, runner)
    }

    pub fn open(path: &Path, name: &str, config: &'a Config, runner: &'a mut R) -> Result<Self, MineError> {
        if !path.exists() {
            return Err(MineError::RepoNotFound(path.to_path_buf()));
        }
        let repo = GitRepo::open(&path.canonicalize()?)?;
        let workdir = repo.workdir().to_path_buf();

        let state_dir = if config.state_dir.is_absolute() {
            config.state_dir.clone()
        } else {
            std::env::current_dir()?.join(&config.state_dir)
        };
        std::fs::create_dir_all(&state_dir)?;

        let progress = if config.progress {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };

        Ok(Self {
            name: name.to_string(),
            config,
            runner,
            tree: WorkTree { repo, checked_out: None },
            workdir,
            discovery: TestDiscovery::new(config.refresh_interval),
            store: PairStore::new(&config.data_dir, name),
            state: StatePaths::new(&state_dir, &config.target_file, &config.result_file),
            progress,
        })
    }

    /// Mines the whole history, then puts HEAD back where it was
    pub fn run(mut self) -> Result<RunSummary, MineError> {
        let commits = self.tree.repo.commits()?;
        let head = self.tree.repo.head_state()?;
        info!(repository = %self.name, commits = commits.len(), "mining repository");
        self.progress.set_length(commits.len() as u64);
        self.progress.set_message(self.name.clone());

        let mut summary = RunSummary::default();
        let outcome = self.walk(&commits, &mut summary);

        if let Err(err) = self.tree.repo.restore_head(&head) {
            warn!(repository = %self.name, error = %err, "could not restore HEAD");
        }
        store::clear_result(&self.state.result)?;
        self.progress.finish_with_message(format!("{} done", self.name));

        outcome?;
        info!(
            repository = %self.name,
            walked = summary.walked,
            candidates = summary.candidates,
            negatives = summary.negatives,
            positives = summary.positives,
            skipped = summary.skipped_existing,
            failures = summary.failures,
            nonlinear = summary.nonlinear.len(),
            "repository finished"
        );
        Ok(summary)
    }

    fn walk(&mut self, commits: &[Commit], summary: &mut RunSummary) -> Result<(), MineError> {
        let Some((first, rest)) = commits.split_first() else {
            return Ok(());
        };
        self.progress.inc(1);

        let mut current = first;
        for child in rest {
            summary.walked += 1;
            self.progress.set_message(format!(
                "{} {} ({}) tests~{}",
                self.name,
                current.short_id(),
                format_time(current.time),
                self.discovery.expected_tests()
            ));

            if !child.has_parent(current.id) {
                warn!(
                    parent = %current.short_id(),
                    child = %child.short_id(),
                    "non-linear history, pair skipped"
                );
                summary.nonlinear.push(NonLinearPair { parent: current.id, child: child.id });
            } else {
                match self.step(current, child, summary) {
                    Ok(()) => {}
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        summary.failures += 1;
                        warn!(commit = %current.short_id(), error = %err, "commit abandoned");
                    }
                }
            }

            current = child;
            self.progress.inc(1);
        }
        Ok(())
    }

    fn step(&mut self, parent: &Commit, child: &Commit, summary: &mut RunSummary) -> Result<(), MineError> {
        let key = parent.id.to_string();
        if self.config.skip_existing && self.store.exists(&key) {
            debug!(parent = %parent.short_id(), "output exists, pair skipped");
            summary.skipped_existing += 1;
            return Ok(());
        }

        let extension = self.config.source_extension.as_str();
        let diff = self.tree.repo.diff(parent, child)?;
        let added = added_source_files(&diff, extension).len();

        // discovery looks at the child's tree so test files added by the fix are known
        let tree = &mut self.tree;
        let refreshed = self
            .discovery
            .observe_commit(added, &mut *self.runner, &self.workdir, || tree.checkout(child.id))?;
        if refreshed {
            debug!(files = self.discovery.files().len(), "test files refreshed");
        }

        if !is_bugfix_candidate(&diff, self.discovery.files(), extension) {
            debug!(commit = %child.short_id(), "not a bug-fix candidate");
            return Ok(());
        }
        summary.candidates += 1;
        info!(
            parent = %parent.short_id(),
            child = %child.short_id(),
            date = %format_time(child.time),
            "bug-fix candidate"
        );

        let lines = modified_lines(&diff, extension);
        for (commit, half) in [(parent, Half::Negative), (child, Half::Positive)] {
            match self.run_half(commit, lines.for_version(half.version()), &key, half) {
                Ok(true) => match half {
                    Half::Negative => summary.negatives += 1,
                    Half::Positive => summary.positives += 1,
                },
                Ok(false) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    summary.failures += 1;
                    warn!(commit = %commit.short_id(), half = ?half, error = %err, "test run failed");
                }
            }
        }
        Ok(())
    }

    /// Marks the targets, runs the suite at `commit` and persists whatever was captured
    fn run_half(&mut self, commit: &Commit, targets: &TargetSpec, key: &str, half: Half) -> Result<bool, MineError> {
        if targets.is_empty() {
            warn!(commit = %commit.short_id(), half = ?half, "no target lines for this side");
            return Ok(false);
        }
        store::clear_result(&self.state.result)?;
        store::write_targets(&self.state.targets, targets)?;

        self.tree.checkout(commit.id)?;
        info!(
            commit = %commit.short_id(),
            date = %format_time(commit.time),
            half = ?half,
            "running tests"
        );
        let outcome = self.runner.run(&self.workdir, &self.state)?;
        debug!(exit_code = ?outcome.exit_code, "runner exited");

        Ok(self.store.persist(key, half, &self.state.result)?.is_some())
    }
}

/// Commits whose diff against their first parent touches both tests and code.
/// Nothing is checked out and no tests run.
pub fn scan_candidates(repo: &GitRepo, test_files: &BTreeSet<String>, extension: &str) -> Result<Vec<Commit>, MineError> {
    let mut candidates = Vec::new();
    for commit in repo.commits()? {
        let Some(&parent_id) = commit.parents.first() else {
            continue;
        };
        let parent = repo.find(parent_id)?;
        let diff = repo.diff(&parent, &commit)?;
        if is_bugfix_candidate(&diff, test_files, extension) {
            candidates.push(commit);
        }
    }
    Ok(candidates)
}
