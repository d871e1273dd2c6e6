// src/vcs.rs

use crate::error::MineError;
use crate::model::*;
use git2::build::CheckoutBuilder;
use git2::{Delta, DiffFindOptions, DiffOptions, Oid, Repository, ResetType, Sort};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where HEAD pointed before mining started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadState {
    Branch(String),
    Detached(Oid),
}

/// The version-control collaborator: history walk, diffs and checkouts over one repository
pub struct GitRepo {
    repo: Repository,
    path: PathBuf,
}

impl GitRepo {
    pub fn open(path: &Path) -> Result<Self, MineError> {
        if !path.exists() {
            return Err(MineError::RepoNotFound(path.to_path_buf()));
        }
        let repo = Repository::open(path)?;
        let path = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.to_path_buf());
        Ok(Self { repo, path })
    }

    /// Root of the working tree
    pub fn workdir(&self) -> &Path {
        &self.path
    }

    pub fn find(&self, id: Oid) -> Result<Commit, MineError> {
        let commit = self.repo.find_commit(id)?;
        Ok(Commit {
            id,
            parents: commit.parent_ids().collect(),
            time: commit.time().seconds(),
            tree: commit.tree_id(),
        })
    }

    /// Every commit reachable from HEAD, oldest first
    pub fn commits(&self) -> Result<Vec<Commit>, MineError> {
        if self.repo.is_empty()? {
            return Err(MineError::EmptyHistory);
        }
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push_head().map_err(|err| match err.code() {
            git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound => MineError::EmptyHistory,
            _ => MineError::Git(err),
        })?;
        revwalk.set_sorting(Sort::TIME | Sort::REVERSE)?;

        let mut commits = Vec::new();
        for oid in revwalk {
            commits.push(self.find(oid?)?);
        }
        Ok(commits)
    }

    /// Diff from `old` to `new`, converted to owned patches
    pub fn diff(&self, old: &Commit, new: &Commit) -> Result<Diff, MineError> {
        let old_tree = self.repo.find_tree(old.tree)?;
        let new_tree = self.repo.find_tree(new.tree)?;

        let mut diff_opts = DiffOptions::new();
        diff_opts.include_untracked(false);
        diff_opts.ignore_filemode(true);
        diff_opts.context_lines(3);

        let mut diff = self
            .repo
            .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut diff_opts))?;
        diff.find_similar(Some(DiffFindOptions::new().renames(true)))?;

        let mut patches = Vec::with_capacity(diff.deltas().len());
        for idx in 0..diff.deltas().len() {
            let Some(patch) = git2::Patch::from_diff(&diff, idx)? else {
                // libgit2 yields no patch for binary or unchanged content
                if let Some(delta) = diff.get_delta(idx) {
                    patches.push(Patch {
                        old_path: delta_path(delta.old_file().path()),
                        new_path: delta_path(delta.new_file().path()),
                        status: status_of(delta.status()),
                        binary: true,
                        hunks: Vec::new(),
                    });
                }
                continue;
            };

            let delta = patch.delta();
            let mut hunks = Vec::with_capacity(patch.num_hunks());
            for hunk_idx in 0..patch.num_hunks() {
                let mut hunk = Hunk::default();
                for line_idx in 0..patch.num_lines_in_hunk(hunk_idx)? {
                    let line = patch.line_in_hunk(hunk_idx, line_idx)?;
                    hunk.lines.push(DiffLine {
                        old_lineno: line.old_lineno(),
                        new_lineno: line.new_lineno(),
                    });
                }
                hunks.push(hunk);
            }

            patches.push(Patch {
                old_path: delta_path(delta.old_file().path()),
                new_path: delta_path(delta.new_file().path()),
                status: status_of(delta.status()),
                binary: delta.flags().is_binary(),
                hunks,
            });
        }

        Ok(patches)
    }

    /// Detaches HEAD at `id` and hard-resets the working tree to it
    pub fn checkout(&self, id: Oid) -> Result<(), MineError> {
        debug!(commit = %id, "checking out");
        let target = self.repo.find_object(id, None)?;
        self.repo.set_head_detached(id)?;
        self.repo
            .reset(&target, ResetType::Hard, Some(CheckoutBuilder::new().force()))?;
        Ok(())
    }

    pub fn head_state(&self) -> Result<HeadState, MineError> {
        let head = self.repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.name() {
                return Ok(HeadState::Branch(name.to_string()));
            }
        }
        let id = head.target().ok_or(MineError::EmptyHistory)?;
        Ok(HeadState::Detached(id))
    }

    pub fn restore_head(&self, state: &HeadState) -> Result<(), MineError> {
        match state {
            HeadState::Branch(name) => {
                self.repo.set_head(name)?;
                self.repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
                Ok(())
            }
            HeadState::Detached(id) => self.checkout(*id),
        }
    }
}

fn delta_path(path: Option<&Path>) -> String {
    path.map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}

fn status_of(delta: Delta) -> PatchStatus {
    match delta {
        Delta::Added => PatchStatus::Added,
        Delta::Deleted => PatchStatus::Deleted,
        Delta::Modified => PatchStatus::Modified,
        Delta::Renamed => PatchStatus::Renamed,
        Delta::Copied => PatchStatus::Copied,
        _ => PatchStatus::Other,
    }
}
