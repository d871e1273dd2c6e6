// src/runner.rs

use crate::config::RunnerConfig;
use crate::error::MineError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Environment variable telling the runner-side plugin where the state files live
pub const STATE_DIR_ENV: &str = "BUGTRACE_STATE_DIR";

/// The well-known intermediate-state location shared with the runner-side plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub dir: PathBuf,
    /// Target spec written before each run
    pub targets: PathBuf,
    /// Trace record flushed by the plugin at session end
    pub result: PathBuf,
}

impl StatePaths {
    pub fn new(dir: &Path, target_file: &str, result_file: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            targets: dir.join(target_file),
            result: dir.join(result_file),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Runner exit code; `None` when killed by a signal
    pub exit_code: Option<i32>,
}

/// The external test runner: collection mode and traced runs
pub trait TestRunner {
    /// Lists test identifiers for the tree at `workdir`, one per line
    fn collect(&mut self, workdir: &Path) -> Result<String, MineError>;

    /// Runs the suite at `workdir` with the trace plugin reading `state`.
    /// Blocks until the runner exits.
    fn run(&mut self, workdir: &Path, state: &StatePaths) -> Result<RunOutcome, MineError>;
}

/// Runs the suite in a child process, e.g. `python -m pytest -p bugtrace_plugin <repo>`
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: RunnerConfig,
    state_dir: PathBuf,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig, state_dir: &Path) -> Self {
        Self { config, state_dir: state_dir.to_path_buf() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .current_dir(&self.state_dir)
            .env(STATE_DIR_ENV, &self.state_dir);
        cmd
    }

    pub fn collect_command(&self, workdir: &Path) -> Command {
        let mut cmd = self.command();
        cmd.args(["--collect-only", "--quiet"])
            .args(&self.config.extra_args)
            .arg(workdir);
        cmd
    }

    pub fn run_command(&self, workdir: &Path) -> Command {
        let mut cmd = self.command();
        cmd.args(&self.config.extra_args);
        if let Some(plugin) = &self.config.plugin {
            cmd.arg("-p").arg(plugin);
        }
        cmd.arg(workdir);
        cmd
    }
}

impl TestRunner for CommandRunner {
    fn collect(&mut self, workdir: &Path) -> Result<String, MineError> {
        std::fs::create_dir_all(&self.state_dir)?;
        let output = self
            .collect_command(workdir)
            .output()
            .map_err(|err| MineError::Runner(format!("failed to start {}: {err}", self.config.program)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "collection stderr");
        }
        if !output.status.success() {
            warn!(status = ?output.status.code(), "test collection reported errors");
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run(&mut self, workdir: &Path, state: &StatePaths) -> Result<RunOutcome, MineError> {
        let status = self
            .run_command(workdir)
            .env(STATE_DIR_ENV, &state.dir)
            .status()
            .map_err(|err| MineError::Runner(format!("failed to start {}: {err}", self.config.program)))?;
        debug!(status = ?status.code(), "test run finished");
        Ok(RunOutcome { exit_code: status.code() })
    }
}
