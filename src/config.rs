// src/config.rs

use crate::discovery::DEFAULT_REFRESH_INTERVAL;
use crate::error::MineError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up from the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "bugtrace.toml";

/// Mining configuration, loaded from `bugtrace.toml` and overridden by CLI flags
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repositories are opened at `<repos_dir>/<name>`
    pub repos_dir: PathBuf,
    /// Pairs are written to `<data_dir>/<name>/<parent>/`
    pub data_dir: PathBuf,
    /// Intermediate state shared with the runner-side plugin
    pub state_dir: PathBuf,
    pub target_file: String,
    pub result_file: String,
    /// Recognized source extension, without the dot
    pub source_extension: String,
    pub refresh_interval: usize,
    /// Executed lines kept as context for each snapshot
    pub context_lines: usize,
    pub skip_existing: bool,
    pub progress: bool,
    pub runner: RunnerConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repos_dir: PathBuf::from("Repos"),
            data_dir: PathBuf::from("data"),
            state_dir: PathBuf::from(".bugtrace"),
            target_file: "to_track.json".to_string(),
            result_file: "result.json".to_string(),
            source_extension: "py".to_string(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            context_lines: crate::trace::DEFAULT_CONTEXT_LINES,
            skip_existing: true,
            progress: true,
            runner: RunnerConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// How the external test runner is invoked
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Appended to both collection and traced runs
    pub extra_args: Vec<String>,
    /// Plugin loaded into traced runs
    pub plugin: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["-m".to_string(), "pytest".to_string()],
            extra_args: vec!["--continue-on-collection-errors".to_string()],
            plugin: Some("bugtrace_plugin".to_string()),
        }
    }
}

/// Per-test timeouts applied from the collection hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// For tests in files touched by the fix
    pub extended_secs: u64,
    pub default_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { extended_secs: 600, default_secs: 10 }
    }
}

impl TimeoutConfig {
    pub fn extended(&self) -> Duration {
        Duration::from_secs(self.extended_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_secs)
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, MineError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads `path`, or `bugtrace.toml` under `cwd` when present, or the defaults
    pub fn load(path: Option<&Path>, cwd: &Path) -> Result<Self, MineError> {
        let candidate = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(cwd.join(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
        };
        match candidate {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.repos_dir.join(name)
    }

    pub fn output_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
refresh_interval = 3
skip_existing = false

[runner]
program = "python3"

[timeouts]
default_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(config.refresh_interval, 3);
        assert!(!config.skip_existing);
        assert_eq!(config.runner.program, "python3");
        assert_eq!(config.runner.args, ["-m", "pytest"]);
        assert_eq!(config.timeouts.default_secs, 30);
        assert_eq!(config.timeouts.extended_secs, 600);
        assert_eq!(config.context_lines, 10);
        assert_eq!(config.target_file, "to_track.json");
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(None, dir.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_picks_up_file_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "source_extension = \"pyx\"\n").unwrap();
        let config = Config::load(None, dir.path()).unwrap();
        assert_eq!(config.source_extension, "pyx");
    }

    #[test]
    fn unknown_value_type_is_an_error() {
        assert!(matches!(
            Config::from_toml("refresh_interval = \"often\""),
            Err(MineError::Toml(_))
        ));
    }

    #[test]
    fn paths_are_keyed_by_repository_name() {
        let config = Config::default();
        assert_eq!(config.repo_path("gradio"), PathBuf::from("Repos/gradio"));
        assert_eq!(config.output_dir("gradio"), PathBuf::from("data/gradio"));
    }
}
