// src/cli.rs

use crate::config::Config;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bugtrace", author, version, about = "Mine bug-fix commits and trace variable state around them", long_about = None)]
pub struct Args {
    /// Config file (defaults to ./bugtrace.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Walk each repository's history and trace every bug-fix pair
    Mine {
        /// Repository names under the repos directory
        #[arg(required = true)]
        repos: Vec<String>,
    },
    /// List bug-fix candidates without running any test
    Scan {
        repo: String,
    },
    /// List the tests discovered at the repository's current checkout
    Discover {
        repo: String,
    },
}

/// Command-line overrides applied on top of the config file
#[derive(ClapArgs, Debug, Default)]
pub struct Overrides {
    /// Directory holding the repositories
    #[arg(long, global = true)]
    pub repos_dir: Option<PathBuf>,

    /// Output directory for example pairs
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Directory for the target and result files
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Re-process pairs that already have output
    #[arg(long, global = true)]
    pub no_skip_existing: bool,

    /// Commits between forced test rediscoveries
    #[arg(long, global = true)]
    pub refresh_interval: Option<usize>,

    /// Executed lines kept before each snapshot
    #[arg(long, global = true)]
    pub context_lines: Option<usize>,

    /// Interpreter used to launch the test runner
    #[arg(long, global = true)]
    pub python: Option<String>,

    /// Hide the progress bar
    #[arg(long, global = true)]
    pub no_progress: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.repos_dir {
            config.repos_dir = dir.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if self.no_skip_existing {
            config.skip_existing = false;
        }
        if let Some(interval) = self.refresh_interval {
            config.refresh_interval = interval;
        }
        if let Some(lines) = self.context_lines {
            config.context_lines = lines;
        }
        if let Some(python) = &self.python {
            config.runner.program = python.clone();
        }
        if self.no_progress {
            config.progress = false;
        }
    }
}
