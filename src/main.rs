// src/main.rs

use bugtrace::cli::{Args, Command};
use bugtrace::config::Config;
use bugtrace::discovery::TestIndex;
use bugtrace::error::MineError;
use bugtrace::pipeline::{scan_candidates, PairRunner};
use bugtrace::runner::{CommandRunner, TestRunner};
use bugtrace::vcs::GitRepo;
use chrono::TimeZone;
use clap::Parser;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let start_time = Instant::now();
    let result = match &args.command {
        Command::Mine { repos } => mine(&config, repos),
        Command::Scan { repo } => scan(&config, repo),
        Command::Discover { repo } => discover(&config, repo),
    };
    info!("Total time: {:.2?}", start_time.elapsed());

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<Config, MineError> {
    let cwd = std::env::current_dir()?;
    let mut config = Config::load(args.config.as_deref(), &cwd)?;
    args.overrides.apply(&mut config);
    Ok(config)
}

fn runner_for(config: &Config) -> Result<CommandRunner, MineError> {
    let state_dir = std::env::current_dir()?.join(&config.state_dir);
    Ok(CommandRunner::new(config.runner.clone(), &state_dir))
}

fn mine(config: &Config, repos: &[String]) -> Result<(), MineError> {
    let mut runner = runner_for(config)?;
    for name in repos {
        let repo_start = Instant::now();
        let outcome = PairRunner::new(name, config, &mut runner).and_then(|miner| miner.run());
        match outcome {
            Ok(summary) => {
                info!(
                    "{}: {} candidates, {} negative and {} positive examples in {} in {:.2?}",
                    name,
                    summary.candidates,
                    summary.negatives,
                    summary.positives,
                    config.output_dir(name).display(),
                    repo_start.elapsed()
                );
                for pair in &summary.nonlinear {
                    warn!("{}: non-linear pair {} -> {} was not processed", name, pair.parent, pair.child);
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => error!("{}: mining failed: {}", name, e),
        }
    }
    Ok(())
}

fn scan(config: &Config, name: &str) -> Result<(), MineError> {
    let repo = GitRepo::open(&config.repo_path(name))?;
    let mut runner = runner_for(config)?;
    let index = TestIndex::parse(&runner.collect(repo.workdir())?, Some(repo.workdir()));
    info!("{}: {} test files at HEAD", name, index.file_count());

    let candidates = scan_candidates(&repo, &index.files(), &config.source_extension)?;
    for commit in &candidates {
        let date = chrono::Utc
            .timestamp_opt(commit.time, 0)
            .single()
            .map_or_else(|| commit.time.to_string(), |t| t.to_rfc2822());
        println!("{} {}", commit.id, date);
    }
    info!("{}: {} bug-fix candidates", name, candidates.len());
    Ok(())
}

fn discover(config: &Config, name: &str) -> Result<(), MineError> {
    let repo = GitRepo::open(&config.repo_path(name))?;
    let mut runner = runner_for(config)?;
    let index = TestIndex::parse(&runner.collect(repo.workdir())?, Some(repo.workdir()));
    for file in index.files() {
        println!("{} ({} tests)", file, index.tests_in(&file).len());
    }
    info!("{}: {} tests in {} files", name, index.test_count(), index.file_count());
    Ok(())
}
