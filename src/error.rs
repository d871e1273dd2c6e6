// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while mining a repository
#[derive(Debug, Error)]
pub enum MineError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Repository directory {0} does not exist")]
    RepoNotFound(PathBuf),

    #[error("Repository has no commits")]
    EmptyHistory,

    #[error("Test runner error: {0}")]
    Runner(String),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),
}

impl MineError {
    /// Fatal errors abort the whole run instead of a single commit
    pub fn is_fatal(&self) -> bool {
        matches!(self, MineError::RepoNotFound(_))
    }
}

/// Errors raised by the trace collector outside of the hooked program
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("a tracer is already installed in this process")]
    AlreadyInstalled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
