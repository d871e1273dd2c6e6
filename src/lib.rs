// src/lib.rs

//! Mines a repository's history for bug-fix commits and captures the state of the
//! variables on the lines each fix touched, once before and once after the fix.

pub mod cli;
pub mod config;
pub mod diff;
pub mod discovery;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod plugin;
#[cfg(feature = "python")]
mod python;
pub mod render;
pub mod runner;
pub mod store;
pub mod trace;
pub mod vcs;

pub use config::Config;
pub use error::{MineError, TraceError};
pub use pipeline::{PairRunner, RunSummary};
