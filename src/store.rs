// src/store.rs

use crate::error::MineError;
use crate::model::*;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);
const TEMP_PREFIX: &str = ".bugtrace.tmp.";

/// Writes `bytes` to a sibling temp file, then renames it over `path`
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target filename"))?;
    let tmp_path = parent.join(format!(
        "{TEMP_PREFIX}{file_name}.{}.{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| -> io::Result<()> {
        let mut tmp = OpenOptions::new().create_new(true).write(true).open(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
        drop(tmp);
        move_file(&tmp_path, path)?;
        sync_dir(parent)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Renames, falling back to copy + remove across filesystems
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) => {
            if !from.exists() {
                return Err(err);
            }
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Persists the target spec where the runner-side plugin will read it
pub fn write_targets(path: &Path, spec: &TargetSpec) -> Result<(), MineError> {
    let json = serde_json::to_vec(spec)?;
    atomic_write(path, &json)?;
    debug!(path = %path.display(), files = spec.0.len(), "target spec written");
    Ok(())
}

pub fn read_targets(path: &Path) -> Result<TargetSpec, MineError> {
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

pub fn read_record(path: &Path) -> Result<TraceRecord, MineError> {
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

/// Removes a stale result left over from an earlier run
pub fn clear_result(path: &Path) -> Result<(), MineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Output layout `<data_dir>/<repository>/<parent-commit-id>/{negative,positive}_example.json`
#[derive(Debug, Clone)]
pub struct PairStore {
    root: PathBuf,
}

impl PairStore {
    pub fn new(data_dir: &Path, repository: &str) -> Self {
        Self { root: data_dir.join(repository) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pair_dir(&self, parent: &str) -> PathBuf {
        self.root.join(parent)
    }

    pub fn exists(&self, parent: &str) -> bool {
        self.pair_dir(parent).is_dir()
    }

    /// Moves the run's result file into the pair directory if it holds any snapshot.
    ///
    /// Returns the destination, or `None` when the run produced no signal. The result file
    /// is consumed either way.
    pub fn persist(&self, parent: &str, half: Half, result: &Path) -> Result<Option<PathBuf>, MineError> {
        if !result.exists() {
            warn!(parent, half = ?half, "no trace result found");
            return Ok(None);
        }
        let record = match read_record(result) {
            Ok(record) => record,
            Err(err) => {
                warn!(parent, half = ?half, error = %err, "unreadable trace result");
                clear_result(result)?;
                return Ok(None);
            }
        };
        if record.is_empty() {
            warn!(parent, half = ?half, "target lines were never executed");
            clear_result(result)?;
            return Ok(None);
        }

        let dir = self.pair_dir(parent);
        fs::create_dir_all(&dir)?;
        let dest = dir.join(half.file_name());
        move_file(result, &dest)?;
        debug!(dest = %dest.display(), snapshots = record.snapshot_count(), "example persisted");
        Ok(Some(dest))
    }

    /// Loads whatever halves exist for `parent`
    pub fn load(&self, parent: &str) -> Result<ExamplePair, MineError> {
        let dir = self.pair_dir(parent);
        let load_half = |half: Half| -> Result<Option<TraceRecord>, MineError> {
            let path = dir.join(half.file_name());
            if path.is_file() {
                read_record(&path).map(Some)
            } else {
                Ok(None)
            }
        };
        Ok(ExamplePair {
            negative: load_half(Half::Negative)?,
            positive: load_half(Half::Positive)?,
        })
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
