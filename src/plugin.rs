// src/plugin.rs

//! Test-runner side of a traced run.
//!
//! The host test runner calls these hooks from its own plugin entry points: session start
//! installs the tracer, collection adjusts per-test timeouts, session finish uninstalls and
//! flushes the record for the miner to pick up.

use crate::config::{Config, TimeoutConfig};
use crate::error::TraceError;
use crate::model::*;
use crate::runner::{StatePaths, STATE_DIR_ENV};
use crate::trace::{self, PathPattern, TraceGuard, Tracer, TracerOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A collected test as seen by the collection hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestItem {
    pub node_id: String,
    pub timeout: Option<Duration>,
}

impl TestItem {
    pub fn new(node_id: &str) -> Self {
        Self { node_id: node_id.to_string(), timeout: None }
    }

    pub fn file(&self) -> &str {
        self.node_id
            .split_once(crate::discovery::NODE_SEPARATOR)
            .map_or(self.node_id.as_str(), |(file, _)| file)
    }
}

pub struct SessionPlugin {
    state: StatePaths,
    options: TracerOptions,
    timeouts: TimeoutConfig,
    targets: TargetSpec,
    guard: Option<TraceGuard>,
}

impl SessionPlugin {
    /// Reads the target spec once; a missing file means nothing is traced
    pub fn load(state: StatePaths, options: TracerOptions, timeouts: TimeoutConfig) -> Result<Self, TraceError> {
        let targets = match std::fs::read(&state.targets) {
            Ok(content) => serde_json::from_slice(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %state.targets.display(), "no target file, nothing will be traced");
                TargetSpec::default()
            }
            Err(err) => return Err(err.into()),
        };
        info!(files = targets.0.len(), "trace targets loaded");
        Ok(Self { state, options, timeouts, targets, guard: None })
    }

    /// Loads the plugin for a traced run of the project rooted at `root`.
    ///
    /// The state directory comes from `BUGTRACE_STATE_DIR` when the miner set it.
    pub fn from_config(config: &Config, root: &Path) -> Result<Self, TraceError> {
        let dir = std::env::var_os(STATE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| config.state_dir.clone());
        let state = StatePaths::new(&dir, &config.target_file, &config.result_file);
        let options = TracerOptions {
            context_lines: config.context_lines,
            root: Some(root.to_path_buf()),
            ..TracerOptions::default()
        };
        Self::load(state, options, config.timeouts)
    }

    pub fn options(&self) -> &TracerOptions {
        &self.options
    }

    pub fn targets(&self) -> &TargetSpec {
        &self.targets
    }

    pub fn is_tracing(&self) -> bool {
        self.guard.is_some()
    }

    /// Installs the tracer unless the runner only collects tests
    pub fn session_start(&mut self, collect_only: bool) -> Result<(), TraceError> {
        if collect_only {
            return Ok(());
        }
        let tracer = Arc::new(Tracer::new(&self.targets, self.options.clone()));
        self.guard = Some(trace::install(tracer)?);
        info!("tracing started");
        Ok(())
    }

    /// Gives tests from files touched by the fix the extended timeout
    pub fn modify_items(&self, items: &mut [TestItem]) {
        let patterns: Vec<PathPattern> = self.targets.files().map(PathPattern::new).collect();
        for item in items {
            let file = item.file();
            let modified = patterns.iter().any(|pattern| pattern.matches(file));
            let target = if modified { self.timeouts.extended() } else { self.timeouts.default_timeout() };
            if needs_timeout(item.timeout, target) {
                item.timeout = Some(target);
            }
        }
    }

    /// Uninstalls the tracer and writes the record to the result file.
    /// Returns `None` when the session never traced.
    pub fn session_finish(&mut self) -> Result<Option<TraceRecord>, TraceError> {
        let Some(guard) = self.guard.take() else {
            return Ok(None);
        };
        let Some(tracer) = guard.uninstall() else {
            return Ok(None);
        };
        info!("tracing stopped");
        tracer.flush(&self.state.result).map(Some)
    }
}

/// An existing timeout is kept unless it is more than 50% away from `target`
fn needs_timeout(current: Option<Duration>, target: Duration) -> bool {
    match current {
        None => true,
        Some(current) => {
            let target = target.as_secs_f64();
            target > 0.0 && (current.as_secs_f64() - target).abs() / target > 0.5
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::Value;
    use crate::trace::tests::{install_lock, TestFrame};
    use crate::trace::EventKind;

    fn state_in(dir: &Path) -> StatePaths {
        StatePaths::new(dir, "to_track.json", "result.json")
    }

    fn plugin_with(dir: &Path, targets: &str) -> SessionPlugin {
        let state = state_in(dir);
        std::fs::write(&state.targets, targets).unwrap();
        SessionPlugin::load(state, TracerOptions::default(), TimeoutConfig::default()).unwrap()
    }

    #[test]
    fn missing_target_file_traces_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = SessionPlugin::load(state_in(dir.path()), TracerOptions::default(), TimeoutConfig::default())
            .unwrap();
        assert!(plugin.targets().is_empty());
    }

    #[test]
    fn config_carries_context_and_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("to_track.json"), r#"{"foo.py": [2]}"#).unwrap();
        let config = Config { state_dir: dir.path().to_path_buf(), context_lines: 3, ..Config::default() };
        if std::env::var_os(STATE_DIR_ENV).is_some() {
            return;
        }
        let plugin = SessionPlugin::from_config(&config, Path::new("/checkout")).unwrap();
        assert_eq!(plugin.options().context_lines, 3);
        assert_eq!(plugin.options().root.as_deref(), Some(Path::new("/checkout")));
        assert_eq!(plugin.targets().lines("foo.py").map(|l| l.len()), Some(1));
    }

    #[test]
    fn collect_only_session_does_not_install() {
        let _lock = install_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = plugin_with(dir.path(), r#"{"foo.py": [1]}"#);
        plugin.session_start(true).unwrap();
        assert!(!plugin.is_tracing());
        assert!(trace::active().is_none());
        assert_eq!(plugin.session_finish().unwrap(), None);
        assert!(!dir.path().join("result.json").exists());
    }

    #[test]
    fn session_captures_and_flushes() {
        let _lock = install_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = plugin_with(dir.path(), r#"{"pkg/foo.py": [3]}"#);

        plugin.session_start(false).unwrap();
        trace::dispatch(
            EventKind::Line,
            &TestFrame::new("/checkout/pkg/foo.py", 3).local("n", Value::from(2i64)),
        );
        let record = plugin.session_finish().unwrap().unwrap();
        assert!(trace::active().is_none());

        assert_eq!(record.snapshots("pkg/foo.py", 3)[0].variables["n"], "2");
        let on_disk = crate::store::read_record(&dir.path().join("result.json")).unwrap();
        assert_eq!(on_disk, record);
    }

    #[test]
    fn second_session_cannot_start_while_first_is_tracing() {
        let _lock = install_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut first = plugin_with(dir.path(), "{}");
        let mut second = plugin_with(dir.path(), "{}");
        first.session_start(false).unwrap();
        assert!(matches!(second.session_start(false), Err(TraceError::AlreadyInstalled)));
        first.session_finish().unwrap();
        second.session_start(false).unwrap();
        second.session_finish().unwrap();
    }

    #[test]
    fn dropping_plugin_uninstalls() {
        let _lock = install_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = plugin_with(dir.path(), "{}");
        plugin.session_start(false).unwrap();
        drop(plugin);
        assert!(trace::active().is_none());
    }

    #[test]
    fn modified_test_files_get_extended_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_with(dir.path(), r#"{"tests/test_foo.py": [4], "foo.py": [3]}"#);
        let mut items = vec![
            TestItem::new("tests/test_foo.py::test_a"),
            TestItem::new("tests/test_bar.py::test_b"),
            TestItem { timeout: Some(Duration::from_secs(12)), ..TestItem::new("tests/test_bar.py::test_c") },
            TestItem { timeout: Some(Duration::from_secs(60)), ..TestItem::new("tests/test_bar.py::test_d") },
        ];
        plugin.modify_items(&mut items);

        assert_eq!(items[0].timeout, Some(Duration::from_secs(600)));
        assert_eq!(items[1].timeout, Some(Duration::from_secs(10)));
        // within 50% of the target, left alone
        assert_eq!(items[2].timeout, Some(Duration::from_secs(12)));
        assert_eq!(items[3].timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn item_file_is_the_part_before_the_separator() {
        assert_eq!(TestItem::new("a/test_x.py::TestK::test_y").file(), "a/test_x.py");
        assert_eq!(TestItem::new("a/test_x.py").file(), "a/test_x.py");
    }
}
