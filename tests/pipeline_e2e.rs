// tests/pipeline_e2e.rs

use bugtrace::config::{Config, TimeoutConfig};
use bugtrace::error::MineError;
use bugtrace::model::{Half, LineNo};
use bugtrace::pipeline::{scan_candidates, NonLinearPair, PairRunner};
use bugtrace::plugin::SessionPlugin;
use bugtrace::render::{Render, Value};
use bugtrace::runner::{RunOutcome, StatePaths, TestRunner};
use bugtrace::store::PairStore;
use bugtrace::trace::{self, EventKind, Frame, TracerOptions};
use bugtrace::vcs::GitRepo;
use git2::{Oid, Repository, Signature, Time};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;

// the tracer slot is process-wide
static TRACE_LOCK: Mutex<()> = Mutex::new(());

fn trace_lock() -> MutexGuard<'static, ()> {
    TRACE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

const BUGGY: &str = "def add(a, b):\n    return a - b\n";
const FIXED: &str = "def add(a, b):\n    return a + b\n";
const TEST_V1: &str = "from calc import add\n\ndef test_add():\n    assert add(0, 0) == 0\n";
const TEST_V2: &str = "from calc import add\n\ndef test_add():\n    assert add(0, 0) == 0\n    assert add(1, 2) == 3\n";

fn commit(repo: &Repository, files: &[(&str, &str)], parents: &[Oid], secs: i64, update: Option<&str>) -> Oid {
    let mut builder = repo.treebuilder(None).unwrap();
    for (name, content) in files {
        let blob = repo.blob(content.as_bytes()).unwrap();
        builder.insert(name, blob, 0o100644).unwrap();
    }
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let sig = Signature::new("Dev", "dev@example.com", &Time::new(secs, 0)).unwrap();
    let parents: Vec<git2::Commit> = parents.iter().map(|id| repo.find_commit(*id).unwrap()).collect();
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(update, &sig, &sig, &format!("commit at {secs}"), &tree, &parent_refs)
        .unwrap()
}

struct Fixture {
    dir: TempDir,
    config: Config,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("repos/demo")).unwrap();
        let config = Config {
            repos_dir: dir.path().join("repos"),
            data_dir: dir.path().join("data"),
            state_dir: dir.path().join("state"),
            progress: false,
            ..Config::default()
        };
        Self { dir, config }
    }

    fn repo_path(&self) -> PathBuf {
        self.dir.path().join("repos/demo")
    }

    fn init(&self) -> Repository {
        Repository::init(self.repo_path()).unwrap()
    }

    fn store(&self) -> PairStore {
        PairStore::new(&self.config.data_dir, "demo")
    }
}

/// Linear history: the fix, then a code-only change, then a non-source change
fn linear_history(repo: &Repository) -> Vec<Oid> {
    let c0 = commit(repo, &[("calc.py", BUGGY), ("test_calc.py", TEST_V1)], &[], 1_000, Some("HEAD"));
    let c1 = commit(repo, &[("calc.py", FIXED), ("test_calc.py", TEST_V2)], &[c0], 2_000, Some("HEAD"));
    let c2 = commit(
        repo,
        &[("calc.py", "def add(a, b):\n    return a + b\n\ndef neg(a):\n    return -a\n"), ("test_calc.py", TEST_V2)],
        &[c1],
        3_000,
        Some("HEAD"),
    );
    let c3 = commit(
        repo,
        &[
            ("README.md", "calc\n"),
            ("calc.py", "def add(a, b):\n    return a + b\n\ndef neg(a):\n    return -a\n"),
            ("test_calc.py", TEST_V2),
        ],
        &[c2],
        4_000,
        Some("HEAD"),
    );
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force())).unwrap();
    vec![c0, c1, c2, c3]
}

struct ScriptFrame {
    file: String,
    line: LineNo,
    locals: Vec<(String, Value)>,
}

impl Frame for ScriptFrame {
    fn file(&self) -> &str {
        &self.file
    }

    fn line(&self) -> LineNo {
        self.line
    }

    fn function(&self) -> &str {
        "add"
    }

    fn for_each_local(&self, visit: &mut dyn FnMut(&str, &dyn Render)) {
        for (name, value) in &self.locals {
            visit(name.as_str(), value);
        }
    }
}

/// Stands in for the external test runner: lists `test_*.py` files and "executes" every
/// line of each target file through the session plugin.
#[derive(Default)]
struct ScriptedRunner {
    collections: usize,
    runs: Vec<PathBuf>,
}

impl TestRunner for ScriptedRunner {
    fn collect(&mut self, workdir: &Path) -> Result<String, MineError> {
        self.collections += 1;
        let mut listing = String::new();
        for entry in std::fs::read_dir(workdir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with("test_") && name.ends_with(".py") {
                listing.push_str(&format!("{name}::test_add\n"));
            }
        }
        Ok(listing)
    }

    fn run(&mut self, workdir: &Path, state: &StatePaths) -> Result<RunOutcome, MineError> {
        self.runs.push(workdir.to_path_buf());
        let options = TracerOptions { root: Some(workdir.to_path_buf()), ..TracerOptions::default() };
        let mut plugin = SessionPlugin::load(state.clone(), options, TimeoutConfig::default())?;
        plugin.session_start(false)?;

        let files: Vec<String> = plugin.targets().files().map(str::to_string).collect();
        for file in files {
            let path = workdir.join(&file);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for line in 1..=content.lines().count() {
                let frame = ScriptFrame {
                    file: path.to_string_lossy().into_owned(),
                    line: line as LineNo,
                    locals: vec![("a".into(), Value::from(1i64)), ("b".into(), Value::from(2i64))],
                };
                trace::dispatch(EventKind::Line, &frame);
            }
        }

        plugin.session_finish()?;
        Ok(RunOutcome { exit_code: Some(0) })
    }
}

#[test]
fn bug_fix_pair_is_traced_on_both_sides() {
    let _lock = trace_lock();
    let fixture = Fixture::new();
    let repo = fixture.init();
    let commits = linear_history(&repo);

    let mut runner = ScriptedRunner::default();
    let summary = PairRunner::new("demo", &fixture.config, &mut runner).unwrap().run().unwrap();

    assert_eq!(summary.walked, 3);
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.negatives, 1);
    assert_eq!(summary.positives, 1);
    assert_eq!(summary.failures, 0);
    assert!(summary.nonlinear.is_empty());
    assert_eq!(runner.runs.len(), 2);

    let pair = fixture.store().load(&commits[0].to_string()).unwrap();
    let negative = pair.negative.unwrap();
    let positive = pair.positive.unwrap();

    let before = &negative.snapshots("calc.py", 2)[0];
    assert_eq!(before.target_line, "    return a - b");
    assert_eq!(before.variables["a"], "1");
    assert_eq!(before.variables["b"], "2");
    assert_eq!(before.code_context, vec!["def add(a, b):".to_string()]);

    let after = &positive.snapshots("calc.py", 2)[0];
    assert_eq!(after.target_line, "    return a + b");

    // the added assertion only exists on the fixed side
    assert!(negative.snapshots("test_calc.py", 5).is_empty());
    assert_eq!(positive.snapshots("test_calc.py", 5)[0].target_line, "    assert add(1, 2) == 3");

    // only the fix's parent gets a pair directory
    let dirs: BTreeSet<String> = std::fs::read_dir(fixture.store().root())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(dirs, BTreeSet::from([commits[0].to_string()]));
    assert!(fixture.store().pair_dir(&commits[0].to_string()).join(Half::Negative.file_name()).is_file());
}

#[test]
fn head_is_restored_after_mining() {
    let _lock = trace_lock();
    let fixture = Fixture::new();
    let repo = fixture.init();
    let commits = linear_history(&repo);
    let branch = repo.head().unwrap().shorthand().unwrap().to_string();

    let mut runner = ScriptedRunner::default();
    PairRunner::new("demo", &fixture.config, &mut runner).unwrap().run().unwrap();

    let head = repo.head().unwrap();
    assert!(!repo.head_detached().unwrap());
    assert_eq!(head.shorthand(), Some(branch.as_str()));
    assert_eq!(head.target(), Some(commits[3]));
    assert!(fixture.repo_path().join("README.md").is_file());
}

#[test]
fn existing_output_is_not_recomputed() {
    let _lock = trace_lock();
    let fixture = Fixture::new();
    let repo = fixture.init();
    let commits = linear_history(&repo);

    let mut first = ScriptedRunner::default();
    PairRunner::new("demo", &fixture.config, &mut first).unwrap().run().unwrap();
    let negative = fixture.store().pair_dir(&commits[0].to_string()).join(Half::Negative.file_name());
    let written = std::fs::read(&negative).unwrap();

    let mut second = ScriptedRunner::default();
    let summary = PairRunner::new("demo", &fixture.config, &mut second).unwrap().run().unwrap();
    assert_eq!(summary.skipped_existing, 1);
    assert_eq!(summary.candidates, 0);
    assert!(second.runs.is_empty());
    assert_eq!(std::fs::read(&negative).unwrap(), written);

    let config = Config { skip_existing: false, ..fixture.config.clone() };
    let mut third = ScriptedRunner::default();
    let summary = PairRunner::new("demo", &config, &mut third).unwrap().run().unwrap();
    assert_eq!(summary.candidates, 1);
    assert_eq!(third.runs.len(), 2);
}

#[test]
fn non_linear_pairs_are_recorded_and_skipped() {
    let _lock = trace_lock();
    let fixture = Fixture::new();
    let repo = fixture.init();

    let base = commit(&repo, &[("calc.py", BUGGY), ("test_calc.py", TEST_V1)], &[], 1_000, Some("HEAD"));
    // side branch commit, older than the mainline one
    let side = commit(&repo, &[("calc.py", FIXED), ("test_calc.py", TEST_V2)], &[base], 2_000, None);
    let main = commit(&repo, &[("calc.py", BUGGY), ("test_calc.py", TEST_V2)], &[base], 3_000, Some("HEAD"));
    let merge = commit(&repo, &[("calc.py", FIXED), ("test_calc.py", TEST_V2)], &[main, side], 4_000, Some("HEAD"));
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force())).unwrap();

    let mut runner = ScriptedRunner::default();
    let summary = PairRunner::new("demo", &fixture.config, &mut runner).unwrap().run().unwrap();

    assert_eq!(summary.walked, 3);
    assert_eq!(summary.nonlinear, vec![NonLinearPair { parent: side, child: main }]);
    // base -> side is a fix; main -> merge only touches code
    assert_eq!(summary.candidates, 1);
    assert!(fixture.store().exists(&base.to_string()));
    assert!(!fixture.store().exists(&side.to_string()));
    assert!(!fixture.store().exists(&main.to_string()));
    assert_eq!(repo.head().unwrap().target(), Some(merge));
}

#[test]
fn missing_repository_aborts() {
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::default();
    let err = PairRunner::new("absent", &fixture.config, &mut runner).err().unwrap();
    assert!(matches!(err, MineError::RepoNotFound(_)));
    assert!(err.is_fatal());
}

#[test]
fn empty_repository_is_a_recoverable_error() {
    let fixture = Fixture::new();
    fixture.init();
    let mut runner = ScriptedRunner::default();
    let err = PairRunner::new("demo", &fixture.config, &mut runner).unwrap().run().err().unwrap();
    assert!(matches!(err, MineError::EmptyHistory));
    assert!(!err.is_fatal());
}

#[test]
fn scan_lists_candidates_without_running_tests() {
    let fixture = Fixture::new();
    let repo = fixture.init();
    let commits = linear_history(&repo);

    let git = GitRepo::open(&fixture.repo_path()).unwrap();
    let tests = BTreeSet::from(["test_calc.py".to_string()]);
    let found: Vec<Oid> = scan_candidates(&git, &tests, "py").unwrap().into_iter().map(|c| c.id).collect();
    assert_eq!(found, vec![commits[1]]);
}

#[test]
fn test_only_commit_is_not_a_candidate() {
    let _lock = trace_lock();
    let fixture = Fixture::new();
    let repo = fixture.init();
    let c0 = commit(&repo, &[("calc.py", BUGGY), ("test_calc.py", TEST_V1)], &[], 1_000, Some("HEAD"));
    commit(&repo, &[("calc.py", BUGGY), ("test_calc.py", TEST_V2)], &[c0], 2_000, Some("HEAD"));
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force())).unwrap();

    let mut runner = ScriptedRunner::default();
    let summary = PairRunner::new("demo", &fixture.config, &mut runner).unwrap().run().unwrap();

    assert_eq!(summary.walked, 1);
    assert_eq!(summary.candidates, 0);
    assert_eq!(runner.collections, 1);
    assert!(runner.runs.is_empty());
    assert!(!fixture.store().exists(&c0.to_string()));
}
