// src/trace.rs

//! Dynamic execution-trace capture.
//!
//! The host runtime reports every executed line and function entry through [`dispatch`].
//! A [`Tracer`] installed with [`install`] matches those events against a [`TargetSpec`]
//! and records a [`Snapshot`] of the frame's locals for every hit.
//!
//! Installation is process-wide, but each thread only reports to the tracer once it has
//! been attached: the installing thread is attached by [`install`], threads started through
//! [`spawn`] are attached on start, and host-managed threads call [`attach_current_thread`]
//! or [`ensure_attached`].
//! Dropping the [`TraceGuard`] disables the tracer everywhere, even while unwinding.

use crate::error::TraceError;
use crate::model::*;
use crate::render::{render_variable, Render};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, warn};

/// Executed lines kept as context in front of each snapshot
pub const DEFAULT_CONTEXT_LINES: usize = 10;

/// Name the host gives to top-level module code
pub const MODULE_BODY: &str = "<module>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Call,
    Line,
    Return,
    Exception,
}

impl EventKind {
    /// Maps the host's event names (`call`, `line`, `return`, `exception`)
    pub fn from_host(name: &str) -> Option<Self> {
        match name {
            "call" => Some(Self::Call),
            "line" => Some(Self::Line),
            "return" => Some(Self::Return),
            "exception" => Some(Self::Exception),
            _ => None,
        }
    }
}

/// One executing frame, as exposed by the host runtime
pub trait Frame {
    /// Path of the executing source file
    fn file(&self) -> &str;

    fn line(&self) -> LineNo;

    /// Name of the executing code unit
    fn function(&self) -> &str;

    /// Visits every local variable visible in the frame
    fn for_each_local(&self, visit: &mut dyn FnMut(&str, &dyn Render));
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerOptions {
    pub context_lines: usize,
    /// Frames from absolute paths outside this directory are ignored
    pub root: Option<PathBuf>,
    /// Code units whose receiver is still under construction on entry
    pub constructors: Vec<String>,
    pub receiver: String,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            context_lines: DEFAULT_CONTEXT_LINES,
            root: None,
            constructors: vec!["__init__".to_string()],
            receiver: "self".to_string(),
        }
    }
}

/// Component-wise path pattern, matched from the right unless absolute.
///
/// `pkg/foo.py` matches `/checkout/src/pkg/foo.py`; each component may use glob syntax.
#[derive(Debug, Clone)]
pub struct PathPattern {
    absolute: bool,
    parts: Vec<glob::Pattern>,
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\']).filter(|c| !c.is_empty() && *c != ".")
}

impl PathPattern {
    pub fn new(pattern: &str) -> Self {
        let absolute = pattern.starts_with('/');
        let parts = components(pattern)
            .map(|part| {
                glob::Pattern::new(part)
                    .unwrap_or_else(|_| glob::Pattern::new(&glob::Pattern::escape(part)).unwrap_or_default())
            })
            .collect();
        Self { absolute, parts }
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.parts.is_empty() {
            return false;
        }
        let comps: Vec<&str> = components(path).collect();
        if comps.len() < self.parts.len() || (self.absolute && comps.len() != self.parts.len()) {
            return false;
        }
        comps
            .iter()
            .rev()
            .zip(self.parts.iter().rev())
            .all(|(comp, part)| part.matches(comp))
    }
}

#[derive(Debug)]
struct TargetEntry {
    key: String,
    pattern: PathPattern,
    lines: BTreeSet<LineNo>,
}

/// Trailing window of executed (file, line) pairs on one thread
#[derive(Debug)]
pub struct LineHistory {
    entries: VecDeque<(Arc<str>, LineNo)>,
    capacity: usize,
}

impl LineHistory {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, file: &str, line: LineNo) {
        if self.capacity == 0 {
            return;
        }
        let file = match self.entries.back() {
            Some((last, _)) if &**last == file => Arc::clone(last),
            _ => Arc::from(file),
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((file, line));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, LineNo)> {
        self.entries.iter().map(|(file, line)| (&**file, *line))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source text lookup, loaded once per file and kept until the record is flushed
#[derive(Debug, Default)]
struct SourceCache {
    files: Mutex<HashMap<String, Arc<Vec<String>>>>,
}

impl SourceCache {
    fn line(&self, file: &str, line: LineNo) -> String {
        let lines = {
            let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(files.entry(file.to_string()).or_insert_with(|| {
                let text = std::fs::read(file)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default();
                Arc::new(text.lines().map(|l| l.trim_end().to_string()).collect())
            }))
        };
        (line as usize)
            .checked_sub(1)
            .and_then(|idx| lines.get(idx))
            .cloned()
            .unwrap_or_default()
    }

    fn clear(&self) {
        self.files.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Matches executed lines against a target spec and accumulates snapshots
#[derive(Debug)]
pub struct Tracer {
    targets: Vec<TargetEntry>,
    options: TracerOptions,
    enabled: AtomicBool,
    record: Mutex<TraceRecord>,
    sources: SourceCache,
}

impl Tracer {
    pub fn new(spec: &TargetSpec, options: TracerOptions) -> Self {
        let targets = spec
            .iter()
            .filter(|(_, lines)| !lines.is_empty())
            .map(|(file, lines)| TargetEntry {
                key: file.clone(),
                pattern: PathPattern::new(file),
                lines: lines.clone(),
            })
            .collect();
        Self {
            targets,
            options,
            enabled: AtomicBool::new(false),
            record: Mutex::new(TraceRecord::default()),
            sources: SourceCache::default(),
        }
    }

    /// Builds a tracer from a target spec persisted as JSON
    pub fn from_file(path: &Path, options: TracerOptions) -> Result<Self, TraceError> {
        let content = std::fs::read(path)?;
        let spec: TargetSpec = serde_json::from_slice(&content)?;
        Ok(Self::new(&spec, options))
    }

    pub fn options(&self) -> &TracerOptions {
        &self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Handles one event. Never panics; a failure drops the event and is logged.
    pub fn handle(&self, kind: EventKind, frame: &dyn Frame, history: &mut LineHistory) {
        if !self.is_enabled() {
            return;
        }
        if panic::catch_unwind(AssertUnwindSafe(|| self.observe(kind, frame, history))).is_err() {
            warn!("trace hook failed, event dropped");
        }
    }

    fn observe(&self, kind: EventKind, frame: &dyn Frame, history: &mut LineHistory) {
        if !matches!(kind, EventKind::Line | EventKind::Call) {
            return;
        }
        let function = frame.function();
        if function == MODULE_BODY {
            return;
        }
        let file = frame.file();
        if !self.in_program(file) {
            return;
        }
        let line = frame.line();

        let mut hits = self
            .targets
            .iter()
            .filter(|target| target.lines.contains(&line) && target.pattern.matches(file))
            .peekable();
        if hits.peek().is_some() {
            let under_init =
                kind == EventKind::Call && self.options.constructors.iter().any(|c| c == function);
            let snapshot = self.capture(frame, file, line, under_init, history);
            let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
            // uninstalled while capturing
            if !self.is_enabled() {
                return;
            }
            for target in hits {
                debug!(file = %target.key, line, "target line hit");
                record.push(&target.key, line, snapshot.clone());
            }
        }

        if kind == EventKind::Line {
            history.push(file, line);
        }
    }

    fn in_program(&self, file: &str) -> bool {
        if file.starts_with('<') {
            return false;
        }
        match &self.options.root {
            Some(root) => {
                let path = Path::new(file);
                !path.is_absolute() || path.starts_with(root)
            }
            None => true,
        }
    }

    fn capture(
        &self,
        frame: &dyn Frame,
        file: &str,
        line: LineNo,
        under_init: bool,
        history: &LineHistory,
    ) -> Snapshot {
        let mut variables = BTreeMap::new();
        frame.for_each_local(&mut |name: &str, value: &dyn Render| {
            let text = render_variable(name, value, under_init, &self.options.receiver);
            variables.insert(name.to_string(), text);
        });
        let code_context = history
            .iter()
            .map(|(file, line)| self.sources.line(file, line))
            .collect();
        Snapshot {
            code_context,
            target_line: self.sources.line(file, line),
            variables,
        }
    }

    /// Copy of everything captured so far
    pub fn record(&self) -> TraceRecord {
        self.record.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Writes the captured record to `path` as JSON and returns it. An empty record is still
    /// written; it means the targets were never reached.
    pub fn flush(&self, path: &Path) -> Result<TraceRecord, TraceError> {
        let record = self.record();
        let json = serde_json::to_vec_pretty(&record)?;
        crate::store::atomic_write(path, &json)?;
        self.sources.clear();

        for (file, lines) in &record.0 {
            for (line, snapshots) in lines {
                debug!(%file, line, hits = snapshots.len(), "flushed");
            }
        }
        debug!(path = %path.display(), snapshots = record.snapshot_count(), "trace record flushed");
        Ok(record)
    }
}

static ACTIVE: Mutex<Option<Arc<Tracer>>> = Mutex::new(None);

struct ThreadHook {
    tracer: Arc<Tracer>,
    history: LineHistory,
}

thread_local! {
    static HOOK: RefCell<Option<ThreadHook>> = const { RefCell::new(None) };
}

/// Keeps a tracer installed; dropping it uninstalls
#[derive(Debug)]
pub struct TraceGuard {
    tracer: Option<Arc<Tracer>>,
}

impl TraceGuard {
    pub fn tracer(&self) -> Option<&Arc<Tracer>> {
        self.tracer.as_ref()
    }

    /// Uninstalls now and hands back the tracer for flushing
    pub fn uninstall(mut self) -> Option<Arc<Tracer>> {
        let tracer = self.tracer.take();
        if let Some(tracer) = &tracer {
            release(tracer);
        }
        tracer
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        if let Some(tracer) = self.tracer.take() {
            release(&tracer);
        }
    }
}

/// Makes `tracer` the process-wide hook and attaches it to the calling thread
pub fn install(tracer: Arc<Tracer>) -> Result<TraceGuard, TraceError> {
    let mut active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
    if active.is_some() {
        return Err(TraceError::AlreadyInstalled);
    }
    tracer.enabled.store(true, Ordering::Release);
    *active = Some(Arc::clone(&tracer));
    drop(active);

    attach(Arc::clone(&tracer));
    debug!(targets = tracer.targets.len(), "tracer installed");
    Ok(TraceGuard { tracer: Some(tracer) })
}

fn release(tracer: &Arc<Tracer>) {
    tracer.enabled.store(false, Ordering::Release);
    // An append already holding the record lock finishes first; later ones see the flag.
    drop(tracer.record.lock().unwrap_or_else(PoisonError::into_inner));
    {
        let mut active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().map_or(false, |current| Arc::ptr_eq(current, tracer)) {
            *active = None;
        }
    }
    detach_current_thread();
    debug!("tracer uninstalled");
}

/// The installed tracer, if any
pub fn active() -> Option<Arc<Tracer>> {
    ACTIVE.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn attach(tracer: Arc<Tracer>) {
    let history = LineHistory::new(tracer.options.context_lines);
    let _ = HOOK.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            *slot = Some(ThreadHook { tracer, history });
        }
    });
}

/// Attaches the installed tracer to the calling thread. Returns false when none is installed.
pub fn attach_current_thread() -> bool {
    match active() {
        Some(tracer) => {
            attach(tracer);
            true
        }
        None => false,
    }
}

/// Like [`attach_current_thread`], but keeps an existing attachment and its line history.
/// For host trace functions that only learn about a thread on its first event.
pub fn ensure_attached() -> bool {
    let attached = HOOK
        .try_with(|slot| slot.try_borrow().map_or(true, |hook| hook.is_some()))
        .unwrap_or(false);
    attached || attach_current_thread()
}

pub fn detach_current_thread() {
    let _ = HOOK.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            *slot = None;
        }
    });
}

/// Spawns a thread that reports to the tracer installed at spawn time
pub fn spawn<F, T>(f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let tracer = active();
    thread::spawn(move || {
        if let Some(tracer) = tracer {
            attach(tracer);
        }
        f()
    })
}

/// Entry point for the host: reports one event on the calling thread.
///
/// Events raised while this thread is already inside the hook are ignored.
pub fn dispatch(kind: EventKind, frame: &dyn Frame) {
    let _ = HOOK.try_with(|slot| {
        let Ok(mut slot) = slot.try_borrow_mut() else {
            return;
        };
        let stale = match slot.as_mut() {
            Some(hook) if hook.tracer.is_enabled() => {
                hook.tracer.handle(kind, frame, &mut hook.history);
                false
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            *slot = None;
        }
    });
}
