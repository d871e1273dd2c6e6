// src/python.rs

//! pytest entry points, built as the `bugtrace_plugin` extension module.
//!
//! `python -m pytest -p bugtrace_plugin` picks up the `pytest_*` functions below as hook
//! implementations. The trace function handed to `sys.settrace` and `threading.settrace`
//! forwards every interpreter event to [`trace::dispatch`].

use crate::config::Config;
use crate::model::LineNo;
use crate::plugin::{SessionPlugin, TestItem};
use crate::render::{Render, RenderError};
use crate::trace::{self, EventKind, Frame};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::PyList;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

static PLUGIN: Mutex<Option<SessionPlugin>> = Mutex::new(None);

fn runtime_error(err: impl std::fmt::Display) -> PyErr {
    PyRuntimeError::new_err(err.to_string())
}

/// Interpreter frame seen through the [`Frame`] trait
struct HostFrame<'py> {
    frame: Bound<'py, PyAny>,
    file: String,
    line: LineNo,
    function: String,
}

impl<'py> HostFrame<'py> {
    fn new(frame: &Bound<'py, PyAny>) -> PyResult<Self> {
        let code = frame.getattr("f_code")?;
        Ok(Self {
            file: code.getattr("co_filename")?.extract()?,
            line: frame.getattr("f_lineno")?.extract::<Option<LineNo>>()?.unwrap_or(0),
            function: code.getattr("co_name")?.extract()?,
            frame: frame.clone(),
        })
    }
}

impl<'py> Frame for HostFrame<'py> {
    fn file(&self) -> &str {
        &self.file
    }

    fn line(&self) -> LineNo {
        self.line
    }

    fn function(&self) -> &str {
        &self.function
    }

    fn for_each_local(&self, visit: &mut dyn FnMut(&str, &dyn Render)) {
        let items = self
            .frame
            .getattr("f_locals")
            .and_then(|locals| locals.call_method0("items"))
            .and_then(|items| items.try_iter());
        let items = match items {
            Ok(items) => items,
            Err(err) => {
                warn!(file = %self.file, line = self.line, error = %err, "frame locals unavailable");
                return;
            }
        };
        for item in items.flatten() {
            if let Ok((name, value)) = item.extract::<(String, Bound<'py, PyAny>)>() {
                visit(&name, &HostValue(value));
            }
        }
    }
}

/// A live interpreter object, rendered with `repr()`
struct HostValue<'py>(Bound<'py, PyAny>);

impl Render for HostValue<'_> {
    fn render(&self) -> Result<String, RenderError> {
        self.0
            .repr()
            .map(|text| text.to_string())
            .map_err(|err| RenderError(err.to_string()))
    }
}

/// Global and local trace function in one
#[pyclass(frozen)]
struct TraceHook;

#[pymethods]
impl TraceHook {
    fn __call__<'py>(
        slf: Bound<'py, Self>,
        frame: &Bound<'py, PyAny>,
        event: &str,
        _arg: &Bound<'py, PyAny>,
    ) -> PyResult<Option<Bound<'py, Self>>> {
        let Some(kind) = EventKind::from_host(event) else {
            return Ok(Some(slf));
        };
        if !trace::ensure_attached() {
            return Ok(None);
        }
        trace::dispatch(kind, &HostFrame::new(frame)?);
        Ok(Some(slf))
    }
}

fn set_trace(py: Python<'_>, hook: PyObject) -> PyResult<()> {
    py.import("threading")?.call_method1("settrace", (hook.clone_ref(py),))?;
    py.import("sys")?.call_method1("settrace", (hook,))?;
    Ok(())
}

/// Timeout already requested by a `timeout` mark, positional or keyword
fn current_timeout(item: &Bound<'_, PyAny>) -> PyResult<Option<Duration>> {
    let marker = item.call_method1("get_closest_marker", ("timeout",))?;
    if marker.is_none() {
        return Ok(None);
    }
    let value = marker
        .getattr("args")
        .and_then(|args| args.get_item(0))
        .or_else(|_| marker.getattr("kwargs").and_then(|kwargs| kwargs.get_item("timeout")))
        .ok();
    Ok(value
        .and_then(|value| value.extract::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok()))
}

#[pyfunction]
fn pytest_sessionstart(session: &Bound<'_, PyAny>) -> PyResult<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let py = session.py();
    let pytest_config = session.getattr("config")?;
    let collect_only: bool = pytest_config.getattr("option")?.getattr("collectonly")?.extract()?;
    let root: PathBuf = pytest_config.getattr("rootpath")?.extract()?;

    let cwd = std::env::current_dir().map_err(runtime_error)?;
    let config = Config::load(None, &cwd).map_err(runtime_error)?;
    let mut plugin = SessionPlugin::from_config(&config, &root).map_err(runtime_error)?;
    plugin.session_start(collect_only).map_err(runtime_error)?;
    if plugin.is_tracing() {
        set_trace(py, Py::new(py, TraceHook)?.into_any())?;
    }
    *PLUGIN.lock().unwrap_or_else(PoisonError::into_inner) = Some(plugin);
    Ok(())
}

#[pyfunction]
fn pytest_collection_modifyitems(items: &Bound<'_, PyList>) -> PyResult<()> {
    let slot = PLUGIN.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(plugin) = slot.as_ref() else {
        return Ok(());
    };

    let mut tests = Vec::with_capacity(items.len());
    for item in items.iter() {
        let node_id: String = item.getattr("nodeid")?.extract()?;
        tests.push(TestItem { timeout: current_timeout(&item)?, ..TestItem::new(&node_id) });
    }
    let before: Vec<Option<Duration>> = tests.iter().map(|test| test.timeout).collect();
    plugin.modify_items(&mut tests);

    let mark = items.py().import("pytest")?.getattr("mark")?.getattr("timeout")?;
    for ((item, test), old) in items.iter().zip(&tests).zip(before) {
        if let Some(timeout) = test.timeout.filter(|_| test.timeout != old) {
            item.call_method1("add_marker", (mark.call1((timeout.as_secs_f64(),))?,))?;
        }
    }
    Ok(())
}

#[pyfunction]
fn pytest_sessionfinish(session: &Bound<'_, PyAny>) -> PyResult<()> {
    let py = session.py();
    let Some(mut plugin) = PLUGIN.lock().unwrap_or_else(PoisonError::into_inner).take() else {
        return Ok(());
    };
    if plugin.is_tracing() {
        set_trace(py, py.None())?;
    }
    if let Some(record) = plugin.session_finish().map_err(runtime_error)? {
        info!(snapshots = record.snapshot_count(), "trace record written");
    }
    Ok(())
}

#[pymodule]
#[pyo3(name = "bugtrace_plugin")]
fn python_plugin(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(pytest_sessionstart, m)?)?;
    m.add_function(wrap_pyfunction!(pytest_collection_modifyitems, m)?)?;
    m.add_function(wrap_pyfunction!(pytest_sessionfinish, m)?)?;
    m.add_class::<TraceHook>()?;
    Ok(())
}
