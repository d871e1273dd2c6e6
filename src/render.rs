// src/render.rs

//! Best-effort textual rendering of values whose type is only known to the host runtime.
//!
//! Rendering an individual value may fail or even panic; [`render_total`] turns either into
//! [`UNREPRESENTABLE`] so capture can never fail because of a value.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::debug;

/// Stands in for a value whose own rendering failed
pub const UNREPRESENTABLE: &str = "<unrepresentable object>";

/// Stands in for the receiver of a constructor that has not finished running
pub const PARTIALLY_INITIALIZED: &str = "<partially initialized object>";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct RenderError(pub String);

/// Something that can produce its standard textual form, or fail trying
pub trait Render {
    fn render(&self) -> Result<String, RenderError>;
}

/// A runtime value handed over by the host: primitives, composites, or opaque objects
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// An object that renders itself
    Object(Box<dyn Render + Send + Sync>),
    /// An object known to have no textual form
    Unrepresentable(String),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_total(self))
    }
}

/// Single quotes unless the text has a single quote and no double quote
fn quote(s: &str) -> String {
    let delim = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delim);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

/// Shortest round-trip form with a signed, two-digit exponent (`1e+20`, `1e-05`)
fn float_repr(x: f64) -> String {
    let text = format!("{x:?}");
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exp),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => text,
    }
}

fn render_seq(items: &[Value]) -> Result<Vec<String>, RenderError> {
    items.iter().map(Render::render).collect()
}

impl Render for Value {
    fn render(&self) -> Result<String, RenderError> {
        Ok(match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(x) if x.is_nan() => "nan".to_string(),
            Value::Float(x) if x.is_infinite() => {
                (if *x > 0.0 { "inf" } else { "-inf" }).to_string()
            }
            Value::Float(x) => float_repr(*x),
            Value::Str(s) => quote(s),
            Value::List(items) => format!("[{}]", render_seq(items)?.join(", ")),
            Value::Tuple(items) if items.len() == 1 => format!("({},)", items[0].render()?),
            Value::Tuple(items) => format!("({})", render_seq(items)?.join(", ")),
            Value::Map(entries) => {
                let mut parts = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    parts.push(format!("{}: {}", key.render()?, value.render()?));
                }
                format!("{{{}}}", parts.join(", "))
            }
            Value::Object(object) => object.render()?,
            Value::Unrepresentable(reason) => return Err(RenderError(reason.clone())),
        })
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::None, Into::into)
    }
}

/// Renders `value`, never failing: errors and panics become [`UNREPRESENTABLE`]
pub fn render_total(value: &(dyn Render + '_)) -> String {
    match panic::catch_unwind(AssertUnwindSafe(|| value.render())) {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => {
            debug!(error = %err, "value could not be rendered");
            UNREPRESENTABLE.to_string()
        }
        Err(_) => {
            debug!("value rendering panicked");
            UNREPRESENTABLE.to_string()
        }
    }
}

/// Renders one local variable of a frame.
///
/// While a constructor is running, the receiver is not rendered at all.
pub fn render_variable(name: &str, value: &(dyn Render + '_), under_init: bool, receiver: &str) -> String {
    if under_init && name == receiver {
        return PARTIALLY_INITIALIZED.to_string();
    }
    render_total(value)
}
