//! Safe serialisation of console arguments.
//!
//! Arguments may share containers and may even contain themselves. The
//! serialiser tracks the identity of every container on the current path and
//! writes [`CIRCULAR_MARKER`] instead of descending into one twice. Anything
//! that still cannot be serialised (a container that is mutably borrowed,
//! nesting deeper than [`MAX_DEPTH`]) falls back to the argument's `Display`
//! form.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use serde_json::{Map, Value};

/// Written in place of a container that is already being serialised.
pub const CIRCULAR_MARKER: &str = "[Circular]";

/// Nesting limit before serialisation gives up and falls back.
pub const MAX_DEPTH: usize = 64;

/// A shared, mutable container.
pub type Shared<T> = Rc<RefCell<T>>;

/// The `{name, message, stack}` form of an error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    /// Captures an error, naming it after its type. The `source()` chain
    /// becomes the stack.
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let name = full.rsplit("::").next().unwrap_or(full).to_string();
        Self::named(name, err)
    }

    /// Captures an error under an explicit name.
    pub fn named<E: std::error::Error + ?Sized>(name: impl Into<String>, err: &E) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            name: name.into(),
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

/// A console argument.
#[derive(Debug, Clone)]
pub enum Arg {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    List(Shared<Vec<Arg>>),
    Map(Shared<Vec<(String, Arg)>>),
    Error(ErrorInfo),
    /// Already-structured data.
    Json(Value),
}

impl Arg {
    pub fn list(items: Vec<Arg>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Arg)>) -> Self {
        Self::Map(Rc::new(RefCell::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        Self::Error(ErrorInfo::from_error(err))
    }

    /// Uses the `Debug` rendering of an arbitrary value.
    pub fn debug(value: &impl fmt::Debug) -> Self {
        Self::Str(format!("{value:?}"))
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// String coercion. Never borrows containers, so it cannot fail.
impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
            Self::List(_) => f.write_str("[list]"),
            Self::Map(_) => f.write_str("[object]"),
            Self::Error(e) => write!(f, "{}: {}", e.name, e.message),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug)]
enum WalkError {
    Borrowed,
    TooDeep,
}

/// Serialises one argument. Never panics and never fails.
pub fn serialize_arg(arg: &Arg) -> Value {
    let mut path = Vec::new();
    match walk(arg, &mut path) {
        Ok(value) => value,
        Err(_) => Value::String(arg.to_string()),
    }
}

/// Serialises every argument independently.
pub fn serialize_args(args: &[Arg]) -> Vec<Value> {
    args.iter().map(serialize_arg).collect()
}

/// Joins arguments into a console line: strings verbatim, everything else
/// as compact JSON.
pub fn render_message(args: &[Arg]) -> String {
    args.iter()
        .map(|arg| match arg {
            Arg::Str(s) => s.clone(),
            other => match serialize_arg(other) {
                Value::String(s) => s,
                v => v.to_string(),
            },
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn walk(arg: &Arg, path: &mut Vec<usize>) -> Result<Value, WalkError> {
    if path.len() >= MAX_DEPTH {
        return Err(WalkError::TooDeep);
    }
    Ok(match arg {
        Arg::Null => Value::Null,
        Arg::Bool(b) => Value::Bool(*b),
        Arg::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(n.to_string())),
        Arg::Str(s) => Value::String(s.clone()),
        Arg::Json(v) => v.clone(),
        Arg::Error(e) => serde_json::to_value(e).unwrap_or_else(|_| Value::String(arg.to_string())),
        Arg::List(items) => {
            let id = Rc::as_ptr(items) as *const () as usize;
            if path.contains(&id) {
                return Ok(Value::String(CIRCULAR_MARKER.to_string()));
            }
            let items = items.try_borrow().map_err(|_| WalkError::Borrowed)?;
            path.push(id);
            let out = items
                .iter()
                .map(|item| walk(item, path))
                .collect::<Result<Vec<_>, _>>();
            path.pop();
            Value::Array(out?)
        }
        Arg::Map(entries) => {
            let id = Rc::as_ptr(entries) as *const () as usize;
            if path.contains(&id) {
                return Ok(Value::String(CIRCULAR_MARKER.to_string()));
            }
            let entries = entries.try_borrow().map_err(|_| WalkError::Borrowed)?;
            path.push(id);
            let mut map = Map::new();
            let mut result = Ok(());
            for (key, value) in entries.iter() {
                match walk(value, path) {
                    Ok(v) => {
                        map.insert(key.clone(), v);
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            path.pop();
            result?;
            Value::Object(map)
        }
    })
}
