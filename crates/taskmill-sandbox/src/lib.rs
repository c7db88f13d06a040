//! `taskmill-sandbox`: restricted in-process execution of submitted code.
//!
//! Submitted source is Python, run on an embedded interpreter through pyo3.
//! It is screened by the static [`checker::SafetyChecker`], then executed as
//! a module whose global scope holds only a fixed set of builtins and the
//! allow-listed standard modules; the entry point is called with JSON
//! arguments and its return value converted back to JSON.
//!
//! Every run is bounded by a traced step budget, a wall-clock deadline and a
//! cap on captured `print` output. This is a compatibility minimum, not an
//! isolation boundary: untrusted input belongs in the container back-end.

pub mod checker;
pub mod error;

mod budget;
mod scope;

use std::time::{Duration, Instant};

use pyo3::prelude::*;
use pyo3::types::{
    PyBool, PyDict, PyFloat, PyFrozenSet, PyInt, PyList, PySet, PyString, PyTuple,
};
use pythonize::{depythonize, pythonize};
use serde_json::{Map, Value as Json};
use taskmill_core::config::SandboxConfig;
use tracing::debug;

pub use checker::{SafetyChecker, SafetyVerdict};
pub use error::{Result, ScriptError};
pub use scope::SAFE_BUILTINS;

use budget::{Budget, Trip};
use scope::Scope;

/// Resource bounds for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Traced call and line events before the run is cut off.
    pub max_steps: u64,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            timeout: config.execution_timeout(),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    /// Return value of the entry point, converted to JSON.
    pub value: Json,
    /// Captured `print` output, truncated at the output cap.
    pub stdout: String,
    /// Traced steps consumed.
    pub steps: u64,
}

/// A configured sandbox. Cheap to clone; each [`Sandbox::run`] starts from
/// a fresh global scope.
#[derive(Debug, Clone)]
pub struct Sandbox {
    limits: SandboxLimits,
    allowed_modules: Vec<String>,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits, allowed_modules: Vec<String>) -> Self {
        Self {
            limits,
            allowed_modules,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(SandboxLimits::from(config), config.allowed_modules.clone())
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn allowed_modules(&self) -> &[String] {
        &self.allowed_modules
    }

    /// Run `source` as a module, then call `entry` with the given arguments.
    ///
    /// Blocks the calling thread, holding the interpreter lock, until the
    /// script returns or a limit trips. Call it from a blocking context.
    pub fn run(
        &self,
        source: &str,
        entry: &str,
        args: &[Json],
        kwargs: &Map<String, Json>,
    ) -> Result<RunOutput> {
        Python::with_gil(|py| self.run_in(py, source, entry, args, kwargs))
    }

    fn run_in(
        &self,
        py: Python<'_>,
        source: &str,
        entry: &str,
        args: &[Json],
        kwargs: &Map<String, Json>,
    ) -> Result<RunOutput> {
        let scope = Scope::build(py, &self.allowed_modules, self.limits.max_output_bytes)
            .map_err(|e| ScriptError::Internal(format!("could not build the scope: {e}")))?;
        let (args, kwargs) = to_python(py, args, kwargs)
            .map_err(|e| ScriptError::Internal(format!("could not convert arguments: {e}")))?;

        let started = Instant::now();
        let budget = Budget::start(py, self.limits.max_steps, self.limits.timeout);
        let outcome = scope.exec(source).and_then(|()| match scope.entry(entry)? {
            Some(func) => func.call(&args, Some(&kwargs)).map(Some),
            None => Ok(None),
        });
        let usage = budget.stop();
        let wall = started.elapsed();

        debug!(entry, steps = usage.steps, ?wall, ok = outcome.is_ok(), "sandbox run finished");
        match usage.tripped {
            Some(Trip::Steps) => return Err(ScriptError::StepLimit(self.limits.max_steps)),
            Some(Trip::Deadline) => return Err(ScriptError::Timeout(self.limits.timeout)),
            // a single native call emits no trace events, so the hook never saw the deadline
            None if wall >= self.limits.timeout => {
                return Err(ScriptError::Timeout(self.limits.timeout))
            }
            None => {}
        }
        let value = match outcome {
            Ok(Some(value)) => value,
            Ok(None) => return Err(ScriptError::EntryPointMissing(entry.to_string())),
            Err(err) => return Err(ScriptError::from_py(py, &err)),
        };
        Ok(RunOutput {
            value: to_json(&value),
            stdout: scope.stdout(),
            steps: usage.steps,
        })
    }
}

fn to_python<'py>(
    py: Python<'py>,
    args: &[Json],
    kwargs: &Map<String, Json>,
) -> PyResult<(Bound<'py, PyTuple>, Bound<'py, PyDict>)> {
    let positional = args
        .iter()
        .map(|arg| pythonize(py, arg).map_err(PyErr::from))
        .collect::<PyResult<Vec<_>>>()?;
    let keywords = PyDict::new(py);
    for (key, value) in kwargs {
        keywords.set_item(key, pythonize(py, value)?)?;
    }
    Ok((PyTuple::new(py, positional)?, keywords))
}

/// Containers nested deeper than this convert to a placeholder.
const MAX_JSON_DEPTH: usize = 64;

/// JSON view of a return value, converted element by element. Integers
/// beyond 64 bits become decimal strings; values with no JSON form become
/// a type placeholder without disturbing their siblings.
fn to_json(value: &Bound<'_, PyAny>) -> Json {
    to_json_at(value, 0)
}

fn to_json_at(value: &Bound<'_, PyAny>, depth: usize) -> Json {
    if value.is_none() {
        return Json::Null;
    }
    if depth > MAX_JSON_DEPTH {
        return placeholder(value);
    }
    if let Ok(b) = value.downcast::<PyBool>() {
        return Json::Bool(b.is_true());
    }
    if value.is_instance_of::<PyInt>() {
        if let Ok(n) = value.extract::<i64>() {
            return Json::from(n);
        }
        if let Ok(n) = value.extract::<u64>() {
            return Json::from(n);
        }
        return match value.str() {
            Ok(digits) => Json::String(digits.to_string()),
            Err(_) => placeholder(value),
        };
    }
    if let Ok(f) = value.downcast::<PyFloat>() {
        return serde_json::Number::from_f64(f.value()).map_or(Json::Null, Json::Number);
    }
    if let Ok(s) = value.downcast::<PyString>() {
        return s
            .to_str()
            .map(|s| Json::String(s.to_string()))
            .unwrap_or_else(|_| placeholder(value));
    }
    if let Ok(dict) = value.downcast::<PyDict>() {
        let mut map = Map::with_capacity(dict.len());
        for (key, item) in dict.iter() {
            let key = match key.downcast::<PyString>() {
                Ok(s) => s.to_string(),
                Err(_) => match to_json_at(&key, depth + 1) {
                    Json::String(s) => s,
                    other => other.to_string(),
                },
            };
            map.insert(key, to_json_at(&item, depth + 1));
        }
        return Json::Object(map);
    }
    if value.is_instance_of::<PyList>()
        || value.is_instance_of::<PyTuple>()
        || value.is_instance_of::<PySet>()
        || value.is_instance_of::<PyFrozenSet>()
    {
        if let Ok(items) = value.try_iter() {
            return Json::Array(
                items
                    .map(|item| match item {
                        Ok(item) => to_json_at(&item, depth + 1),
                        Err(_) => Json::Null,
                    })
                    .collect(),
            );
        }
    }
    depythonize::<Json>(value).unwrap_or_else(|_| placeholder(value))
}

fn placeholder(value: &Bound<'_, PyAny>) -> Json {
    let type_name = value
        .get_type()
        .name()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "object".to_string());
    Json::String(format!("<{type_name} object>"))
}
