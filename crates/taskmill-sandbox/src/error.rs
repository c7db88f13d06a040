use std::time::Duration;

use pyo3::exceptions::PySyntaxError;
use pyo3::prelude::*;
use thiserror::Error;

/// Why a script could not be compiled or did not finish.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// Source failed to compile.
    #[error("SyntaxError: {message} (line {line})")]
    Syntax { line: usize, message: String },

    /// An exception escaped the entry point or the module body.
    #[error("{kind}: {message}")]
    Exception {
        kind: String,
        message: String,
        traceback: String,
    },

    /// The module ran but did not define the requested entry point.
    #[error("function '{0}' not found in code")]
    EntryPointMissing(String),

    /// The traced step budget ran out.
    #[error("execution exceeded the step budget of {0} steps")]
    StepLimit(u64),

    /// The wall-clock deadline passed.
    #[error("execution exceeded the time limit of {0:?}")]
    Timeout(Duration),

    /// The embedded interpreter could not set up the run.
    #[error("sandbox failure: {0}")]
    Internal(String),
}

impl ScriptError {
    /// True for budget or deadline exhaustion.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ScriptError::StepLimit(_) | ScriptError::Timeout(_))
    }

    pub fn traceback(&self) -> Option<&str> {
        match self {
            ScriptError::Exception { traceback, .. } => Some(traceback),
            _ => None,
        }
    }

    /// Classify an exception raised while compiling or running user code.
    ///
    /// Must be called with the step budget uninstalled: formatting the
    /// traceback runs interpreter code.
    pub(crate) fn from_py(py: Python<'_>, err: &PyErr) -> Self {
        if err.is_instance_of::<PySyntaxError>(py) {
            return Self::syntax(py, err);
        }
        let kind = err
            .get_type(py)
            .name()
            .map(|name| name.to_string())
            .unwrap_or_else(|_| "Exception".to_string());
        let message = err.value(py).to_string();
        let traceback = format_traceback(py, err).unwrap_or_else(|_| format!("{kind}: {message}"));
        ScriptError::Exception {
            kind,
            message,
            traceback,
        }
    }

    fn syntax(py: Python<'_>, err: &PyErr) -> Self {
        let value = err.value(py);
        let line = value
            .getattr("lineno")
            .and_then(|l| l.extract::<Option<usize>>())
            .ok()
            .flatten()
            .unwrap_or(0);
        let message = value
            .getattr("msg")
            .and_then(|m| m.extract::<String>())
            .unwrap_or_else(|_| value.to_string());
        ScriptError::Syntax { line, message }
    }
}

fn format_traceback(py: Python<'_>, err: &PyErr) -> PyResult<String> {
    let value = err.value(py);
    let lines: Vec<String> = PyModule::import(py, "traceback")?
        .call_method1(
            "format_exception",
            (value.get_type(), value, value.getattr("__traceback__")?),
        )?
        .extract()?;
    Ok(lines.concat().trim_end().to_string())
}

pub type Result<T> = std::result::Result<T, ScriptError>;
