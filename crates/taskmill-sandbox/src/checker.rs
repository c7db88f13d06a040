//! Static safety gate for submitted code.
//!
//! Allow by default, deny by pattern: the checker parses the source with the
//! interpreter's own `ast` module, then rejects imports of process, network,
//! IPC and reflection modules and calls to evaluation or introspection
//! primitives. It never runs the code.

use std::fmt;

use pyo3::exceptions::PySyntaxError;
use pyo3::prelude::*;
use tracing::warn;

use crate::error::ScriptError;

/// Modules a submission may not import, matched on the full dotted name or
/// its first segment.
pub const FORBIDDEN_MODULES: &[&str] = &[
    "os", "sys", "subprocess", "shutil", "tempfile", "socket", "urllib", "requests", "http",
    "ftplib", "smtplib", "poplib", "imaplib", "telnetlib", "multiprocessing", "threading",
    "asyncio", "pickle", "marshal", "ctypes", "mmap", "signal", "pwd", "grp", "crypt", "termios",
    "fcntl", "select", "epoll", "kqueue", "builtins", "__builtins__", "__import__", "eval",
    "exec", "compile", "input",
];

/// Names a submission may not call, either directly or as an attribute.
pub const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "eval", "exec", "compile", "input", "raw_input", "open", "file", "reload", "delattr",
    "setattr", "getattr", "hasattr", "vars", "locals", "globals", "dir", "type", "isinstance",
    "issubclass", "super", "property", "staticmethod", "classmethod",
];

pub const DEFAULT_MAX_CODE_SIZE: usize = 1024 * 1024;

pub fn is_forbidden_module(name: &str) -> bool {
    let root = name.split('.').next().unwrap_or(name);
    FORBIDDEN_MODULES.contains(&name) || FORBIDDEN_MODULES.contains(&root)
}

pub fn is_forbidden_function(name: &str) -> bool {
    FORBIDDEN_FUNCTIONS.contains(&name)
}

/// Outcome of a safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub safe: bool,
    /// Summary of the first failing rule. `None` when safe.
    pub reason: Option<String>,
    /// Every offending construct found by the failing rule.
    pub issues: Vec<String>,
}

impl SafetyVerdict {
    fn accept() -> Self {
        Self {
            safe: true,
            reason: None,
            issues: Vec::new(),
        }
    }

    fn reject(reason: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
            issues,
        }
    }

    /// Reason plus issues, suitable for an error message.
    pub fn message(&self) -> String {
        match (&self.reason, self.issues.is_empty()) {
            (None, _) => "code passed the safety check".to_string(),
            (Some(reason), true) => reason.clone(),
            (Some(reason), false) => format!("{reason}: {}", self.issues.join("; ")),
        }
    }
}

impl fmt::Display for SafetyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Stateless checker. Cheap to copy.
#[derive(Debug, Clone, Copy)]
pub struct SafetyChecker {
    max_code_size: usize,
}

impl Default for SafetyChecker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CODE_SIZE)
    }
}

impl SafetyChecker {
    pub fn new(max_code_size: usize) -> Self {
        Self { max_code_size }
    }

    pub fn max_code_size(&self) -> usize {
        self.max_code_size
    }

    pub fn check(&self, source: &str) -> SafetyVerdict {
        if source.len() > self.max_code_size {
            return SafetyVerdict::reject(
                format!(
                    "code size {} bytes exceeds the limit of {} bytes",
                    source.len(),
                    self.max_code_size
                ),
                Vec::new(),
            );
        }
        Python::with_gil(|py| match scan(py, source) {
            Ok(scan) => scan.verdict(),
            Err(err) if err.is_instance_of::<PySyntaxError>(py) => SafetyVerdict::reject(
                "syntax error",
                vec![ScriptError::from_py(py, &err).to_string()],
            ),
            Err(err) => {
                warn!(error = %err, "code could not be inspected");
                SafetyVerdict::reject("code could not be inspected", vec![err.to_string()])
            }
        })
    }
}

/// Offending constructs, each tagged with its line for ordering.
#[derive(Default)]
struct Scan {
    imports: Vec<(usize, String)>,
    calls: Vec<(usize, String)>,
}

impl Scan {
    fn verdict(mut self) -> SafetyVerdict {
        if !self.imports.is_empty() {
            return SafetyVerdict::reject("forbidden import", ordered(&mut self.imports));
        }
        if !self.calls.is_empty() {
            return SafetyVerdict::reject("forbidden call", ordered(&mut self.calls));
        }
        SafetyVerdict::accept()
    }
}

fn ordered(issues: &mut [(usize, String)]) -> Vec<String> {
    issues.sort_by_key(|(line, _)| *line);
    issues.iter().map(|(_, issue)| issue.clone()).collect()
}

/// Node classes of the `ast` module the scan matches on.
struct NodeKinds<'py> {
    import: Bound<'py, PyAny>,
    import_from: Bound<'py, PyAny>,
    call: Bound<'py, PyAny>,
    name: Bound<'py, PyAny>,
    attribute: Bound<'py, PyAny>,
}

impl<'py> NodeKinds<'py> {
    fn load(ast: &Bound<'py, PyModule>) -> PyResult<Self> {
        Ok(Self {
            import: ast.getattr("Import")?,
            import_from: ast.getattr("ImportFrom")?,
            call: ast.getattr("Call")?,
            name: ast.getattr("Name")?,
            attribute: ast.getattr("Attribute")?,
        })
    }
}

fn scan(py: Python<'_>, source: &str) -> PyResult<Scan> {
    let ast = PyModule::import(py, "ast")?;
    let tree = ast.call_method1("parse", (source, "<task>"))?;
    let kinds = NodeKinds::load(&ast)?;
    let mut scan = Scan::default();

    for node in ast.call_method1("walk", (tree,))?.try_iter()? {
        let node = node?;
        if node.is_instance(&kinds.import)? {
            let line = lineno(&node)?;
            for alias in node.getattr("names")?.try_iter()? {
                let name: String = alias?.getattr("name")?.extract()?;
                if is_forbidden_module(&name) {
                    scan.imports
                        .push((line, format!("import of '{name}' (line {line})")));
                }
            }
        } else if node.is_instance(&kinds.import_from)? {
            let level: Option<usize> = node.getattr("level")?.extract()?;
            let module: Option<String> = node.getattr("module")?.extract()?;
            if let (0, Some(module)) = (level.unwrap_or(0), module) {
                if is_forbidden_module(&module) {
                    let line = lineno(&node)?;
                    scan.imports
                        .push((line, format!("import from '{module}' (line {line})")));
                }
            }
        } else if node.is_instance(&kinds.call)? {
            let func = node.getattr("func")?;
            if func.is_instance(&kinds.name)? {
                let name: String = func.getattr("id")?.extract()?;
                if is_forbidden_function(&name) {
                    let line = lineno(&node)?;
                    scan.calls
                        .push((line, format!("call to '{name}' (line {line})")));
                }
            } else if func.is_instance(&kinds.attribute)? {
                let attr: String = func.getattr("attr")?.extract()?;
                if is_forbidden_function(&attr) {
                    let line = lineno(&node)?;
                    scan.calls
                        .push((line, format!("method call '.{attr}' (line {line})")));
                }
            }
        }
    }
    Ok(scan)
}

fn lineno(node: &Bound<'_, PyAny>) -> PyResult<usize> {
    node.getattr("lineno")?.extract()
}
