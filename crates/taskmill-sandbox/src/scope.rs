//! The global scope submitted code runs in.
//!
//! `__builtins__` is a fresh dict holding only [`SAFE_BUILTINS`], the
//! built-in exception classes, a `print` bound to a capped capture buffer
//! and an `__import__` gate that admits the allow-listed modules alone.
//! Allow-listed modules are also pre-bound as globals.

use pyo3::exceptions::{PyBaseException, PyImportError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyType};
use tracing::debug;

/// Filename compiled code reports in tracebacks.
pub(crate) const TASK_FILENAME: &str = "<task>";

/// Builtins copied into the restricted scope. Everything else, including
/// `open`, `eval`, `exec`, `compile`, `getattr` and `type`, is absent.
pub const SAFE_BUILTINS: &[&str] = &[
    "__build_class__", "abs", "all", "any", "ascii", "bin", "bool", "bytearray", "bytes",
    "callable", "chr", "classmethod", "complex", "dict", "divmod", "enumerate", "filter", "float",
    "format", "frozenset", "hash", "hex", "int", "isinstance", "issubclass", "iter", "len",
    "list", "map", "max", "min", "next", "object", "oct", "ord", "pow", "property", "range",
    "repr", "reversed", "round", "set", "slice", "sorted", "staticmethod", "str", "sum", "super",
    "tuple", "zip", "Ellipsis", "NotImplemented",
];

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// `file=` target of the scope's `print`. Keeps the first `limit` bytes.
#[pyclass(module = "taskmill_sandbox")]
pub(crate) struct OutputSink {
    buf: String,
    limit: usize,
    truncated: bool,
}

#[pymethods]
impl OutputSink {
    fn write(&mut self, text: &str) -> usize {
        let room = self.limit.saturating_sub(self.buf.len());
        if text.len() <= room {
            self.buf.push_str(text);
        } else {
            let mut cut = room;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buf.push_str(&text[..cut]);
            self.truncated = true;
        }
        text.chars().count()
    }

    fn flush(&self) {}
}

impl OutputSink {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    fn contents(&self) -> String {
        if self.truncated {
            format!("{}{TRUNCATION_MARKER}", self.buf)
        } else {
            self.buf.clone()
        }
    }
}

/// `__import__` replacement. Absolute imports whose root is allow-listed
/// are forwarded to the real import; everything else raises `ImportError`.
#[pyclass(module = "taskmill_sandbox")]
pub(crate) struct ImportGate {
    allowed: Vec<String>,
    import: Py<PyAny>,
}

#[pymethods]
impl ImportGate {
    #[pyo3(signature = (name, globals=None, locals=None, fromlist=None, level=0))]
    fn __call__<'py>(
        &self,
        py: Python<'py>,
        name: &str,
        globals: Option<Bound<'py, PyAny>>,
        locals: Option<Bound<'py, PyAny>>,
        fromlist: Option<Bound<'py, PyAny>>,
        level: i32,
    ) -> PyResult<Bound<'py, PyAny>> {
        let root = name.split('.').next().unwrap_or(name);
        if level != 0 || !self.allowed.iter().any(|m| m == root) {
            return Err(PyImportError::new_err(format!(
                "import of '{name}' is not allowed in the sandbox"
            )));
        }
        self.import
            .bind(py)
            .call1((name, globals, locals, fromlist, level))
    }
}

pub(crate) struct Scope<'py> {
    globals: Bound<'py, PyDict>,
    sink: Bound<'py, OutputSink>,
}

impl<'py> Scope<'py> {
    pub fn build(py: Python<'py>, allowed: &[String], max_output: usize) -> PyResult<Self> {
        let builtins = PyModule::import(py, "builtins")?;
        let restricted = PyDict::new(py);
        for name in SAFE_BUILTINS {
            if let Ok(value) = builtins.getattr(*name) {
                restricted.set_item(*name, value)?;
            }
        }
        for (name, value) in builtins.dict().iter() {
            if let Ok(ty) = value.downcast::<PyType>() {
                if ty.is_subclass_of::<PyBaseException>()? {
                    restricted.set_item(name, ty)?;
                }
            }
        }

        let sink = Bound::new(py, OutputSink::new(max_output))?;
        let print_kwargs = PyDict::new(py);
        print_kwargs.set_item("file", &sink)?;
        let print = PyModule::import(py, "functools")?
            .getattr("partial")?
            .call((builtins.getattr("print")?,), Some(&print_kwargs))?;
        restricted.set_item("print", print)?;

        let gate = ImportGate {
            allowed: allowed.to_vec(),
            import: builtins.getattr("__import__")?.unbind(),
        };
        restricted.set_item("__import__", Bound::new(py, gate)?)?;

        let globals = PyDict::new(py);
        globals.set_item("__builtins__", restricted)?;
        globals.set_item("__name__", "__task__")?;
        for module in allowed {
            match PyModule::import(py, module.as_str()) {
                Ok(m) => globals.set_item(module, m)?,
                Err(err) => debug!(module = %module, error = %err, "allowed module unavailable"),
            }
        }
        Ok(Self { globals, sink })
    }

    /// Compile `source` and run it as the module body.
    pub fn exec(&self, source: &str) -> PyResult<()> {
        let builtins = PyModule::import(self.globals.py(), "builtins")?;
        let code = builtins
            .getattr("compile")?
            .call1((source, TASK_FILENAME, "exec"))?;
        builtins.getattr("exec")?.call1((code, &self.globals))?;
        Ok(())
    }

    pub fn entry(&self, name: &str) -> PyResult<Option<Bound<'py, PyAny>>> {
        self.globals.get_item(name)
    }

    pub fn stdout(&self) -> String {
        self.sink.borrow().contents()
    }
}
