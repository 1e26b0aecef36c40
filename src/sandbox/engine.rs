//! The execution engine: a persistent Python namespace behind the
//! primitive policy, the filesystem gateway and the wall-clock boundary.
//!
//! One engine instance serves one orchestration session. The namespace it
//! owns survives across sequential `execute` calls, which is how a table
//! loaded by one tool invocation stays visible to the next. The engine is
//! not designed for concurrent calls; namespace consistency under
//! multi-threaded use is undefined.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use pyo3::exceptions::PySyntaxError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result, SandboxTimeoutError, SecurityError, SecurityViolation};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::fs::{GuardedOpen, SandboxFs};
use crate::sandbox::policy;
use crate::sandbox::timeout::TimeoutGuard;

/// Filename attached to compiled snippets in tracebacks.
const SOURCE_NAME: &str = "<sandbox>";

/// Namespace entries callers may read but never overwrite: the primitive
/// set, the analysis-library handles and the standard helpers.
const PROTECTED_GLOBALS: &[&str] = &[
    "__builtins__",
    "pd",
    "np",
    "plt",
    "sns",
    "json",
    "re",
    "datetime",
    "math",
    "collections",
    "itertools",
    "Path",
];

/// Helper modules always bound into the namespace, as `(name, module)`.
const STANDARD_LIBRARIES: &[(&str, &str)] = &[
    ("json", "json"),
    ("re", "re"),
    ("datetime", "datetime"),
    ("math", "math"),
    ("collections", "collections"),
    ("itertools", "itertools"),
];

/// Analysis libraries bound when importable. A host without the scientific
/// stack still gets a working engine, minus these handles.
const ANALYSIS_LIBRARIES: &[(&str, &str)] = &[
    ("pd", "pandas"),
    ("np", "numpy"),
    ("plt", "matplotlib.pyplot"),
    ("sns", "seaborn"),
];

/// What one execution produced.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The code was a single expression; this is its value.
    Value(Py<PyAny>),
    /// The code was a statement sequence that introduced new names; this
    /// maps each new name to its bound value.
    Bindings(BTreeMap<String, Py<PyAny>>),
    /// The code ran without producing a value or new names.
    Unit,
}

impl ExecutionOutcome {
    /// Whether the execution produced neither a value nor new bindings.
    #[must_use]
    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Unit)
    }
}

/// Sandboxed Python execution engine with a session-persistent namespace.
///
/// # Example
///
/// ```no_run
/// use analysis_sandbox::sandbox::{PythonSandbox, SandboxConfig};
///
/// let sandbox = PythonSandbox::new(SandboxConfig::default()).unwrap();
/// sandbox.execute("x = 21", None).unwrap();
/// let outcome = sandbox.execute("x * 2", None).unwrap();
/// ```
pub struct PythonSandbox {
    config: SandboxConfig,
    fs: SandboxFs,
    globals: Py<PyDict>,
    protected: BTreeSet<String>,
}

impl PythonSandbox {
    /// Creates an engine from a validated configuration.
    ///
    /// Validation creates both filesystem roots; initialization builds the
    /// primitive policy and binds the library handles into the namespace.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from validation and
    /// [`Error::Interpreter`] when namespace initialization fails.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let fs = SandboxFs::new(&config.workspace_dir, &config.shared_data_dir)?;

        let globals = Python::attach(|py| -> PyResult<Py<PyDict>> {
            let globals = PyDict::new(py);

            if config.enabled {
                let guard = GuardedOpen::new(fs.clone());
                let safe = policy::build_safe_builtins(py, &config.blocked_builtins, guard)?;
                globals.set_item("__builtins__", safe)?;
            } else {
                warn!(
                    "sandbox disabled by configuration; submitted code gets the full \
                     primitive set and ungated file access"
                );
                globals.set_item("__builtins__", py.import("builtins")?)?;
            }

            for (name, module) in STANDARD_LIBRARIES {
                globals.set_item(*name, py.import(*module)?)?;
            }
            globals.set_item("Path", py.import("pathlib")?.getattr("Path")?)?;

            for (name, module) in ANALYSIS_LIBRARIES {
                match py.import(*module) {
                    Ok(handle) => {
                        globals.set_item(*name, handle)?;
                    }
                    Err(err) => warn!(
                        library = *module,
                        error = %err,
                        "analysis library unavailable; '{name}' will not be bound"
                    ),
                }
            }

            Ok(globals.unbind())
        })
        .map_err(interpreter_error)?;

        info!(
            workspace = %fs.workspace().display(),
            shared_data = %fs.shared_data().display(),
            enabled = config.enabled,
            "sandbox engine initialized"
        );

        Ok(Self {
            config,
            fs,
            globals,
            protected: PROTECTED_GLOBALS.iter().map(|s| (*s).to_string()).collect(),
        })
    }

    /// Creates an engine from the environment-sourced configuration.
    ///
    /// # Errors
    ///
    /// See [`PythonSandbox::new`].
    pub fn from_env() -> Result<Self> {
        Self::new(SandboxConfig::from_env()?)
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The filesystem gateway backing the gated `open`.
    #[must_use]
    pub fn filesystem(&self) -> &SandboxFs {
        &self.fs
    }

    /// Executes a snippet against the session namespace.
    ///
    /// The snippet is first compiled as a single expression; if that
    /// succeeds its value is returned directly. Otherwise it is compiled
    /// and run as a statement sequence, and the names it introduced come
    /// back as [`ExecutionOutcome::Bindings`]. All namespace mutations,
    /// including updates to pre-existing names, persist for later calls.
    ///
    /// `timeout` overrides the configured execution limit for this call.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the wall-clock boundary fires,
    /// [`Error::Security`] when the snippet violated a policy, and
    /// [`Error::Execution`] for every other Python failure.
    #[instrument(skip(self, code), fields(code_bytes = code.len()))]
    pub fn execute(&self, code: &str, timeout: Option<Duration>) -> Result<ExecutionOutcome> {
        let limit = timeout.unwrap_or(self.config.max_execution_time);

        Python::attach(|py| {
            let globals = self.globals.bind(py);
            let builtins = py.import("builtins").map_err(interpreter_error)?;

            if !self.config.enabled {
                warn!("sandbox disabled; executing code without policy, timeout or gating");
                let exec = builtins.getattr("exec").map_err(interpreter_error)?;
                exec.call1((code, globals))
                    .map_err(|err| self.map_pyerr(py, err, limit))?;
                return Ok(ExecutionOutcome::Unit);
            }

            let compile = builtins.getattr("compile").map_err(interpreter_error)?;

            // Expression path: value in, value out, no namespace diff.
            match compile.call1((code, SOURCE_NAME, "eval")) {
                Ok(expression) => {
                    let eval = builtins.getattr("eval").map_err(interpreter_error)?;
                    let mut guard = TimeoutGuard::arm(py, limit).map_err(interpreter_error)?;
                    let run = eval.call1((expression, globals));
                    guard.disarm(py);
                    let value = run.map_err(|err| self.map_pyerr(py, err, limit))?;
                    return Ok(ExecutionOutcome::Value(value.unbind()));
                }
                Err(err) if err.is_instance_of::<PySyntaxError>(py) => {
                    // Not a single expression; fall through to statements.
                }
                Err(err) => return Err(self.map_pyerr(py, err, limit)),
            }

            let program = compile
                .call1((code, SOURCE_NAME, "exec"))
                .map_err(|err| self.map_pyerr(py, err, limit))?;

            let before = dict_keys(globals);

            let exec = builtins.getattr("exec").map_err(interpreter_error)?;
            let mut guard = TimeoutGuard::arm(py, limit).map_err(interpreter_error)?;
            let run = exec.call1((program, globals));
            guard.disarm(py);
            run.map_err(|err| self.map_pyerr(py, err, limit))?;

            let after = dict_keys(globals);
            let mut bindings = BTreeMap::new();
            for name in after.difference(&before) {
                if let Some(value) = globals.get_item(name.as_str()).map_err(interpreter_error)? {
                    bindings.insert(name.clone(), value.unbind());
                }
            }

            debug!(new_bindings = bindings.len(), "statement execution finished");
            if bindings.is_empty() {
                Ok(ExecutionOutcome::Unit)
            } else {
                Ok(ExecutionOutcome::Bindings(bindings))
            }
        })
    }

    /// Reads a namespace entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GlobalNotFound`] when the name is absent.
    pub fn get_global(&self, name: &str) -> Result<Py<PyAny>> {
        Python::attach(|py| {
            self.globals
                .bind(py)
                .get_item(name)
                .map_err(interpreter_error)?
                .map(Bound::unbind)
                .ok_or_else(|| Error::GlobalNotFound {
                    name: name.to_string(),
                })
        })
    }

    /// Binds a value in the namespace.
    ///
    /// This is the seam through which the surrounding tool layer injects
    /// values (a table extracted from a database, for example).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Security`] for protected names; the namespace is
    /// left untouched in that case.
    pub fn set_global<T>(&self, name: &str, value: T) -> Result<()>
    where
        T: for<'py> IntoPyObject<'py>,
    {
        if self.protected.contains(name) {
            return Err(SecurityViolation::ProtectedGlobal {
                name: name.to_string(),
            }
            .into());
        }
        Python::attach(|py| {
            self.globals
                .bind(py)
                .set_item(name, value)
                .map_err(interpreter_error)
        })
    }

    /// Removes every namespace entry that is not protected, leaving the
    /// engine ready for a fresh logical session without re-importing the
    /// libraries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interpreter`] only when the interpreter itself
    /// misbehaves.
    pub fn clear_user_variables(&self) -> Result<()> {
        Python::attach(|py| {
            let globals = self.globals.bind(py);
            let user: Vec<String> = dict_keys(globals)
                .into_iter()
                .filter(|name| !self.protected.contains(name))
                .collect();
            let removed = user.len();
            for name in user {
                globals.del_item(name.as_str()).map_err(interpreter_error)?;
            }
            debug!(removed, "user variables cleared");
            Ok(())
        })
    }

    /// Installs an externally provided library handle (such as a dataset
    /// loader) into the namespace and marks it protected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interpreter`] when the binding fails.
    pub fn install_library<T>(&mut self, name: &str, value: T) -> Result<()>
    where
        T: for<'py> IntoPyObject<'py>,
    {
        Python::attach(|py| {
            self.globals
                .bind(py)
                .set_item(name, value)
                .map_err(interpreter_error)
        })?;
        self.protected.insert(name.to_string());
        Ok(())
    }

    /// Classifies a failure raised while running submitted code.
    fn map_pyerr(&self, py: Python<'_>, err: PyErr, limit: Duration) -> Error {
        if err.is_instance_of::<SandboxTimeoutError>(py) {
            return Error::Timeout {
                limit_secs: limit.as_secs().max(1),
            };
        }
        if err.is_instance_of::<SecurityError>(py) {
            return Error::Security(SecurityViolation::Sandboxed {
                message: err.value(py).to_string(),
            });
        }
        Error::Execution {
            message: err.to_string(),
        }
    }
}

fn dict_keys(dict: &Bound<'_, PyDict>) -> BTreeSet<String> {
    dict.keys()
        .iter()
        .filter_map(|key| key.extract::<String>().ok())
        .collect()
}

fn interpreter_error(err: PyErr) -> Error {
    Error::Interpreter {
        message: err.to_string(),
    }
}
