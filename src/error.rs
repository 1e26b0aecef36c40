//! Error types for the analysis sandbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich
//! diagnostics. Two exception classes are also exported into the embedded
//! interpreter so that policy violations and timeouts raised *inside*
//! submitted code can be told apart from ordinary Python failures.

use std::path::PathBuf;

use miette::Diagnostic;
use pyo3::PyErr;
use thiserror::Error;

/// Top-level error type for the crate.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A security policy was violated. Never retried; the message names the
    /// allowed directories or the protected entry involved.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Security(#[from] SecurityViolation),

    /// Submitted code exceeded the wall-clock execution limit.
    #[error("code execution timed out after {limit_secs} seconds")]
    #[diagnostic(
        code(sandbox::timeout),
        help("raise SANDBOX_MAX_EXECUTION_TIME or split the work into smaller steps")
    )]
    Timeout {
        /// The configured bound, in seconds.
        limit_secs: u64,
    },

    /// Submitted code raised an ordinary Python exception.
    #[error("code execution failed: {message}")]
    #[diagnostic(code(sandbox::execution))]
    Execution {
        /// The original Python error, message preserved verbatim.
        message: String,
    },

    /// A namespace lookup failed.
    #[error("global variable '{name}' is not defined")]
    #[diagnostic(code(sandbox::global_not_found))]
    GlobalNotFound { name: String },

    /// Invalid sandbox configuration.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// The embedded interpreter failed outside of submitted code
    /// (initialization, module import for the namespace, etc).
    #[error("python interpreter error: {message}")]
    #[diagnostic(code(sandbox::interpreter))]
    Interpreter { message: String },
}

/// Security policy violations.
///
/// These are terminal: the caller gets the full story (both allowed roots,
/// or the protected name) and nothing is retried.
#[derive(Error, Debug, Diagnostic)]
pub enum SecurityViolation {
    /// The resolved path is not contained in either configured root.
    #[error(
        "access denied: path '{path}' is outside the allowed directories. \
         Allowed: {} (read-write), {} (read-only)",
        workspace.display(),
        shared.display()
    )]
    #[diagnostic(
        code(sandbox::security::path),
        help("use a relative path for the workspace, or the data/ prefix for shared datasets")
    )]
    PathOutsideRoots {
        path: String,
        workspace: PathBuf,
        shared: PathBuf,
    },

    /// A write/append/create mode was requested against the read-only root.
    #[error(
        "access denied: path '{path}' is in the read-only shared data directory {}. \
         Write files to the workspace instead (any relative path without the data/ prefix)",
        shared.display()
    )]
    #[diagnostic(code(sandbox::security::read_only))]
    ReadOnlyRoot { path: String, shared: PathBuf },

    /// An attempt to overwrite a protected namespace entry.
    #[error("overwriting the protected namespace entry '{name}' is not allowed")]
    #[diagnostic(code(sandbox::security::protected_global))]
    ProtectedGlobal { name: String },

    /// A violation raised inside the interpreter (the guarded open),
    /// surfaced with its message intact.
    #[error("{message}")]
    #[diagnostic(code(sandbox::security::sandboxed))]
    Sandboxed { message: String },
}

/// Errors produced while building or validating a [`SandboxConfig`].
///
/// [`SandboxConfig`]: crate::sandbox::SandboxConfig
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// A limit that must be strictly positive was zero.
    #[error("configuration value {name} must be positive")]
    #[diagnostic(code(sandbox::config::limit))]
    NonPositiveLimit { name: &'static str },

    /// An environment variable held a value that did not parse.
    #[error("environment variable {name} has invalid value '{value}'")]
    #[diagnostic(code(sandbox::config::env))]
    InvalidEnv { name: String, value: String },

    /// A configured root directory could not be created or resolved.
    #[error("cannot prepare sandbox directory {}: {source}", path.display())]
    #[diagnostic(code(sandbox::config::root))]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// Exception classes visible to submitted code. The guarded open raises
// SecurityError; the alarm handler raises SandboxTimeoutError. The engine
// maps both back into the Rust taxonomy after execution.
pyo3::create_exception!(
    analysis_sandbox,
    SecurityError,
    pyo3::exceptions::PyException,
    "A sandbox security policy was violated."
);
pyo3::create_exception!(
    analysis_sandbox,
    SandboxTimeoutError,
    pyo3::exceptions::PyException,
    "Sandboxed code exceeded its execution time limit."
);

impl From<SecurityViolation> for PyErr {
    fn from(violation: SecurityViolation) -> Self {
        SecurityError::new_err(violation.to_string())
    }
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
