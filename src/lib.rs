//! Analysis Sandbox - Sandboxed in-process Python execution for
//! data-analysis agents.
//!
//! This crate provides the execution boundary that lets an autonomous
//! agent run LLM-generated analysis snippets (data loading, transformation,
//! chart generation) against a shared dataset store:
//!
//! - a persistent namespace surviving across sequential tool calls;
//! - a deny-list primitive policy with a gated file-open;
//! - a filesystem gateway confining all I/O to a read-write workspace and
//!   a read-only shared data directory;
//! - a best-effort wall-clock timeout;
//! - a two-layer artifact pipeline extracting rendered charts out of
//!   untrusted code into a trusted persistence step.
//!
//! It is a *cooperative* boundary for single-tenant agent sessions, not an
//! isolation mechanism for adversarial code; see the module docs in
//! [`sandbox::policy`] for the explicit trade-offs.
//!
//! # Example
//!
//! ```no_run
//! use analysis_sandbox::sandbox::{PythonSandbox, SandboxConfig};
//! use analysis_sandbox::tools;
//!
//! let sandbox = PythonSandbox::new(SandboxConfig::default()).unwrap();
//! let reply = tools::run_code(&sandbox, "df_len = 3 * 14");
//! assert!(reply.contains("df_len"));
//! ```

pub mod chart;
pub mod error;
pub mod sandbox;
pub mod tools;

// Re-export commonly used types
pub use chart::ChartRenderer;
pub use error::{Error, Result, SecurityViolation};
pub use sandbox::{ExecutionOutcome, PythonSandbox, SandboxConfig, SandboxFs};
