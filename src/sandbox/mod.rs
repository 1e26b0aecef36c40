//! Sandboxed execution of analysis code against a persistent namespace.
//!
//! The sandbox is a cooperative boundary for LLM-generated analysis
//! snippets in a single-tenant session, built from four pieces:
//!
//! - a **primitive policy** reducing the builtin set by exclusion and
//!   gating the file-open primitive ([`policy`]);
//! - a **filesystem gateway** routing every path to a read-write workspace
//!   or a read-only shared data directory ([`SandboxFs`]);
//! - a **resource boundary** arming a best-effort wall-clock timeout
//!   around each execution;
//! - the **engine** itself ([`PythonSandbox`]), which owns the namespace
//!   that persists across sequential tool invocations.
//!
//! # Example
//!
//! ```no_run
//! use analysis_sandbox::sandbox::{PythonSandbox, SandboxConfig};
//!
//! let sandbox = PythonSandbox::new(SandboxConfig::default()).unwrap();
//! let outcome = sandbox.execute("2 + 2", None).unwrap();
//! ```

mod config;
mod engine;
mod fs;
pub mod policy;
mod timeout;

pub use config::SandboxConfig;
pub use engine::{ExecutionOutcome, PythonSandbox};
pub use fs::{PathAccess, SandboxFs};
