//! Primitive policy: the reduced builtin set handed to submitted code.
//!
//! The policy is built by exclusion over builtin *names*: every name with
//! the leading-underscore internal marker is dropped (with `__import__`
//! reinstated, because pandas and numpy import submodules dynamically and
//! cannot run without it), every name on the configured deny-list is
//! dropped, and `open` is always replaced by the filesystem gateway.
//!
//! This is not a capability system. Code that reaches dangerous
//! functionality through the object graph of a permitted module is not
//! stopped here; the policy is a cooperative boundary against accidental
//! misuse, not a defense against a determined adversary.

use std::collections::BTreeSet;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::debug;

use crate::sandbox::fs::GuardedOpen;

/// Builtin names removed from the primitive set by default: code
/// evaluation and compilation, interactive input, process exit and
/// debugger entry.
pub const DEFAULT_BLOCKED_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "input",
    "help",
    "breakpoint",
    "exit",
    "quit",
];

/// Modules submitted analysis code is expected to work with. Surfaced to
/// operators and prompt authors; imports themselves stay unrestricted
/// because the analysis libraries depend on dynamic imports internally.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    // data handling
    "pandas",
    "numpy",
    "scipy",
    // visualization
    "matplotlib",
    "matplotlib.pyplot",
    "seaborn",
    // files and paths
    "pathlib",
    "os.path",
    "glob",
    "fnmatch",
    // data formats
    "json",
    "csv",
    "xml",
    "xml.etree",
    "xml.etree.ElementTree",
    // text
    "re",
    "string",
    "textwrap",
    "difflib",
    // date and time
    "datetime",
    "time",
    "calendar",
    // algorithms and containers
    "collections",
    "itertools",
    "functools",
    "heapq",
    "bisect",
    "queue",
    // math and statistics
    "math",
    "statistics",
    "random",
    "decimal",
    "fractions",
    // misc utilities
    "uuid",
    "hashlib",
    "base64",
    "copy",
    "pprint",
    // typing and metaprogramming
    "typing",
    "dataclasses",
    "enum",
    "abc",
];

/// Builds the reduced builtin dictionary installed as `__builtins__` in the
/// sandbox namespace.
pub(crate) fn build_safe_builtins<'py>(
    py: Python<'py>,
    blocked: &BTreeSet<String>,
    guard: GuardedOpen,
) -> PyResult<Bound<'py, PyDict>> {
    let builtins = py.import("builtins")?;
    let safe = PyDict::new(py);

    let mut kept = 0usize;
    let mut dropped = 0usize;
    for name_obj in builtins.dir()?.iter() {
        let name: String = name_obj.extract()?;
        if name.starts_with('_') && name != "__import__" {
            continue;
        }
        if blocked.contains(&name) {
            dropped += 1;
            continue;
        }
        safe.set_item(name.as_str(), builtins.getattr(name.as_str())?)?;
        kept += 1;
    }

    // The file-open primitive is always the gated version, regardless of
    // what the deny-list contains.
    safe.set_item("open", Py::new(py, guard)?)?;

    debug!(kept, dropped, "primitive policy built");
    Ok(safe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxFs;
    use tempfile::TempDir;

    fn build() -> (Py<PyDict>, TempDir, TempDir) {
        let ws = TempDir::new().expect("workspace");
        let shared = TempDir::new().expect("shared");
        let fs = SandboxFs::new(ws.path(), shared.path()).expect("gateway");
        let blocked: BTreeSet<String> = DEFAULT_BLOCKED_BUILTINS
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let dict = Python::attach(|py| {
            build_safe_builtins(py, &blocked, GuardedOpen::new(fs))
                .expect("policy")
                .unbind()
        });
        (dict, ws, shared)
    }

    #[test]
    fn test_denied_primitives_are_absent() {
        let (dict, _ws, _shared) = build();
        Python::attach(|py| {
            let dict = dict.bind(py);
            for name in DEFAULT_BLOCKED_BUILTINS {
                assert!(
                    dict.get_item(*name).expect("lookup").is_none(),
                    "{name} should be excluded"
                );
            }
        });
    }

    #[test]
    fn test_import_primitive_is_reinstated() {
        let (dict, _ws, _shared) = build();
        Python::attach(|py| {
            let dict = dict.bind(py);
            assert!(dict.get_item("__import__").expect("lookup").is_some());
            // every other dunder stays internal
            assert!(dict.get_item("__loader__").expect("lookup").is_none());
        });
    }

    #[test]
    fn test_common_primitives_survive() {
        let (dict, _ws, _shared) = build();
        Python::attach(|py| {
            let dict = dict.bind(py);
            for name in ["len", "range", "print", "sum", "min", "max", "sorted"] {
                assert!(
                    dict.get_item(name).expect("lookup").is_some(),
                    "{name} should be available"
                );
            }
        });
    }

    #[test]
    fn test_open_is_the_gated_version() {
        let (dict, _ws, _shared) = build();
        Python::attach(|py| {
            let open = dict
                .bind(py)
                .get_item("open")
                .expect("lookup")
                .expect("open present");
            assert!(open.is_instance_of::<GuardedOpen>());
        });
    }
}
