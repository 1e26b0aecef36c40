//! Filesystem gateway for sandboxed code.
//!
//! Submitted code never reaches the real `open` builtin. Every path it
//! supplies is resolved to an absolute location and classified against two
//! roots before any I/O happens:
//!
//! - the **workspace** (read-write), the target of plain relative paths;
//! - the **shared data** directory (read-only), reached through the literal
//!   `data/` prefix.
//!
//! Containment is an ancestor check on the resolved path, after folding
//! `.`/`..` components and resolving symlinks, so traversal tricks that
//! escape a root are rejected rather than string-matched.

use std::fs;
use std::path::{Component, Path, PathBuf};

use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::{debug, instrument};

use crate::error::{ConfigError, SecurityViolation};

/// Result of classifying a resolved path against the configured roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathAccess {
    /// The path is contained in one of the two roots.
    pub allowed: bool,
    /// The path is contained in the shared data root.
    pub read_only: bool,
}

/// Gateway between sandboxed code and the host filesystem.
#[derive(Debug, Clone)]
pub struct SandboxFs {
    workspace: PathBuf,
    shared_data: PathBuf,
}

impl SandboxFs {
    /// Creates a gateway over the two roots, creating and canonicalizing
    /// both.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RootUnavailable`] when a root cannot be
    /// created or resolved.
    pub fn new(workspace: &Path, shared_data: &Path) -> Result<Self, ConfigError> {
        let workspace = prepare_root(workspace)?;
        let shared_data = prepare_root(shared_data)?;
        debug!(
            workspace = %workspace.display(),
            shared_data = %shared_data.display(),
            "filesystem gateway initialized"
        );
        Ok(Self {
            workspace,
            shared_data,
        })
    }

    /// The canonical read-write root.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The canonical read-only root.
    #[must_use]
    pub fn shared_data(&self) -> &Path {
        &self.shared_data
    }

    /// Resolves a user-supplied path to an absolute one.
    ///
    /// Absolute paths resolve as-is. A relative path starting with the
    /// literal `data/` prefix maps into the shared data root with the
    /// prefix stripped; every other relative path maps into the workspace.
    #[must_use]
    pub fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else if let Some(rest) = raw.strip_prefix("data/") {
            self.shared_data.join(rest)
        } else {
            self.workspace.join(path)
        };
        resolve_symlinks(&normalize(&joined))
    }

    /// Classifies an already-resolved path.
    #[must_use]
    pub fn classify(&self, path: &Path) -> PathAccess {
        if path.starts_with(&self.workspace) {
            PathAccess {
                allowed: true,
                read_only: false,
            }
        } else if path.starts_with(&self.shared_data) {
            PathAccess {
                allowed: true,
                read_only: true,
            }
        } else {
            PathAccess {
                allowed: false,
                read_only: false,
            }
        }
    }

    /// Resolves and classifies a path without opening it.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityViolation::PathOutsideRoots`] when the resolved
    /// location is not contained in either root.
    pub fn validate_path(&self, raw: &str) -> Result<PathBuf, SecurityViolation> {
        let resolved = self.resolve(raw);
        if !self.classify(&resolved).allowed {
            return Err(self.outside_roots(raw));
        }
        Ok(resolved)
    }

    /// Full guarded-open precheck: resolve, classify, enforce the read-only
    /// rule, and create parent directories for writes.
    ///
    /// Performs no I/O on rejected paths.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityViolation::PathOutsideRoots`] for locations outside
    /// both roots, [`SecurityViolation::ReadOnlyRoot`] for write modes
    /// against the shared data root.
    #[instrument(skip(self))]
    pub fn check_open(&self, raw: &str, mode: &str) -> Result<PathBuf, SecurityViolation> {
        let resolved = self.resolve(raw);
        let access = self.classify(&resolved);

        if !access.allowed {
            return Err(self.outside_roots(raw));
        }

        let writing = is_write_mode(mode);
        if access.read_only && writing {
            return Err(SecurityViolation::ReadOnlyRoot {
                path: raw.to_string(),
                shared: self.shared_data.clone(),
            });
        }

        if writing {
            if let Some(parent) = resolved.parent() {
                // Ignore failures here; the actual open reports them with
                // the Python-level context the caller expects.
                let _ = fs::create_dir_all(parent);
            }
        }

        debug!(path = %resolved.display(), mode, "open permitted");
        Ok(resolved)
    }

    fn outside_roots(&self, raw: &str) -> SecurityViolation {
        SecurityViolation::PathOutsideRoots {
            path: raw.to_string(),
            workspace: self.workspace.clone(),
            shared: self.shared_data.clone(),
        }
    }
}

/// Whether an `open` mode string requests write, append, create or update.
#[must_use]
pub(crate) fn is_write_mode(mode: &str) -> bool {
    mode.chars().any(|c| matches!(c, 'w' | 'a' | 'x' | '+'))
}

fn prepare_root(root: &Path) -> Result<PathBuf, ConfigError> {
    fs::create_dir_all(root).map_err(|source| ConfigError::RootUnavailable {
        path: root.to_path_buf(),
        source,
    })?;
    fs::canonicalize(root).map_err(|source| ConfigError::RootUnavailable {
        path: root.to_path_buf(),
        source,
    })
}

/// Folds `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Longest symlink chain followed before giving up on resolution.
const MAX_LINK_HOPS: usize = 8;

/// Resolves symlinks through the deepest existing component, reattaching any
/// not-yet-created trailing components. `fs::canonicalize` alone would fail
/// for paths about to be written.
///
/// The existence walk uses `symlink_metadata`, which does not follow links:
/// a dangling symlink counts as an existing component here, so it gets
/// resolved (by hand, via `read_link`) instead of being mistaken for a file
/// about to be created. Classification then sees the link target, not the
/// link location.
fn resolve_symlinks(path: &Path) -> PathBuf {
    let mut path = path.to_path_buf();
    for _ in 0..MAX_LINK_HOPS {
        let mut existing = path.clone();
        let mut tail = Vec::new();
        while existing.symlink_metadata().is_err() {
            match existing.file_name() {
                Some(name) => {
                    tail.push(name.to_os_string());
                    existing.pop();
                }
                None => break,
            }
        }
        match fs::canonicalize(&existing) {
            Ok(mut resolved) => {
                for name in tail.iter().rev() {
                    resolved.push(name);
                }
                return resolved;
            }
            // The deepest existing component is a dangling symlink; follow
            // it manually and resolve the rewritten path from the top.
            Err(_) => match fs::read_link(&existing) {
                Ok(target) => {
                    let mut rewritten = if target.is_absolute() {
                        target
                    } else {
                        existing
                            .parent()
                            .map(Path::to_path_buf)
                            .unwrap_or_default()
                            .join(target)
                    };
                    for name in tail.iter().rev() {
                        rewritten.push(name);
                    }
                    path = normalize(&rewritten);
                }
                Err(_) => {
                    for name in tail.iter().rev() {
                        existing.push(name);
                    }
                    return existing;
                }
            },
        }
    }
    // Symlink chain too deep (or a cycle): hand back the last rewrite and
    // let classification and the actual open deal with it.
    path
}

/// The gated replacement for the `open` primitive, installed into the
/// reduced builtin set. Delegates to the genuine builtin only after
/// [`SandboxFs::check_open`] approves the access.
#[pyclass]
pub(crate) struct GuardedOpen {
    fs: SandboxFs,
}

impl GuardedOpen {
    pub(crate) fn new(fs: SandboxFs) -> Self {
        Self { fs }
    }
}

#[pymethods]
impl GuardedOpen {
    #[pyo3(signature = (path, mode = "r", **kwargs))]
    fn __call__(
        &self,
        py: Python<'_>,
        path: &Bound<'_, PyAny>,
        mode: &str,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<Py<PyAny>> {
        // Accept str and os.PathLike arguments, like the builtin does.
        let raw: String = py
            .import("os")?
            .call_method1("fspath", (path,))?
            .extract()?;
        let resolved = self.fs.check_open(&raw, mode).map_err(PyErr::from)?;

        let open = py.import("builtins")?.getattr("open")?;
        let file = open.call(
            (resolved.to_string_lossy().into_owned(), mode),
            kwargs,
        )?;
        Ok(file.unbind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gateway() -> (SandboxFs, TempDir, TempDir) {
        let workspace = TempDir::new().expect("failed to create workspace");
        let shared = TempDir::new().expect("failed to create shared dir");
        let fs = SandboxFs::new(workspace.path(), shared.path()).expect("gateway");
        (fs, workspace, shared)
    }

    #[test]
    fn test_relative_path_resolves_under_workspace() {
        let (fs, _ws, _shared) = gateway();
        let resolved = fs.resolve("notes.txt");
        assert!(resolved.starts_with(fs.workspace()));
    }

    #[test]
    fn test_data_prefix_resolves_under_shared_root() {
        let (fs, _ws, _shared) = gateway();
        let resolved = fs.resolve("data/sample.csv");
        assert!(resolved.starts_with(fs.shared_data()));
        assert!(!resolved.starts_with(fs.workspace()));
        assert!(resolved.ends_with("sample.csv"));
    }

    #[test]
    fn test_parent_traversal_escapes_are_rejected() {
        let (fs, _ws, _shared) = gateway();
        let err = fs.validate_path("../../../../etc/passwd").unwrap_err();
        assert!(matches!(err, SecurityViolation::PathOutsideRoots { .. }));
    }

    #[test]
    fn test_absolute_path_outside_roots_is_rejected() {
        let (fs, _ws, _shared) = gateway();
        assert!(fs.validate_path("/etc/passwd").is_err());
    }

    #[test]
    fn test_absolute_path_inside_workspace_is_allowed() {
        let (fs, _ws, _shared) = gateway();
        let inside = fs.workspace().join("report.csv");
        let resolved = fs
            .validate_path(inside.to_str().expect("utf-8 path"))
            .expect("path inside workspace");
        assert!(resolved.starts_with(fs.workspace()));
    }

    #[test]
    fn test_write_to_shared_root_is_rejected() {
        let (fs, _ws, _shared) = gateway();
        for mode in ["w", "a", "x", "r+", "wb"] {
            let err = fs.check_open("data/sample.csv", mode).unwrap_err();
            assert!(
                matches!(err, SecurityViolation::ReadOnlyRoot { .. }),
                "mode {mode} should be rejected"
            );
        }
    }

    #[test]
    fn test_read_from_shared_root_is_allowed() {
        let (fs, _ws, shared) = gateway();
        std::fs::write(shared.path().join("sample.csv"), "col\n1\n").expect("write fixture");
        let resolved = fs.check_open("data/sample.csv", "r").expect("read allowed");
        assert!(resolved.exists());
    }

    #[test]
    fn test_write_creates_parent_directories() {
        let (fs, _ws, _shared) = gateway();
        let resolved = fs
            .check_open("intermediate/step1/out.csv", "w")
            .expect("workspace write allowed");
        assert!(resolved.parent().expect("parent").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let (fs, ws, _shared) = gateway();
        let outside = TempDir::new().expect("outside dir");
        std::os::unix::fs::symlink(outside.path(), ws.path().join("escape"))
            .expect("create symlink");

        let err = fs.validate_path("escape/secrets.txt").unwrap_err();
        assert!(matches!(err, SecurityViolation::PathOutsideRoots { .. }));
    }

    /// A dangling symlink must resolve to its target before classification;
    /// treating it as a not-yet-created file would let a write escape.
    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_escape_is_rejected() {
        let (fs, ws, _shared) = gateway();
        let outside = TempDir::new().expect("outside dir");
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), ws.path().join("link"))
            .expect("create symlink");

        let err = fs.check_open("link", "w").unwrap_err();
        assert!(matches!(err, SecurityViolation::PathOutsideRoots { .. }));
        assert!(!outside.path().join("secret.txt").exists());
    }

    /// A dangling symlink pointing back inside the workspace stays usable:
    /// the resolved target is the classified location.
    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_inside_workspace_resolves_to_target() {
        let (fs, ws, _shared) = gateway();
        std::os::unix::fs::symlink(ws.path().join("target.txt"), ws.path().join("link"))
            .expect("create symlink");

        let resolved = fs.check_open("link", "w").expect("in-root target allowed");
        assert!(resolved.starts_with(fs.workspace()));
        assert!(resolved.ends_with("target.txt"));
    }

    #[test]
    fn test_is_write_mode() {
        assert!(is_write_mode("w"));
        assert!(is_write_mode("wb"));
        assert!(is_write_mode("a"));
        assert!(is_write_mode("x"));
        assert!(is_write_mode("r+"));
        assert!(!is_write_mode("r"));
        assert!(!is_write_mode("rb"));
    }

    #[test]
    fn test_normalize_folds_components() {
        assert_eq!(
            normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize(Path::new("/a/../../b")), PathBuf::from("/b"));
    }
}
