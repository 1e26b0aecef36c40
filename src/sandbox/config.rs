//! Configuration for the execution sandbox.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::sandbox::policy::{DEFAULT_ALLOWED_MODULES, DEFAULT_BLOCKED_BUILTINS};

/// Configuration for a [`PythonSandbox`].
///
/// Use the builder methods to customize the sandbox behavior, or
/// [`SandboxConfig::from_env`] to read the documented environment variables.
///
/// # Example
///
/// ```
/// use analysis_sandbox::sandbox::SandboxConfig;
/// use std::time::Duration;
///
/// let config = SandboxConfig::default()
///     .with_workspace_dir("/tmp/sandbox_workspace")
///     .with_shared_data_dir("/tmp/data")
///     .with_max_execution_time(Duration::from_secs(60));
/// ```
///
/// [`PythonSandbox`]: crate::sandbox::PythonSandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock limit for one execution.
    pub max_execution_time: Duration,

    /// Memory ceiling in megabytes. Declared for operators but not enforced
    /// by the execution path; `validate` logs the gap so nobody mistakes it
    /// for containment.
    pub max_memory_mb: u64,

    /// Maximum size, in characters, of a formatted tool result.
    pub max_output_size: usize,

    /// Module names submitted code is expected to import. Informational:
    /// the import primitive stays available (the analysis libraries perform
    /// dynamic imports internally) and this list is surfaced in docs and
    /// prompts rather than checked at import time.
    pub allowed_modules: BTreeSet<String>,

    /// Builtin names removed from the primitive set.
    pub blocked_builtins: BTreeSet<String>,

    /// Read-write directory for files produced by submitted code.
    pub workspace_dir: PathBuf,

    /// Read-only directory exposing shared datasets via the `data/` prefix.
    pub shared_data_dir: PathBuf,

    /// Log level hint for the host application.
    pub log_level: String,

    /// Whether the sandbox policy is active. Disabling it is an escape
    /// hatch for trusted/debug contexts only.
    pub enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_execution_time: Duration::from_secs(30),
            max_memory_mb: 512,
            max_output_size: 10_000,
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            blocked_builtins: DEFAULT_BLOCKED_BUILTINS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            workspace_dir: PathBuf::from("sandbox_workspace"),
            shared_data_dir: PathBuf::from("data"),
            log_level: String::from("INFO"),
            enabled: true,
        }
    }
}

impl SandboxConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads configuration from the environment.
    ///
    /// Recognized variables: `SANDBOX_MAX_EXECUTION_TIME` (seconds),
    /// `SANDBOX_MAX_MEMORY_MB`, `SANDBOX_MAX_OUTPUT_SIZE`,
    /// `SANDBOX_WORKSPACE_DIR`, `SANDBOX_SHARED_DATA_DIR`,
    /// `SANDBOX_LOG_LEVEL` and `ENABLE_SANDBOX`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] when a numeric variable does not
    /// parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_execution_time = Duration::from_secs(env_u64(
            "SANDBOX_MAX_EXECUTION_TIME",
            defaults.max_execution_time.as_secs(),
        )?);
        let max_memory_mb = env_u64("SANDBOX_MAX_MEMORY_MB", defaults.max_memory_mb)?;
        let max_output_size =
            env_u64("SANDBOX_MAX_OUTPUT_SIZE", defaults.max_output_size as u64)? as usize;
        Ok(Self {
            max_execution_time,
            max_memory_mb,
            max_output_size,
            allowed_modules: defaults.allowed_modules,
            blocked_builtins: defaults.blocked_builtins,
            workspace_dir: env_path("SANDBOX_WORKSPACE_DIR", defaults.workspace_dir),
            shared_data_dir: env_path("SANDBOX_SHARED_DATA_DIR", defaults.shared_data_dir),
            log_level: env::var("SANDBOX_LOG_LEVEL").unwrap_or(defaults.log_level),
            enabled: env::var("ENABLE_SANDBOX")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        })
    }

    /// Sets the wall-clock execution limit.
    #[must_use]
    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = limit;
        self
    }

    /// Sets the (declared, unenforced) memory ceiling in megabytes.
    #[must_use]
    pub fn with_max_memory_mb(mut self, megabytes: u64) -> Self {
        self.max_memory_mb = megabytes;
        self
    }

    /// Sets the maximum formatted output size in characters.
    #[must_use]
    pub fn with_max_output_size(mut self, characters: usize) -> Self {
        self.max_output_size = characters;
        self
    }

    /// Sets the read-write workspace directory.
    #[must_use]
    pub fn with_workspace_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_dir = path.into();
        self
    }

    /// Sets the read-only shared data directory.
    #[must_use]
    pub fn with_shared_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_data_dir = path.into();
        self
    }

    /// Adds a builtin name to the deny-list.
    #[must_use]
    pub fn with_blocked_builtin(mut self, name: impl Into<String>) -> Self {
        self.blocked_builtins.insert(name.into());
        self
    }

    /// Enables or disables the sandbox policy.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validates the configuration and prepares both root directories.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NonPositiveLimit`] for a zero limit and
    /// [`ConfigError::RootUnavailable`] when a root cannot be created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_execution_time.is_zero() {
            return Err(ConfigError::NonPositiveLimit {
                name: "max_execution_time",
            });
        }
        if self.max_memory_mb == 0 {
            return Err(ConfigError::NonPositiveLimit {
                name: "max_memory_mb",
            });
        }
        if self.max_output_size == 0 {
            return Err(ConfigError::NonPositiveLimit {
                name: "max_output_size",
            });
        }

        warn!(
            limit_mb = self.max_memory_mb,
            "memory limit is declared but not enforced by the execution path"
        );

        for root in [&self.workspace_dir, &self.shared_data_dir] {
            fs::create_dir_all(root).map_err(|source| ConfigError::RootUnavailable {
                path: root.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: raw,
        }),
    }
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    env::var_os(name).map(PathBuf::from).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.max_execution_time, Duration::from_secs(30));
        assert_eq!(config.max_memory_mb, 512);
        assert_eq!(config.max_output_size, 10_000);
        assert!(config.enabled);
        assert!(config.blocked_builtins.contains("eval"));
        assert!(config.blocked_builtins.contains("exec"));
        assert!(config.allowed_modules.contains("pandas"));
    }

    #[test]
    fn test_builder_chain() {
        let config = SandboxConfig::new()
            .with_max_execution_time(Duration::from_secs(5))
            .with_max_memory_mb(128)
            .with_max_output_size(2_000)
            .with_workspace_dir("/tmp/ws")
            .with_shared_data_dir("/tmp/shared")
            .with_blocked_builtin("vars")
            .with_enabled(false);

        assert_eq!(config.max_execution_time, Duration::from_secs(5));
        assert_eq!(config.max_memory_mb, 128);
        assert_eq!(config.max_output_size, 2_000);
        assert_eq!(config.workspace_dir, PathBuf::from("/tmp/ws"));
        assert_eq!(config.shared_data_dir, PathBuf::from("/tmp/shared"));
        assert!(config.blocked_builtins.contains("vars"));
        assert!(!config.enabled);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = SandboxConfig::default().with_max_execution_time(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = SandboxConfig::default().with_max_memory_mb(0);
        assert!(config.validate().is_err());

        let config = SandboxConfig::default().with_max_output_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_creates_roots() {
        let base = tempfile::TempDir::new().expect("failed to create temp dir");
        let config = SandboxConfig::default()
            .with_workspace_dir(base.path().join("ws"))
            .with_shared_data_dir(base.path().join("shared"));

        config.validate().expect("validation should succeed");
        assert!(base.path().join("ws").is_dir());
        assert!(base.path().join("shared").is_dir());
    }
}
