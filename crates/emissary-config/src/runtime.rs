//! Derives runtime artefact paths shared by the supervisor, its workers and
//! the lifecycle subcommands.
//!
//! `emissary stop` and `emissary status` locate the running supervisor
//! through these files, so every process must agree on the layout.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

/// Canonical paths for runtime artefacts written under `general.pid_dir`.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    runtime_dir: PathBuf,
    lock_path: PathBuf,
    pid_path: PathBuf,
    health_path: PathBuf,
}

impl RuntimePaths {
    /// Derives runtime paths from the configuration, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimePathsError`] when the directory cannot be created.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        Self::in_dir(config.general().pid_dir())
    }

    /// Derives runtime paths rooted at `runtime_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimePathsError`] when the directory cannot be created.
    pub fn in_dir(runtime_dir: PathBuf) -> Result<Self, RuntimePathsError> {
        fs::create_dir_all(&runtime_dir).map_err(|source| RuntimePathsError::RuntimeDirectory {
            path: runtime_dir.clone(),
            source,
        })?;
        Ok(Self {
            lock_path: runtime_dir.join("emissary.lock"),
            pid_path: runtime_dir.join("emissary.pid"),
            health_path: runtime_dir.join("emissary.health"),
            runtime_dir,
        })
    }

    /// Directory holding runtime artefacts.
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        self.runtime_dir.as_path()
    }

    /// Path to the lock file guarding singleton startup.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock_path.as_path()
    }

    /// Path to the supervisor PID file.
    #[must_use]
    pub fn pid_path(&self) -> &Path {
        self.pid_path.as_path()
    }

    /// Path to the health snapshot.
    #[must_use]
    pub fn health_path(&self) -> &Path {
        self.health_path.as_path()
    }

    /// Path to the PID file of the worker serving `node`.
    #[must_use]
    pub fn worker_pid_path(&self, node: &str) -> PathBuf {
        self.runtime_dir.join(format!("emissary-{node}.pid"))
    }
}

/// Errors raised while deriving runtime paths.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// Creating the runtime directory failed.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}
