//! Release resolution for `selfupdate`.

use std::fs;
use std::io;
use std::path::PathBuf;

use semver::Version;
use serde::Deserialize;
use thiserror::Error;

/// Keyword selecting the newest available release.
pub const LATEST: &str = "latest";

/// Reasons a self-update is refused or cannot start.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The requested version is not published.
    #[error("Emissary selfupdate skipped - non-existent version '{0}'")]
    UnknownVersion(String),
    /// The newest release is already running.
    #[error("Emissary selfupdate skipped - already at latest version")]
    AlreadyLatest,
    /// The requested release is already running.
    #[error("Emissary selfupdate skipped - already at specified version {0}")]
    AlreadyAt(Version),
    /// The requested release is older than the running one.
    #[error(
        "Emissary selfupdate skipped - downgrade not allowed (requested {requested}, running {running})"
    )]
    Downgrade {
        /// Version asked for.
        requested: Version,
        /// Version running now.
        running: Version,
    },
    /// The catalog lists no releases at all.
    #[error("no releases available")]
    NoReleases,
    /// The release manifest could not be read.
    #[error("failed to read release manifest {path}: {source}")]
    ManifestRead {
        /// Manifest location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The release manifest is not valid.
    #[error("release manifest {path} is malformed: {source}")]
    ManifestFormat {
        /// Manifest location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// The detached update task could not be started.
    #[error("failed to launch update task: {0}")]
    Spawn(#[source] io::Error),
}

/// Source of published versions.
pub trait ReleaseCatalog: Send + Sync {
    /// Every installable version.
    ///
    /// # Errors
    ///
    /// Returns an [`UpdateError`] when the catalog cannot be read.
    fn versions(&self) -> Result<Vec<Version>, UpdateError>;
}

/// Catalog backed by a JSON manifest: `{"versions": ["1.2.0", ...]}`.
#[derive(Debug, Clone)]
pub struct ManifestCatalog {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    versions: Vec<Version>,
}

impl ManifestCatalog {
    /// Reads releases from `path` on every lookup.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReleaseCatalog for ManifestCatalog {
    fn versions(&self) -> Result<Vec<Version>, UpdateError> {
        let text = fs::read_to_string(&self.path).map_err(|source| UpdateError::ManifestRead {
            path: self.path.clone(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_str(&text).map_err(|source| UpdateError::ManifestFormat {
                path: self.path.clone(),
                source,
            })?;
        Ok(manifest.versions)
    }
}

/// Decides which version to install.
///
/// `requested` is a version string or [`LATEST`]; `None` means latest.
///
/// # Errors
///
/// Returns the refusal reason when no update should run.
pub fn plan_update(
    requested: Option<&str>,
    running: &Version,
    available: &[Version],
) -> Result<Version, UpdateError> {
    let latest = available.iter().max().ok_or(UpdateError::NoReleases)?;
    let wants_latest = requested.is_none_or(|text| text.trim() == LATEST);

    let target = if wants_latest {
        latest.clone()
    } else {
        let text = requested.unwrap_or(LATEST).trim();
        text.parse::<Version>()
            .ok()
            .filter(|version| available.contains(version))
            .ok_or_else(|| UpdateError::UnknownVersion(text.to_owned()))?
    };

    if wants_latest && running == latest {
        return Err(UpdateError::AlreadyLatest);
    }
    if *running == target {
        return Err(UpdateError::AlreadyAt(target));
    }
    if *running > target {
        return Err(UpdateError::Downgrade {
            requested: target,
            running: running.clone(),
        });
    }
    Ok(target)
}
