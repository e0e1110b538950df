//! Defines the unified error surface for supervisor and worker launch.

use std::io;
use std::path::PathBuf;
use std::time::SystemTimeError;

use nix::errno::Errno;
use thiserror::Error;

use emissary_config::{ConfigError, RuntimePathsError};

use crate::error::EmissaryError;
use crate::telemetry::TelemetryError;

use super::daemonizer::DaemonizeError;

/// Errors surfaced while launching, supervising or controlling the daemon.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Configuration failed to load.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The runtime directory could not be created.
    #[error(transparent)]
    RuntimePaths(#[from] RuntimePathsError),
    /// Telemetry could not be initialised.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// Lock file creation failed.
    #[error("failed to create lock file '{path}': {source}")]
    LockCreate {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A running supervisor already holds the lock.
    #[error("emissary already running with pid {pid}")]
    AlreadyRunning {
        /// PID recorded in the existing PID file.
        pid: u32,
    },
    /// Removing a stale runtime artefact failed.
    #[error("failed to remove stale file '{path}': {source}")]
    Cleanup {
        /// Path of the artefact that could not be removed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Writing the PID file failed.
    #[error("failed to write pid file '{path}': {source}")]
    PidWrite {
        /// PID file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Writing the health snapshot failed.
    #[error("failed to write health snapshot '{path}': {source}")]
    HealthWrite {
        /// Health file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Reading the health snapshot failed.
    #[error("failed to read health snapshot '{path}': {source}")]
    HealthRead {
        /// Health file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Serialising or parsing the health snapshot failed.
    #[error("malformed health snapshot: {0}")]
    HealthFormat(#[from] serde_json::Error),
    /// Obtaining the current timestamp failed.
    #[error("failed to read system time: {0}")]
    Clock(#[from] SystemTimeError),
    /// Health updates were attempted before writing the PID file.
    #[error("pid must be written before updating health state")]
    MissingPid,
    /// Probing or signalling a process failed.
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        /// Target process.
        pid: u32,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// The process did not exit within the stop timeout.
    #[error("process {pid} still running after {timeout_secs}s")]
    StopTimeout {
        /// Process that was asked to stop.
        pid: u32,
        /// Seconds waited.
        timeout_secs: u64,
    },
    /// Daemonisation failed.
    #[error("failed to daemonise: {0}")]
    Daemonize(#[from] DaemonizeError),
    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
    /// A worker process could not be started.
    #[error("failed to spawn worker for node '{node}': {source}")]
    Spawn {
        /// Node the worker would serve.
        node: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A worker was asked to serve a node the configuration lacks.
    #[error("no [amqp.{0}] section in configuration")]
    UnknownNode(String),
    /// The configuration declares no AMQP nodes.
    #[error("configuration declares no [amqp.<node>] sections")]
    NoNodes,
    /// The operator settings could not be derived.
    #[error(transparent)]
    Operator(#[from] EmissaryError),
    /// The package version is not valid semver.
    #[error("invalid package version: {0}")]
    Version(#[from] semver::Error),
    /// The async runtime could not be built.
    #[error("failed to build async runtime: {0}")]
    Runtime(#[source] io::Error),
}
