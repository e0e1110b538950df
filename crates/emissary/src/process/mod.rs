//! Supervisor and worker process management.
//!
//! `emissary start` runs a supervisor that owns the runtime artefacts in
//! `general.pid_dir` and keeps one worker process alive per configured AMQP
//! node. Each worker runs a [`crate::server::Server`] on its own
//! single-threaded runtime.

use std::time::Duration;

mod control;
mod daemonizer;
mod errors;
mod files;
mod guard;
mod launch;
mod supervisor;

pub use control::{StatusReport, StopOutcome, status, stop};
pub use daemonizer::{DaemonizeError, Daemonizer, SystemDaemonizer};
pub use errors::LaunchError;
pub use guard::{HealthSnapshot, HealthState};
pub use launch::{LaunchMode, run_supervisor, run_worker};
pub use supervisor::{ChildWorker, Supervisor, SystemLauncher, WorkerHandle, WorkerLauncher};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");

/// Environment variable carrying the supervisor pid into its workers.
pub const PARENT_PID_ENV_VAR: &str = "EMISSARY_PARENT_PID";

/// Hidden subcommand the supervisor uses to start a worker.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Upper bound on waiting for a process to exit after `SIGTERM`.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Delay before the second consecutive respawn of a failing worker; doubles
/// with each further failure.
pub const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Ceiling on the respawn delay.
pub const MAX_RESPAWN_BACKOFF: Duration = Duration::from_secs(60);

/// A worker that lived at least this long clears its failure count.
pub const STABLE_RUN: Duration = Duration::from_secs(30);
