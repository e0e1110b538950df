//! `emissary stop` and `emissary status`.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{info, warn};

use emissary_config::RuntimePaths;

use super::errors::LaunchError;
use super::files::{read_pid, remove_if_present};
use super::guard::{HealthSnapshot, process_alive};
use super::{POLL_INTERVAL, PROCESS_TARGET, STOP_TIMEOUT};

/// What `stop` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The supervisor received `SIGTERM` and exited.
    Stopped {
        /// Supervisor pid.
        pid: u32,
    },
    /// The pid file named a dead process; its artefacts were removed.
    Stale {
        /// Pid recorded in the file.
        pid: u32,
    },
    /// No pid file.
    NotRunning,
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped { pid } => write!(f, "emissary (pid {pid}) stopped"),
            Self::Stale { pid } => write!(f, "emissary was not running; removed stale pid {pid}"),
            Self::NotRunning => f.write_str("emissary is not running"),
        }
    }
}

/// Stops the supervisor recorded under `paths`, waiting up to
/// [`STOP_TIMEOUT`].
///
/// # Errors
///
/// Fails when the process cannot be signalled, stale files cannot be removed,
/// or the supervisor outlives the timeout.
pub fn stop(paths: &RuntimePaths) -> Result<StopOutcome, LaunchError> {
    stop_within(paths, STOP_TIMEOUT)
}

fn stop_within(paths: &RuntimePaths, timeout: Duration) -> Result<StopOutcome, LaunchError> {
    let Some(pid) = read_pid(paths.pid_path()) else {
        return Ok(StopOutcome::NotRunning);
    };
    let raw = i32::try_from(pid).map_err(|_| LaunchError::Signal {
        pid,
        source: Errno::EINVAL,
    })?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => info!(target: PROCESS_TARGET, pid, "sent SIGTERM to supervisor"),
        Err(Errno::ESRCH) => {
            warn!(target: PROCESS_TARGET, pid, "supervisor not found; removing stale files");
            for path in [paths.pid_path(), paths.health_path(), paths.lock_path()] {
                remove_if_present(path).map_err(|source| LaunchError::Cleanup {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            return Ok(StopOutcome::Stale { pid });
        }
        Err(source) => return Err(LaunchError::Signal { pid, source }),
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_alive(pid)? {
            return Ok(StopOutcome::Stopped { pid });
        }
        thread::sleep(POLL_INTERVAL);
    }
    Err(LaunchError::StopTimeout {
        pid,
        timeout_secs: timeout.as_secs(),
    })
}

/// What `status` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
    /// The snapshot's process is alive.
    Running(HealthSnapshot),
    /// A snapshot exists but its process is gone.
    Stale(HealthSnapshot),
    /// No snapshot.
    Stopped,
}

impl StatusReport {
    /// Whether a live supervisor was found.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running(snapshot) => write!(
                f,
                "emissary {} (pid {}, updated {})",
                snapshot.status, snapshot.pid, snapshot.timestamp
            ),
            Self::Stale(snapshot) => write!(
                f,
                "emissary not running; stale {} snapshot from pid {}",
                snapshot.status, snapshot.pid
            ),
            Self::Stopped => f.write_str("emissary is not running"),
        }
    }
}

/// Reads the supervisor health snapshot under `paths`.
///
/// # Errors
///
/// Fails when the snapshot is unreadable or the pid cannot be probed.
pub fn status(paths: &RuntimePaths) -> Result<StatusReport, LaunchError> {
    let Some(snapshot) = HealthSnapshot::read(paths.health_path())? else {
        return Ok(StatusReport::Stopped);
    };
    if process_alive(snapshot.pid)? {
        Ok(StatusReport::Running(snapshot))
    } else {
        Ok(StatusReport::Stale(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::process::Command;

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::process::HealthState;

    struct Runtime {
        _dir: TempDir,
        paths: RuntimePaths,
    }

    #[fixture]
    fn runtime() -> Runtime {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RuntimePaths::in_dir(dir.path().to_path_buf()).expect("paths");
        Runtime { _dir: dir, paths }
    }

    fn write_snapshot(paths: &RuntimePaths, pid: u32) {
        let snapshot = HealthSnapshot {
            status: HealthState::Running,
            pid,
            timestamp: 1_700_000_000,
        };
        fs::write(
            paths.health_path(),
            serde_json::to_vec(&snapshot).expect("json"),
        )
        .expect("write snapshot");
    }

    #[rstest]
    fn stop_without_pid_file_reports_not_running(runtime: Runtime) {
        assert_eq!(stop(&runtime.paths).expect("stop"), StopOutcome::NotRunning);
    }

    #[rstest]
    fn stop_removes_stale_artefacts(runtime: Runtime) {
        fs::write(runtime.paths.pid_path(), b"99999999\n").expect("pid");
        fs::write(runtime.paths.lock_path(), b"").expect("lock");

        let outcome = stop(&runtime.paths).expect("stop");
        assert_eq!(outcome, StopOutcome::Stale { pid: 99_999_999 });
        assert!(!runtime.paths.pid_path().exists());
        assert!(!runtime.paths.lock_path().exists());
    }

    #[rstest]
    fn stop_terminates_live_process(runtime: Runtime) {
        let mut child = Command::new("sleep").arg("30").spawn().expect("sleep");
        let pid = child.id();
        fs::write(runtime.paths.pid_path(), format!("{pid}\n")).expect("pid");
        // Reap from another thread so the exited child does not linger as a zombie.
        let reaper = thread::spawn(move || child.wait());

        let outcome = stop_within(&runtime.paths, Duration::from_secs(5)).expect("stop");
        assert_eq!(outcome, StopOutcome::Stopped { pid });
        assert!(reaper.join().expect("reaper").is_ok());
    }

    #[rstest]
    fn status_reports_live_snapshot(runtime: Runtime) {
        write_snapshot(&runtime.paths, std::process::id());

        let report = status(&runtime.paths).expect("status");
        assert!(report.is_running());
        assert!(report.to_string().starts_with("emissary running (pid "));
    }

    #[rstest]
    fn status_flags_dead_snapshot_as_stale(runtime: Runtime) {
        write_snapshot(&runtime.paths, 99_999_999);

        let report = status(&runtime.paths).expect("status");
        assert!(matches!(report, StatusReport::Stale(ref snapshot) if snapshot.pid == 99_999_999));
    }

    #[rstest]
    fn status_without_snapshot_is_stopped(runtime: Runtime) {
        assert_eq!(status(&runtime.paths).expect("status"), StatusReport::Stopped);
    }

    #[rstest]
    fn garbled_snapshot_is_an_error(runtime: Runtime) {
        fs::write(runtime.paths.health_path(), b"not json").expect("write");
        let error = status(&runtime.paths).expect_err("garbled");
        assert!(matches!(error, LaunchError::HealthFormat(_)));
    }
}
