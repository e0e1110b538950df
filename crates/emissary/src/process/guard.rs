//! Singleton lock, pid file and health snapshot owned by the supervisor.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{info, warn};

use emissary_config::RuntimePaths;

use super::PROCESS_TARGET;
use super::errors::LaunchError;
use super::files::{atomic_write, read_pid, remove_if_present};

/// Supervisor state published in the health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Lock held, workers not yet spawned.
    Starting,
    /// Workers spawned.
    Running,
    /// Re-reading the configuration after `SIGHUP`.
    Reloading,
    /// Terminating workers.
    Stopping,
}

/// Contents of the health file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Supervisor state.
    pub status: HealthState,
    /// Supervisor pid.
    pub pid: u32,
    /// Seconds since the Unix epoch when the snapshot was written.
    pub timestamp: u64,
}

impl HealthSnapshot {
    fn now(status: HealthState, pid: u32) -> Result<Self, LaunchError> {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        Ok(Self {
            status,
            pid,
            timestamp,
        })
    }

    /// Reads the snapshot at `path`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::HealthFormat`] when the file is not a snapshot.
    pub fn read(path: &Path) -> Result<Option<Self>, LaunchError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LaunchError::HealthRead {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Holds the supervisor's runtime artefacts and removes them on drop.
#[derive(Debug)]
pub(super) struct ProcessGuard {
    paths: RuntimePaths,
    _lock: File,
    pid: Option<u32>,
}

impl ProcessGuard {
    /// Takes the lock, clearing artefacts left behind by a dead supervisor.
    pub(super) fn acquire(paths: RuntimePaths) -> Result<Self, LaunchError> {
        let lock = acquire_lock(&paths)?;
        Ok(Self {
            paths,
            _lock: lock,
            pid: None,
        })
    }

    pub(super) fn write_pid(&mut self, pid: u32) -> Result<(), LaunchError> {
        let path = self.paths.pid_path();
        atomic_write(path, format!("{pid}\n").as_bytes()).map_err(|source| {
            LaunchError::PidWrite {
                path: path.to_path_buf(),
                source,
            }
        })?;
        self.pid = Some(pid);
        info!(target: PROCESS_TARGET, pid, file = %path.display(), "pid file written");
        Ok(())
    }

    pub(super) fn write_health(&self, status: HealthState) -> Result<(), LaunchError> {
        let pid = self.pid.ok_or(LaunchError::MissingPid)?;
        let path = self.paths.health_path();
        let mut contents = serde_json::to_vec(&HealthSnapshot::now(status, pid)?)?;
        contents.push(b'\n');
        atomic_write(path, &contents).map_err(|source| LaunchError::HealthWrite {
            path: path.to_path_buf(),
            source,
        })?;
        info!(target: PROCESS_TARGET, %status, "health snapshot updated");
        Ok(())
    }

    pub(super) fn paths(&self) -> &RuntimePaths {
        &self.paths
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        for path in [
            self.paths.health_path(),
            self.paths.pid_path(),
            self.paths.lock_path(),
        ] {
            if let Err(error) = remove_if_present(path) {
                warn!(
                    target: PROCESS_TARGET,
                    file = %path.display(),
                    %error,
                    "failed to remove runtime file"
                );
            }
        }
    }
}

fn acquire_lock(paths: &RuntimePaths) -> Result<File, LaunchError> {
    let attempt = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(paths.lock_path());
    match attempt {
        Ok(file) => {
            info!(
                target: PROCESS_TARGET,
                file = %paths.lock_path().display(),
                "acquired supervisor lock"
            );
            Ok(file)
        }
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => handle_existing_lock(paths),
        Err(source) => Err(LaunchError::LockCreate {
            path: paths.lock_path().to_path_buf(),
            source,
        }),
    }
}

fn handle_existing_lock(paths: &RuntimePaths) -> Result<File, LaunchError> {
    if let Some(pid) = read_pid(paths.pid_path()) {
        if process_alive(pid)? {
            info!(target: PROCESS_TARGET, pid, "refusing to start: supervisor alive");
            return Err(LaunchError::AlreadyRunning { pid });
        }
        warn!(target: PROCESS_TARGET, pid, "supervisor not detected; cleaning stale files");
    }
    for path in [paths.lock_path(), paths.pid_path(), paths.health_path()] {
        remove_if_present(path).map_err(|source| LaunchError::Cleanup {
            path: path.to_path_buf(),
            source,
        })?;
    }
    acquire_lock(paths)
}

/// Probes `pid` with the null signal.
pub(super) fn process_alive(pid: u32) -> Result<bool, LaunchError> {
    let Ok(raw) = i32::try_from(pid) else {
        return Ok(false);
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(source) => Err(LaunchError::Signal { pid, source }),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    struct Runtime {
        _dir: TempDir,
        paths: RuntimePaths,
    }

    #[fixture]
    fn runtime() -> Runtime {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RuntimePaths::in_dir(dir.path().join("run")).expect("paths");
        Runtime { _dir: dir, paths }
    }

    fn own_pid() -> u32 {
        std::process::id()
    }

    #[rstest]
    fn guard_writes_pid_and_health_then_cleans_up(runtime: Runtime) {
        let mut guard = ProcessGuard::acquire(runtime.paths.clone()).expect("lock");
        guard.write_pid(own_pid()).expect("pid");
        guard.write_health(HealthState::Running).expect("health");

        assert_eq!(read_pid(runtime.paths.pid_path()), Some(own_pid()));
        let snapshot = HealthSnapshot::read(runtime.paths.health_path())
            .expect("readable")
            .expect("present");
        assert_eq!(snapshot.status, HealthState::Running);
        assert_eq!(snapshot.pid, own_pid());

        drop(guard);
        assert!(!runtime.paths.lock_path().exists());
        assert!(!runtime.paths.pid_path().exists());
        assert!(!runtime.paths.health_path().exists());
    }

    #[rstest]
    fn health_requires_pid(runtime: Runtime) {
        let guard = ProcessGuard::acquire(runtime.paths.clone()).expect("lock");
        let error = guard
            .write_health(HealthState::Starting)
            .expect_err("pid missing");
        assert!(matches!(error, LaunchError::MissingPid));
    }

    #[rstest]
    fn live_supervisor_blocks_second_lock(runtime: Runtime) {
        let mut first = ProcessGuard::acquire(runtime.paths.clone()).expect("lock");
        first.write_pid(own_pid()).expect("pid");

        let error = ProcessGuard::acquire(runtime.paths.clone()).expect_err("already running");
        assert!(matches!(error, LaunchError::AlreadyRunning { pid } if pid == own_pid()));
    }

    #[rstest]
    fn stale_lock_is_reclaimed(runtime: Runtime) {
        fs::write(runtime.paths.lock_path(), b"").expect("lock");
        // Pid ceiling on Linux is 2^22; this one cannot exist.
        fs::write(runtime.paths.pid_path(), b"99999999\n").expect("pid");
        fs::write(runtime.paths.health_path(), b"{}").expect("health");

        let _guard = ProcessGuard::acquire(runtime.paths.clone()).expect("reclaimed");
        assert!(runtime.paths.lock_path().exists());
        assert!(!runtime.paths.pid_path().exists());
        assert!(!runtime.paths.health_path().exists());
    }

    #[rstest]
    fn missing_snapshot_reads_as_none(runtime: Runtime) {
        assert!(
            HealthSnapshot::read(runtime.paths.health_path())
                .expect("readable")
                .is_none()
        );
    }

    #[test]
    fn health_state_names_are_lowercase() {
        assert_eq!(HealthState::Reloading.to_string(), "reloading");
        assert_eq!("stopping".parse::<HealthState>(), Ok(HealthState::Stopping));
    }
}
