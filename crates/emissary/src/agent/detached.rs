//! Fire-and-forget background tasks.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// Starts shell commands that outlive the daemon.
pub trait TaskSpawner: Send + Sync {
    /// Launches `command` fully detached and returns once it is running.
    ///
    /// The caller keeps no handle and never learns how the task ends.
    ///
    /// # Errors
    ///
    /// Returns an error when the task could not be started.
    fn spawn(&self, command: &str) -> io::Result<()>;
}

/// Spawns through `/bin/sh` in a new session.
///
/// The launcher shell starts the command in the background and exits at
/// once; it is waited on so it never lingers as a zombie, and the orphaned
/// command is adopted by init.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpawner;

impl TaskSpawner for SystemSpawner {
    fn spawn(&self, command: &str) -> io::Result<()> {
        let mut launcher = Command::new("/bin/sh");
        launcher
            .arg("-c")
            .arg(format!("({command}) </dev/null >/dev/null 2>&1 &"))
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: `setsid` is async-signal-safe and touches no parent state.
        unsafe {
            launcher.pre_exec(|| {
                nix::unistd::setsid().map(drop).map_err(io::Error::from)
            });
        }
        let status = launcher.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("update launcher exited with {status}")))
        }
    }
}
