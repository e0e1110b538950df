use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Delivers the reload request to the supervisor.
pub trait Signaller: Send + Sync {
    /// Asks `pid` to reload its configuration.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the signal cannot be delivered.
    fn reload(&self, pid: Pid) -> Result<(), Errno>;
}

/// Sends `SIGHUP`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSignaller;

impl Signaller for SystemSignaller {
    fn reload(&self, pid: Pid) -> Result<(), Errno> {
        kill(pid, Signal::SIGHUP)
    }
}
