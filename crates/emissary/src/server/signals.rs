use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

/// A signal-driven request observed by the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRequest {
    /// Interrupt, terminate or quit.
    Terminate,
    /// Hangup.
    Reload,
}

/// Source of signal-driven requests, polled from the reactor.
pub trait SignalSource: Send {
    /// Installs the handlers.
    ///
    /// # Errors
    ///
    /// Returns the OS error when a handler cannot be registered.
    fn install(&mut self) -> io::Result<()>;

    /// Returns the request raised since the last poll, if any.
    ///
    /// Termination stays pending once raised.
    fn pending(&self) -> Option<SignalRequest>;
}

/// Flags set from real signal handlers.
#[derive(Debug, Default, Clone)]
pub struct SystemSignals {
    terminate: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl SignalSource for SystemSignals {
    fn install(&mut self) -> io::Result<()> {
        for signal in [SIGTERM, SIGINT, SIGQUIT] {
            signal_hook::flag::register(signal, Arc::clone(&self.terminate))?;
        }
        signal_hook::flag::register(SIGHUP, Arc::clone(&self.reload))?;
        Ok(())
    }

    fn pending(&self) -> Option<SignalRequest> {
        if self.terminate.load(Ordering::SeqCst) {
            Some(SignalRequest::Terminate)
        } else if self.reload.swap(false, Ordering::SeqCst) {
            Some(SignalRequest::Reload)
        } else {
            None
        }
    }
}
