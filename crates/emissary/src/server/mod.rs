//! Worker lifecycle and reactor.
//!
//! A [`Server`] drives one operator on a single-threaded reactor: inbound
//! envelopes are dispatched one at a time, a fixed-interval health check
//! watches for termination requests and transport failures, and an optional
//! stats timer publishes reports. Every path out of the reactor ends in
//! [`Server::shutdown`], which always terminates the process.

mod exit;
mod signals;

#[cfg(test)]
mod tests;

use std::convert::Infallible;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use strum::Display;
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, interval_at};
use tracing::{debug, error, info, warn};

pub use exit::{ProcessExit, SystemExit};
pub use signals::{SignalRequest, SignalSource, SystemSignals};

use crate::agent::AgentRegistry;
use crate::error::ErrorKind;
use crate::health::{HealthReporter, StructuredHealthReporter};
use crate::operator::{BrokerConnector, Operator};

pub(crate) const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

/// Period of the reactor's health check.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// How a worker is brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ShutdownKind {
    /// Send the shutdown notice and disconnect first.
    Graceful,
    /// Exit without touching the transport.
    Hard,
}

impl ShutdownKind {
    /// Process exit status for this kind.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Graceful => 0,
            Self::Hard => 1,
        }
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not started.
    Stopped,
    /// Writing the pid file and installing signal handlers.
    Starting,
    /// Reactor running.
    Running,
    /// Shutdown in progress.
    ShuttingDown(ShutdownKind),
}

/// Failures while preparing the worker process.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The worker pid file could not be written.
    #[error("failed to write pid file '{path}': {source}")]
    PidFile {
        /// Pid file location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
}

/// One worker: an operator, its agents, and the process around them.
pub struct Server<C: BrokerConnector> {
    state: ServerState,
    operator: Operator<C>,
    agents: AgentRegistry,
    pid_path: PathBuf,
    health: Arc<dyn HealthReporter>,
    signals: Box<dyn SignalSource>,
    exit: Box<dyn ProcessExit>,
}

impl<C: BrokerConnector> Server<C> {
    /// Builds a stopped server using the real process collaborators.
    #[must_use]
    pub fn new(operator: Operator<C>, agents: AgentRegistry, pid_path: impl Into<PathBuf>) -> Self {
        Self {
            state: ServerState::Stopped,
            operator,
            agents,
            pid_path: pid_path.into(),
            health: Arc::new(StructuredHealthReporter::new()),
            signals: Box::new(SystemSignals::default()),
            exit: Box::new(SystemExit),
        }
    }

    /// Replaces the lifecycle event sink.
    #[must_use]
    pub fn with_health(mut self, health: Arc<dyn HealthReporter>) -> Self {
        self.health = health;
        self
    }

    /// Replaces the signal source.
    #[must_use]
    pub fn with_signals(mut self, signals: Box<dyn SignalSource>) -> Self {
        self.signals = signals;
        self
    }

    /// Replaces how the process terminates.
    #[must_use]
    pub fn with_exit(mut self, exit: Box<dyn ProcessExit>) -> Self {
        self.exit = exit;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Writes the pid file, installs signal handlers and runs the reactor.
    ///
    /// Returns immediately if the server is already running; otherwise the
    /// process exits from here. A failure while preparing, or a panic in the
    /// reactor, forces a hard shutdown.
    pub async fn startup(&mut self) {
        if self.state == ServerState::Running {
            debug!(target: SERVER_TARGET, "startup ignored; already running");
            return;
        }
        self.state = ServerState::Starting;
        self.health.server_starting(self.operator.node());

        let (kind, reason) = match self.prepare() {
            Err(failure) => {
                error!(target: SERVER_TARGET, error = %failure, "startup failed");
                (ShutdownKind::Hard, failure.to_string())
            }
            Ok(()) => match AssertUnwindSafe(self.serve()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(target: SERVER_TARGET, "reactor panicked");
                    (ShutdownKind::Hard, "reactor panicked".to_owned())
                }
            },
        };
        match self.shutdown(kind, &reason).await {}
    }

    /// Runs the reactor until something asks the worker to stop, then shuts
    /// down.
    ///
    /// Returns immediately if the server is already running; otherwise the
    /// process exits from here.
    pub async fn run(&mut self) {
        if self.state == ServerState::Running {
            debug!(target: SERVER_TARGET, "run ignored; already running");
            return;
        }
        let (kind, reason) = self.serve().await;
        match self.shutdown(kind, &reason).await {}
    }

    /// Brings the worker down and terminates the process.
    ///
    /// A graceful shutdown first asks a connected operator to send its
    /// shutdown notice and disconnect; failures and panics in that step are
    /// reported and swallowed. The pid file is always removed.
    pub async fn shutdown(&mut self, kind: ShutdownKind, reason: &str) -> Infallible {
        let node = self.operator.node().to_owned();
        self.state = ServerState::ShuttingDown(kind);
        self.health.shutdown_started(&node, kind, reason);

        if kind == ShutdownKind::Graceful && self.operator.is_connected() {
            let graceful = AssertUnwindSafe(self.operator.shutdown(&self.agents))
                .catch_unwind()
                .await;
            match graceful {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => self.health.shutdown_step_failed(&node, &failure.to_string()),
                Err(_) => self
                    .health
                    .shutdown_step_failed(&node, "operator shutdown panicked"),
            }
        }

        self.remove_pid_file();
        self.state = ServerState::Stopped;
        let code = kind.exit_code();
        self.health.exiting(&node, code);
        self.exit.exit(code)
    }

    fn prepare(&mut self) -> Result<(), StartupError> {
        fs::write(&self.pid_path, format!("{}\n", std::process::id())).map_err(|source| {
            StartupError::PidFile {
                path: self.pid_path.clone(),
                source,
            }
        })?;
        self.signals.install().map_err(StartupError::Signals)
    }

    fn remove_pid_file(&self) {
        match fs::remove_file(&self.pid_path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => warn!(
                target: SERVER_TARGET,
                path = %self.pid_path.display(),
                %error,
                "failed to remove pid file"
            ),
        }
    }

    /// Starts the operator and runs the reactor; returns why it stopped.
    async fn serve(&mut self) -> (ShutdownKind, String) {
        if let Err(failure) = self.operator.start(&self.agents).await {
            self.health.operator_failed(self.operator.node(), &failure);
            let kind = if failure.matches(ErrorKind::Connection) {
                ShutdownKind::Hard
            } else {
                ShutdownKind::Graceful
            };
            return (kind, failure.to_string());
        }
        self.state = ServerState::Running;
        self.health.server_running(self.operator.node());

        let mut health_check = interval(HEALTH_CHECK_INTERVAL);
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_timer = self.operator.settings().stats().map(|stats| {
            let mut timer = interval_at(Instant::now() + stats.interval, stats.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                received = self.operator.receive() => match received {
                    Ok(Some(message)) => self.operator.process(message, &self.agents).await,
                    // The next health check sees the ended stream.
                    Ok(None) => {}
                    Err(failure) => {
                        error!(target: SERVER_TARGET, error = %failure, "receive failed");
                        return (ShutdownKind::Graceful, failure.to_string());
                    }
                },
                _ = health_check.tick() => {
                    if let Some(reason) = self.check_health() {
                        return (ShutdownKind::Graceful, reason);
                    }
                }
                () = next_tick(stats_timer.as_mut()) => {
                    self.operator.gather_stats(&self.agents).await;
                }
            }
        }
    }

    /// Returns a reason to stop, if there is one.
    fn check_health(&self) -> Option<String> {
        match self.signals.pending() {
            Some(SignalRequest::Terminate) => {
                info!(target: SERVER_TARGET, "termination requested");
                return Some("termination signal received".to_owned());
            }
            Some(SignalRequest::Reload) => {
                info!(target: SERVER_TARGET, "reload is handled by the supervisor");
            }
            None => {}
        }
        match panic::catch_unwind(AssertUnwindSafe(|| self.operator.shutting_down())) {
            Ok(Ok(false)) => None,
            Ok(Ok(true)) => Some("operator requested shutdown".to_owned()),
            Ok(Err(failure)) => {
                warn!(target: SERVER_TARGET, error = %failure, "health check failed");
                Some(failure.to_string())
            }
            Err(_) => Some("health check panicked".to_owned()),
        }
    }
}

async fn next_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
