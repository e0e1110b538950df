//! Keeps one worker process alive per configured AMQP node.

use std::collections::BTreeMap;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use emissary_config::Config;

use crate::server::{SignalRequest, SignalSource, SystemSignals};

use super::errors::LaunchError;
use super::{
    MAX_RESPAWN_BACKOFF, PARENT_PID_ENV_VAR, POLL_INTERVAL, PROCESS_TARGET, RESPAWN_BACKOFF,
    STABLE_RUN, STOP_TIMEOUT, WORKER_SUBCOMMAND,
};

/// A running worker process.
pub trait WorkerHandle {
    /// Process id of the worker.
    fn id(&self) -> u32;

    /// Returns the exit status once the worker has exited.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the status cannot be collected.
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    /// Asks the worker to stop and waits for it.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the worker cannot be signalled or reaped.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Starts worker processes.
pub trait WorkerLauncher {
    /// Handle type for launched workers.
    type Worker: WorkerHandle;

    /// Starts a worker serving `node` with the configuration at `config_path`.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Spawn`] when the process cannot be started.
    fn launch(&self, node: &str, config_path: &Path) -> Result<Self::Worker, LaunchError>;
}

/// Launches `emissary worker` from the running executable.
#[derive(Debug, Clone)]
pub struct SystemLauncher {
    program: PathBuf,
}

impl SystemLauncher {
    /// Launches workers from the current executable.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Spawn`] when the executable path is unknown.
    pub fn current() -> Result<Self, LaunchError> {
        let program = env::current_exe().map_err(|source| LaunchError::Spawn {
            node: String::new(),
            source,
        })?;
        Ok(Self::new(program))
    }

    /// Launches workers from `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl WorkerLauncher for SystemLauncher {
    type Worker = ChildWorker;

    fn launch(&self, node: &str, config_path: &Path) -> Result<ChildWorker, LaunchError> {
        let child = Command::new(&self.program)
            .arg("--config")
            .arg(config_path)
            .arg(WORKER_SUBCOMMAND)
            .arg("--node")
            .arg(node)
            .env(PARENT_PID_ENV_VAR, std::process::id().to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                node: node.to_owned(),
                source,
            })?;
        Ok(ChildWorker { child })
    }
}

/// Worker started as a child process.
#[derive(Debug)]
pub struct ChildWorker {
    child: Child,
}

impl WorkerHandle for ChildWorker {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = i32::try_from(self.child.id()).map_err(io::Error::other)?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)?;
        let deadline = Instant::now() + STOP_TIMEOUT;
        while Instant::now() < deadline {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        warn!(target: PROCESS_TARGET, pid, "worker ignored SIGTERM; killing");
        self.child.kill()?;
        self.child.wait().map(drop)
    }
}

/// Delay before respawning a node after `failures` consecutive failures.
///
/// The first failure respawns at once; later ones back off exponentially up
/// to [`MAX_RESPAWN_BACKOFF`].
#[must_use]
pub(crate) fn respawn_delay(failures: u32) -> Duration {
    match failures {
        0 | 1 => Duration::ZERO,
        n => {
            let factor = 1_u32.checked_shl(n - 2).unwrap_or(u32::MAX);
            RESPAWN_BACKOFF
                .checked_mul(factor)
                .map_or(MAX_RESPAWN_BACKOFF, |delay| delay.min(MAX_RESPAWN_BACKOFF))
        }
    }
}

struct Running<W> {
    worker: W,
    started: Instant,
}

/// Consecutive failures of one node and when it may be launched again.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    not_before: Instant,
}

/// Prefork-style supervisor over per-node workers.
pub struct Supervisor<L: WorkerLauncher> {
    config_path: PathBuf,
    nodes: Vec<String>,
    launcher: L,
    signals: Box<dyn SignalSource>,
    workers: BTreeMap<String, Running<L::Worker>>,
    backoff: BTreeMap<String, Backoff>,
    poll_interval: Duration,
}

impl<L: WorkerLauncher> Supervisor<L> {
    /// Supervises one worker per `[amqp.<node>]` section of `config`.
    #[must_use]
    pub fn new(config: &Config, config_path: impl Into<PathBuf>, launcher: L) -> Self {
        Self {
            config_path: config_path.into(),
            nodes: node_names(config),
            launcher,
            signals: Box::new(SystemSignals::default()),
            workers: BTreeMap::new(),
            backoff: BTreeMap::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Replaces the signal source.
    #[must_use]
    pub fn with_signals(mut self, signals: Box<dyn SignalSource>) -> Self {
        self.signals = signals;
        self
    }

    /// Replaces the period between signal and worker checks.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Nodes currently served by a live worker.
    pub fn running_nodes(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    /// Installs signal handlers and spawns every worker.
    ///
    /// # Errors
    ///
    /// Fails when handlers cannot be installed, the configuration names no
    /// nodes, or a worker cannot be spawned. Workers already spawned are
    /// terminated first.
    pub fn start(&mut self) -> Result<(), LaunchError> {
        self.signals.install().map_err(LaunchError::Signals)?;
        if self.nodes.is_empty() {
            return Err(LaunchError::NoNodes);
        }
        for node in self.nodes.clone() {
            match self.launcher.launch(&node, &self.config_path) {
                Ok(worker) => self.adopt(node, worker),
                Err(failure) => {
                    self.terminate_all();
                    return Err(failure);
                }
            }
        }
        Ok(())
    }

    /// Watches signals and workers until termination is requested, then
    /// stops every worker.
    pub fn run(&mut self) {
        loop {
            match self.signals.pending() {
                Some(SignalRequest::Terminate) => {
                    info!(target: PROCESS_TARGET, "termination requested; stopping workers");
                    self.terminate_all();
                    return;
                }
                Some(SignalRequest::Reload) => self.reload(),
                None => {}
            }
            self.reap_exited();
            self.spawn_missing();
            thread::sleep(self.poll_interval);
        }
    }

    /// Re-reads the configuration; workers restart only if it is valid.
    fn reload(&mut self) {
        info!(
            target: PROCESS_TARGET,
            config = %self.config_path.display(),
            "reloading configuration"
        );
        match Config::load(&self.config_path) {
            Ok(config) => {
                self.terminate_all();
                self.backoff.clear();
                self.nodes = node_names(&config);
                info!(target: PROCESS_TARGET, nodes = ?self.nodes, "configuration reloaded");
            }
            Err(failure) => error!(
                target: PROCESS_TARGET,
                error = %failure,
                "configuration rejected; keeping running workers"
            ),
        }
    }

    fn reap_exited(&mut self) {
        let mut failed = Vec::new();
        self.workers.retain(|node, running| match running.worker.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(
                    target: PROCESS_TARGET,
                    node,
                    pid = running.worker.id(),
                    %status,
                    "worker exited"
                );
                failed.push((node.clone(), running.started.elapsed() >= STABLE_RUN));
                false
            }
            Err(failure) => {
                warn!(target: PROCESS_TARGET, node, error = %failure, "cannot poll worker");
                true
            }
        });
        for (node, was_stable) in failed {
            if was_stable {
                self.backoff.remove(&node);
            }
            self.record_failure(node);
        }
    }

    fn spawn_missing(&mut self) {
        let now = Instant::now();
        let missing: Vec<String> = self
            .nodes
            .iter()
            .filter(|node| !self.workers.contains_key(*node))
            .filter(|node| {
                self.backoff
                    .get(*node)
                    .is_none_or(|backoff| backoff.not_before <= now)
            })
            .cloned()
            .collect();
        for node in missing {
            match self.launcher.launch(&node, &self.config_path) {
                Ok(worker) => self.adopt(node, worker),
                Err(failure) => {
                    error!(target: PROCESS_TARGET, node, error = %failure, "respawn failed");
                    self.record_failure(node);
                }
            }
        }
    }

    fn record_failure(&mut self, node: String) {
        let failures = self
            .backoff
            .get(&node)
            .map_or(1, |backoff| backoff.failures.saturating_add(1));
        let delay = respawn_delay(failures);
        if !delay.is_zero() {
            warn!(
                target: PROCESS_TARGET,
                node,
                failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "worker keeps failing; delaying respawn"
            );
        }
        self.backoff.insert(
            node,
            Backoff {
                failures,
                not_before: Instant::now() + delay,
            },
        );
    }

    fn adopt(&mut self, node: String, worker: L::Worker) {
        info!(target: PROCESS_TARGET, node, pid = worker.id(), "worker started");
        self.workers.insert(
            node,
            Running {
                worker,
                started: Instant::now(),
            },
        );
    }

    fn terminate_all(&mut self) {
        for (node, mut running) in std::mem::take(&mut self.workers) {
            if let Err(failure) = running.worker.terminate() {
                warn!(target: PROCESS_TARGET, node, error = %failure, "failed to stop worker");
            }
        }
    }
}

fn node_names(config: &Config) -> Vec<String> {
    config.amqp_nodes().map(|(name, _)| name.to_owned()).collect()
}
