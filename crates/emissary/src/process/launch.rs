//! Entry points for the supervisor and worker processes.

use std::env;
use std::path::Path;
use std::sync::Arc;

use nix::unistd::Pid;
use tracing::{info, warn};

use emissary_config::{Config, RuntimePaths};

use crate::agent::{AgentContext, AgentRegistry};
use crate::identity::Identity;
use crate::operator::{AmqpConnector, Operator, OperatorSettings};
use crate::server::Server;
use crate::telemetry;

use super::daemonizer::{Daemonizer, SystemDaemonizer};
use super::errors::LaunchError;
use super::guard::{HealthState, ProcessGuard};
use super::supervisor::{Supervisor, SystemLauncher};
use super::{PARENT_PID_ENV_VAR, PROCESS_TARGET};

/// Launch mode for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Fork into the background and detach from the controlling terminal.
    Background,
    /// Remain attached to the terminal.
    Foreground,
}

impl LaunchMode {
    /// Background when `daemonize` is set.
    #[must_use]
    pub fn from_flag(daemonize: bool) -> Self {
        if daemonize {
            Self::Background
        } else {
            Self::Foreground
        }
    }
}

/// Runs the supervisor until it is asked to terminate.
///
/// # Errors
///
/// Fails when the configuration is invalid, another supervisor holds the
/// lock, daemonising fails, or the first set of workers cannot be spawned.
pub fn run_supervisor(config_path: &Path, mode: LaunchMode) -> Result<(), LaunchError> {
    let config = Config::load(config_path)?;
    telemetry::initialise(&config)?;
    info!(
        target: PROCESS_TARGET,
        ?mode,
        config = %config_path.display(),
        "starting supervisor"
    );

    let mut guard = ProcessGuard::acquire(RuntimePaths::from_config(&config)?)?;
    if mode == LaunchMode::Background {
        SystemDaemonizer.daemonize(guard.paths())?;
    }
    guard.write_pid(std::process::id())?;
    guard.write_health(HealthState::Starting)?;

    // Workers re-read the file, so hand them an absolute path.
    let config_path = std::path::absolute(config_path).map_err(|source| LaunchError::Spawn {
        node: String::new(),
        source,
    })?;
    let mut supervisor = Supervisor::new(&config, config_path, SystemLauncher::current()?);
    supervisor.start()?;
    guard.write_health(HealthState::Running)?;
    supervisor.run();
    guard.write_health(HealthState::Stopping)?;
    info!(target: PROCESS_TARGET, "supervisor stopped");
    Ok(())
}

/// Runs one worker for `node`. Once the server has started the process
/// exits from inside the server, so this only returns on a setup failure.
///
/// # Errors
///
/// Fails when the configuration, telemetry, operator settings or runtime
/// cannot be prepared.
pub fn run_worker(config_path: &Path, node: &str) -> Result<(), LaunchError> {
    let config = Config::load(config_path)?;
    let node_config = config
        .amqp_node(node)
        .ok_or_else(|| LaunchError::UnknownNode(node.to_owned()))?;
    telemetry::initialise_with(&config, node_config.debug())?;

    let identity = Arc::new(Identity::from_overrides(config.identity_overrides()));
    let settings = OperatorSettings::from_node(node_config, &identity)?;
    let rewritable = config
        .agents()
        .emissary()
        .config_path()
        .unwrap_or(config_path)
        .to_path_buf();
    let context = Arc::new(AgentContext::for_node(
        identity,
        AgentContext::running_version()?,
        &settings,
        rewritable,
        supervisor_pid(),
    ));
    let agents = AgentRegistry::standard(&context, &config);
    info!(
        target: PROCESS_TARGET,
        node,
        agents = ?agents.names().collect::<Vec<_>>(),
        "starting worker"
    );

    let pid_path = RuntimePaths::from_config(&config)?.worker_pid_path(node);
    let operator = Operator::new(node, settings, AmqpConnector);
    let mut server = Server::new(operator, agents, pid_path);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(LaunchError::Runtime)?;
    runtime.block_on(server.startup());
    Ok(())
}

fn supervisor_pid() -> Option<Pid> {
    let raw = env::var(PARENT_PID_ENV_VAR).ok()?;
    match raw.parse::<i32>() {
        Ok(pid) if pid > 0 => Some(Pid::from_raw(pid)),
        _ => {
            warn!(target: PROCESS_TARGET, value = %raw, "ignoring malformed supervisor pid");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support;

    #[test]
    fn launch_mode_follows_flag() {
        assert_eq!(LaunchMode::from_flag(true), LaunchMode::Background);
        assert_eq!(LaunchMode::from_flag(false), LaunchMode::Foreground);
    }

    #[test]
    fn worker_refuses_unknown_node() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, test_support::CONFIG_TEXT).expect("write config");

        let error = run_worker(&path, "elsewhere").expect_err("unknown node");
        assert!(matches!(error, LaunchError::UnknownNode(ref node) if node == "elsewhere"));
    }

    #[test]
    fn worker_reports_missing_configuration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = run_worker(&dir.path().join("absent.toml"), "main").expect_err("missing");
        assert!(matches!(error, LaunchError::Config(_)));
    }
}
