//! Self-management operations: lifecycle notices, reconfiguration and
//! self-update.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use emissary_config::{Config, DEFAULT_UPDATE_COMMAND, EmissaryAgentConfig};
use nix::unistd::{AccessFlags, access};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    AGENT_TARGET, Agent, AgentContext, AgentError, ManifestCatalog, Outcome, ReleaseCatalog,
    Signaller, SystemSignaller, SystemSpawner, TaskSpawner, UpdateError, plan_update,
};
use crate::message::Message;
use crate::telemetry::notice;

const METHODS: &[&str] = &[
    "startup",
    "shutdown",
    "reinit",
    "initdata",
    "reconfig",
    "selfupdate",
];

const VERSION_PLACEHOLDER: &str = "{version}";

/// Lifecycle notices, configuration replacement and self-update.
pub struct EmissaryAgent {
    context: Arc<AgentContext>,
    catalog: Option<Box<dyn ReleaseCatalog>>,
    spawner: Box<dyn TaskSpawner>,
    signaller: Box<dyn Signaller>,
    update_command: String,
}

impl EmissaryAgent {
    /// Builds the agent with system collaborators.
    #[must_use]
    pub fn from_config(context: Arc<AgentContext>, config: &EmissaryAgentConfig) -> Self {
        Self {
            context,
            catalog: config
                .release_manifest()
                .map(|path| Box::new(ManifestCatalog::new(path)) as Box<dyn ReleaseCatalog>),
            spawner: Box::new(SystemSpawner),
            signaller: Box::new(SystemSignaller),
            update_command: config.update_command().to_owned(),
        }
    }

    /// Builds the agent with explicit collaborators.
    #[must_use]
    pub fn new(
        context: Arc<AgentContext>,
        catalog: Option<Box<dyn ReleaseCatalog>>,
        spawner: Box<dyn TaskSpawner>,
        signaller: Box<dyn Signaller>,
    ) -> Self {
        Self {
            context,
            catalog,
            spawner,
            signaller,
            update_command: DEFAULT_UPDATE_COMMAND.to_owned(),
        }
    }

    /// Replaces the shell command run by `selfupdate`.
    ///
    /// `{version}` in the command is replaced with the target version.
    #[must_use]
    pub fn with_update_command(mut self, command: impl Into<String>) -> Self {
        self.update_command = command.into();
        self
    }

    fn startup(&self, request: &Message) -> Outcome {
        let Some(recipient) = self.context.startup_recipient.as_deref() else {
            debug!(target: AGENT_TARGET, "no startup recipient configured");
            return Outcome::NoReply;
        };
        notice!(target: AGENT_TARGET, recipient, "sending startup notice");
        let mut reply = request.response();
        reply
            .set_recipient(recipient)
            .set_args(self.context.init_data());
        Outcome::Reply(reply)
    }

    fn shutdown(&self, request: &Message) -> Outcome {
        let Some(recipient) = self.context.shutdown_recipient.as_deref() else {
            debug!(target: AGENT_TARGET, "no shutdown recipient configured");
            return Outcome::NoReply;
        };
        notice!(target: AGENT_TARGET, recipient, "sending shutdown notice");
        let mut reply = request.response();
        reply
            .set_recipient(recipient)
            .set_args(self.context.shutdown_data());
        Outcome::Reply(reply)
    }

    fn reinit(&self, request: &Message) -> Outcome {
        match self.startup(request) {
            // Still confirm to the requester that nothing went wrong.
            Outcome::NoReply => Outcome::Implicit,
            outcome => outcome,
        }
    }

    fn initdata(&self, request: &Message) -> Outcome {
        let mut reply = request.response();
        reply.set_args(self.context.init_data());
        Outcome::Reply(reply)
    }

    fn reconfig(&self, request: &Message) -> Result<Outcome, AgentError> {
        let text = match request.args().first() {
            None | Some(Value::Null) => "",
            Some(Value::String(text)) => text.as_str(),
            Some(other) => {
                return Err(AgentError::InvalidArgument {
                    index: 0,
                    reason: format!("expected configuration text, found {other}"),
                });
            }
        };
        if text.trim().is_empty() {
            info!(target: AGENT_TARGET, "empty reconfig request ignored");
            return Ok(Outcome::NoReply);
        }

        let path = self.context.config_path.as_path();
        replace_config(path, text)?;
        notice!(target: AGENT_TARGET, path = %path.display(), "configuration replaced");

        match self.context.parent_pid {
            Some(pid) => {
                self.signaller
                    .reload(pid)
                    .map_err(|source| AgentError::Signal { pid, source })?;
                info!(target: AGENT_TARGET, %pid, "asked supervisor to reload");
            }
            None => warn!(
                target: AGENT_TARGET,
                "no supervisor recorded; new configuration applies on next start"
            ),
        }
        Ok(Outcome::NoReply)
    }

    fn selfupdate(&self, request: &Message) -> Result<Outcome, AgentError> {
        let requested = match request.args().first() {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.as_str()),
            Some(other) => {
                return Err(AgentError::InvalidArgument {
                    index: 0,
                    reason: format!("expected a version string, found {other}"),
                });
            }
        };
        let catalog = self
            .catalog
            .as_deref()
            .ok_or(AgentError::NotConfigured("release manifest"))?;
        let available = catalog.versions()?;

        let target = plan_update(requested, &self.context.version, &available).inspect_err(|refusal| {
            notice!(target: AGENT_TARGET, reason = %refusal, "self-update refused");
        })?;

        let command = self
            .update_command
            .replace(VERSION_PLACEHOLDER, &target.to_string());
        notice!(
            target: AGENT_TARGET,
            running = %self.context.version,
            %target,
            "starting self-update"
        );
        self.spawner.spawn(&command).map_err(UpdateError::Spawn)?;
        Ok(Outcome::NoReply)
    }
}

/// Validates `text` as a configuration and atomically installs it at `path`.
///
/// The live file is untouched unless validation succeeds.
fn replace_config(path: &Path, text: &str) -> Result<(), AgentError> {
    access(path, AccessFlags::W_OK).map_err(|source| AgentError::NotWritable {
        path: path.to_path_buf(),
        source,
    })?;

    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::Builder::new()
        .prefix(".emissary-reconfig")
        .tempfile_in(directory)
        .map_err(AgentError::io("failed to stage configuration in", directory))?;
    staged
        .write_all(text.as_bytes())
        .and_then(|()| staged.as_file().sync_all())
        .map_err(AgentError::io("failed to write", staged.path()))?;

    Config::load(staged.path())?;

    let permissions = fs::metadata(path)
        .map_err(AgentError::io("failed to inspect", path))?
        .permissions();
    fs::set_permissions(staged.path(), permissions)
        .map_err(AgentError::io("failed to set permissions on", staged.path()))?;
    staged
        .persist(path)
        .map_err(|error| AgentError::io("failed to replace", path)(error.error))?;
    Ok(())
}

impl Agent for EmissaryAgent {
    fn name(&self) -> &'static str {
        "emissary"
    }

    fn valid_methods(&self) -> &'static [&'static str] {
        METHODS
    }

    fn invoke(&self, method: &str, request: &Message) -> Result<Outcome, AgentError> {
        match method {
            "startup" => Ok(self.startup(request)),
            "shutdown" => Ok(self.shutdown(request)),
            "reinit" => Ok(self.reinit(request)),
            "initdata" => Ok(self.initdata(request)),
            "reconfig" => self.reconfig(request),
            "selfupdate" => self.selfupdate(request),
            other => Err(AgentError::Failed(format!("unhandled method '{other}'"))),
        }
    }
}
