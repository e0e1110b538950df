use std::path::PathBuf;
use std::sync::Arc;

use nix::unistd::Pid;
use semver::Version;
use serde_json::Value;

use crate::identity::{Identity, IdentityField};
use crate::operator::OperatorSettings;

/// Identity fields reported in startup notices, in wire order.
///
/// The running version is appended after these.
pub(crate) const INIT_DATA_FIELDS: [IdentityField; 8] = [
    IdentityField::Name,
    IdentityField::PublicIp,
    IdentityField::LocalIp,
    IdentityField::InstanceId,
    IdentityField::ServerId,
    IdentityField::ClusterId,
    IdentityField::AccountId,
    IdentityField::QueueName,
];

/// Identity fields reported in shutdown notices, in wire order.
pub(crate) const SHUTDOWN_FIELDS: [IdentityField; 4] = [
    IdentityField::ServerId,
    IdentityField::ClusterId,
    IdentityField::AccountId,
    IdentityField::InstanceId,
];

/// Facts about the running worker shared by every agent.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Host identity.
    pub identity: Arc<Identity>,
    /// Version of the running binary.
    pub version: Version,
    /// Address of this host's direct queue.
    pub address: String,
    /// Where startup notices go.
    pub startup_recipient: Option<String>,
    /// Where shutdown notices go.
    pub shutdown_recipient: Option<String>,
    /// Where stats reports go.
    pub stats_recipient: Option<String>,
    /// Configuration file `reconfig` rewrites.
    pub config_path: PathBuf,
    /// Supervisor to signal after a successful `reconfig`.
    pub parent_pid: Option<Pid>,
}

impl AgentContext {
    /// Builds the context for one node.
    #[must_use]
    pub fn for_node(
        identity: Arc<Identity>,
        version: Version,
        settings: &OperatorSettings,
        config_path: PathBuf,
        parent_pid: Option<Pid>,
    ) -> Self {
        Self {
            identity,
            version,
            address: format!("{}:direct", settings.direct_key()),
            startup_recipient: settings.startup_recipient().map(str::to_owned),
            shutdown_recipient: settings.shutdown_recipient().map(str::to_owned),
            stats_recipient: settings.stats().map(|stats| stats.recipient.clone()),
            config_path,
            parent_pid,
        }
    }

    /// Version compiled into this binary.
    ///
    /// # Errors
    ///
    /// Fails only if the package version is not valid semver.
    pub fn running_version() -> Result<Version, semver::Error> {
        Version::parse(env!("CARGO_PKG_VERSION"))
    }

    pub(crate) fn init_data(&self) -> Vec<Value> {
        let mut args: Vec<Value> = INIT_DATA_FIELDS
            .iter()
            .map(|field| self.identity.value_or_null(*field))
            .collect();
        args.push(Value::String(self.version.to_string()));
        args
    }

    pub(crate) fn shutdown_data(&self) -> Vec<Value> {
        SHUTDOWN_FIELDS
            .iter()
            .map(|field| self.identity.value_or_null(*field))
            .collect()
    }
}
