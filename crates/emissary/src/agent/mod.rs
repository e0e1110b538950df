//! Handler dispatch.
//!
//! An [`Agent`] is a named whitelist of operations. The [`AgentRegistry`]
//! routes an inbound envelope to the agent named by its type, enforces the
//! whitelist, contains failures, and turns whatever the operation produced
//! into a [`Dispatch`] the operator can act on.

mod context;
mod detached;
mod emissary;
mod ping;
mod registry;
mod release;
mod signal;
mod stats;


use std::io;
use std::path::PathBuf;

use emissary_config::ConfigError;
use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

use crate::message::Message;

pub use context::AgentContext;
pub use detached::{SystemSpawner, TaskSpawner};
pub use emissary::EmissaryAgent;
pub use ping::PingAgent;
pub use registry::AgentRegistry;
pub use release::{LATEST, ManifestCatalog, ReleaseCatalog, UpdateError, plan_update};
pub use signal::{Signaller, SystemSignaller};
pub use stats::StatsAgent;

pub(crate) const AGENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::agent");

/// What an operation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Send this envelope.
    Reply(Message),
    /// Send nothing.
    NoReply,
    /// The operation had nothing to say; the agent's [`ImplicitReply`]
    /// policy decides what is sent.
    Implicit,
}

/// What the operator must do after dispatching one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Publish a successful reply.
    Reply(Message),
    /// Publish nothing.
    NoReply,
    /// Publish an error reply.
    Error(Message),
}

/// How an agent answers operations that return [`Outcome::Implicit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImplicitReply {
    /// Send an empty success reply to the requester.
    #[default]
    DefaultSuccess,
    /// Send nothing.
    Suppress,
}

/// A named set of invocable operations.
pub trait Agent: Send + Sync {
    /// Name used as the first segment of an envelope type.
    fn name(&self) -> &'static str;

    /// Operations that may be invoked remotely.
    fn valid_methods(&self) -> &'static [&'static str];

    /// Policy applied when an operation returns [`Outcome::Implicit`].
    fn implicit_reply(&self) -> ImplicitReply {
        ImplicitReply::DefaultSuccess
    }

    /// Runs `method` for `request`.
    ///
    /// Only called with methods listed in [`Agent::valid_methods`].
    ///
    /// # Errors
    ///
    /// Any error becomes an error reply whose note is the error's message.
    fn invoke(&self, method: &str, request: &Message) -> Result<Outcome, AgentError>;
}

/// Failures raised by agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Generic operation failure.
    #[error("{0}")]
    Failed(String),
    /// A required positional argument was absent.
    #[error("missing argument {index} ({name})")]
    MissingArgument {
        /// Zero-based position.
        index: usize,
        /// What the argument means.
        name: &'static str,
    },
    /// A positional argument had the wrong shape.
    #[error("invalid argument {index}: {reason}")]
    InvalidArgument {
        /// Zero-based position.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },
    /// A submitted configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A filesystem operation failed.
    #[error("{action} {path}: {source}")]
    Io {
        /// What was being attempted.
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// A self-update request was refused or could not be launched.
    #[error(transparent)]
    Update(#[from] UpdateError),
    /// Signalling the supervisor failed.
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        /// Target process.
        pid: Pid,
        /// Underlying error.
        #[source]
        source: Errno,
    },
    /// The operation needs configuration that is not present.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    /// The configuration file may not be rewritten by this process.
    #[error("config file {path} is not writable: {source}")]
    NotWritable {
        /// Live configuration path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: Errno,
    },
}

impl AgentError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            action,
            path,
            source,
        }
    }
}
