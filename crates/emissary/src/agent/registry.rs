use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use emissary_config::Config;
use tracing::{debug, error, warn};

use super::{
    AGENT_TARGET, Agent, AgentContext, Dispatch, EmissaryAgent, ImplicitReply, Outcome,
    PingAgent, StatsAgent,
};
use crate::message::Message;

/// Agent addressed by a bare method name.
pub const DEFAULT_AGENT: &str = "emissary";

/// Enabled agents, keyed by name.
#[derive(Default)]
pub struct AgentRegistry {
    agents: BTreeMap<&'static str, Box<dyn Agent>>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry of every built-in agent enabled in `config`.
    #[must_use]
    pub fn standard(context: &Arc<AgentContext>, config: &Config) -> Self {
        let general = config.general();
        let mut registry = Self::new();
        if general.agent_enabled("emissary") {
            registry.register(EmissaryAgent::from_config(
                Arc::clone(context),
                config.agents().emissary(),
            ));
        }
        if general.agent_enabled("ping") {
            registry.register(PingAgent::new(Arc::clone(context)));
        }
        if general.agent_enabled("stats") {
            registry.register(StatsAgent::new(Arc::clone(context)));
        }
        registry
    }

    /// Adds or replaces an agent.
    pub fn register(&mut self, agent: impl Agent + 'static) -> &mut Self {
        self.agents.insert(agent.name(), Box::new(agent));
        self
    }

    /// Names of the registered agents.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.agents.keys().copied()
    }

    /// Routes `request` to its agent and converts the outcome.
    ///
    /// Never panics: a panicking operation is reported as an error reply.
    #[must_use]
    pub fn dispatch(&self, request: &Message) -> Dispatch {
        if request.has_errors() {
            warn!(
                target: AGENT_TARGET,
                uuid = %request.uuid(),
                "refusing to dispatch malformed envelope"
            );
            return Dispatch::Error(request.error_response(request.errors().join("; ")));
        }
        if request.in_reply_to().is_some() {
            debug!(
                target: AGENT_TARGET,
                uuid = %request.uuid(),
                status = %request.status_type(),
                "reply received; nothing to dispatch"
            );
            return Dispatch::NoReply;
        }

        let (agent_name, method) = split_type(request.message_type());
        let Some(agent) = self.agents.get(agent_name) else {
            warn!(target: AGENT_TARGET, agent = agent_name, "no such agent");
            return Dispatch::Error(request.error_response(format!("unknown agent '{agent_name}'")));
        };
        if !agent.valid_methods().contains(&method) {
            warn!(target: AGENT_TARGET, agent = agent_name, method, "method not permitted");
            return Dispatch::Error(request.error_response("method not permitted"));
        }

        debug!(
            target: AGENT_TARGET,
            uuid = %request.uuid(),
            agent = agent_name,
            method,
            "invoking"
        );
        match panic::catch_unwind(AssertUnwindSafe(|| agent.invoke(method, request))) {
            Ok(Ok(Outcome::Reply(reply))) => Dispatch::Reply(reply),
            Ok(Ok(Outcome::NoReply)) => Dispatch::NoReply,
            Ok(Ok(Outcome::Implicit)) => match agent.implicit_reply() {
                ImplicitReply::DefaultSuccess => Dispatch::Reply(request.response()),
                ImplicitReply::Suppress => Dispatch::NoReply,
            },
            Ok(Err(failure)) => {
                error!(
                    target: AGENT_TARGET,
                    agent = agent_name,
                    method,
                    error = %failure,
                    "operation failed"
                );
                Dispatch::Error(request.error_response(failure.to_string()))
            }
            Err(payload) => {
                let detail = panic_detail(payload.as_ref());
                error!(
                    target: AGENT_TARGET,
                    agent = agent_name,
                    method,
                    panic = %detail,
                    "operation panicked"
                );
                Dispatch::Error(request.error_response(format!("operation panicked: {detail}")))
            }
        }
    }
}

fn split_type(message_type: &str) -> (&str, &str) {
    message_type
        .split_once('.')
        .unwrap_or((DEFAULT_AGENT, message_type))
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_owned()
    }
}
