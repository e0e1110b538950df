use std::sync::Arc;

use serde_json::Value;

use super::{Agent, AgentContext, AgentError, Outcome};
use crate::identity::IdentityField;
use crate::message::Message;

/// Liveness probe.
pub struct PingAgent {
    context: Arc<AgentContext>,
}

impl PingAgent {
    /// Builds the agent.
    #[must_use]
    pub fn new(context: Arc<AgentContext>) -> Self {
        Self { context }
    }
}

impl Agent for PingAgent {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn valid_methods(&self) -> &'static [&'static str] {
        &["ping"]
    }

    fn invoke(&self, _method: &str, request: &Message) -> Result<Outcome, AgentError> {
        let mut reply = request.response();
        reply.set_args(vec![
            self.context.identity.value_or_null(IdentityField::QueueName),
            Value::from("pong"),
        ]);
        Ok(Outcome::Reply(reply))
    }
}
