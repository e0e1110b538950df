//! Periodic host statistics.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{AGENT_TARGET, Agent, AgentContext, AgentError, ImplicitReply, Outcome};
use crate::identity::IdentityField;
use crate::message::Message;

const LOADAVG_PATH: &str = "/proc/loadavg";

/// Message type of published reports.
pub const STATS_REPORT_TYPE: &str = "stats.report";

/// Reports load averages to the configured stats queue.
pub struct StatsAgent {
    context: Arc<AgentContext>,
    loadavg: PathBuf,
}

impl StatsAgent {
    /// Builds the agent reading the kernel's load averages.
    #[must_use]
    pub fn new(context: Arc<AgentContext>) -> Self {
        Self {
            context,
            loadavg: PathBuf::from(LOADAVG_PATH),
        }
    }

    /// Reads load averages from `path` instead.
    #[must_use]
    pub fn with_loadavg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.loadavg = path.into();
        self
    }

    fn load_averages(&self) -> Result<Vec<Value>, AgentError> {
        let text = fs::read_to_string(&self.loadavg)
            .map_err(AgentError::io("failed to read", &self.loadavg))?;
        let averages = text
            .split_whitespace()
            .take(3)
            .map(|field| {
                field.parse::<f64>().map(Value::from).map_err(|_| {
                    AgentError::Failed(format!(
                        "unexpected load average '{field}' in {}",
                        self.loadavg.display()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if averages.len() < 3 {
            return Err(AgentError::Failed(format!(
                "{} holds fewer than three load averages",
                self.loadavg.display()
            )));
        }
        Ok(averages)
    }
}

impl Agent for StatsAgent {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn valid_methods(&self) -> &'static [&'static str] {
        &["gather"]
    }

    fn implicit_reply(&self) -> ImplicitReply {
        ImplicitReply::Suppress
    }

    fn invoke(&self, _method: &str, _request: &Message) -> Result<Outcome, AgentError> {
        let Some(recipient) = self.context.stats_recipient.as_deref() else {
            debug!(target: AGENT_TARGET, "stats reporting disabled");
            return Ok(Outcome::Implicit);
        };
        let mut args = vec![self.context.identity.value_or_null(IdentityField::Name)];
        args.extend(self.load_averages()?);
        Ok(Outcome::Reply(Message::new(
            self.context.address.clone(),
            recipient,
            STATS_REPORT_TYPE,
            args,
        )))
    }
}
