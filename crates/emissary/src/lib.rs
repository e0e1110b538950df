//! Per-host agent daemon driven over an AMQP message bus.
//!
//! A remote controller publishes JSON envelopes addressed to a host. The
//! [`operator`] receives them from the broker, the [`agent`] registry routes
//! each `agent.method` request to a handler, and replies travel back through
//! the operator to the requester. The [`server`] owns one operator and runs
//! the single-threaded reactor that interleaves inbound requests with health
//! checks and periodic stats reports.
//!
//! `emissary start` runs a supervisor ([`process`]) that spawns one worker
//! process per configured AMQP node and restarts them on `SIGHUP` once the
//! new configuration validates.

pub mod agent;
mod cli;
pub mod error;
mod health;
pub mod identity;
pub mod message;
pub mod operator;
pub mod process;
pub mod server;
mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use cli::{Cli, Command, run};
pub use error::{BoxError, EmissaryError, ErrorKind};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use message::{Message, StatusType};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};
