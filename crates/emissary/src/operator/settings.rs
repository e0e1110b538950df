use std::time::Duration;

use emissary_config::{Address, AmqpNodeConfig, BrokerUri, QueueOptions};

use super::subscriptions::SubscriptionSet;
use crate::error::{EmissaryError, ErrorKind};
use crate::identity::{Identity, IdentityField};

/// Checks an operator node before any connection is attempted.
///
/// # Errors
///
/// Returns every problem found in the node.
pub fn validate_config(node: &AmqpNodeConfig) -> Result<(), Vec<String>> {
    node.validate()
}

/// Periodic stats reporting for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSettings {
    /// Time between two reports.
    pub interval: Duration,
    /// Address reports are published to.
    pub recipient: String,
}

/// Validated node settings with identity placeholders resolved.
#[derive(Debug, Clone)]
pub struct OperatorSettings {
    broker: BrokerUri,
    subscriptions: SubscriptionSet,
    direct_key: String,
    startup: Option<String>,
    shutdown: Option<String>,
    queue: QueueOptions,
    stats: Option<StatsSettings>,
}

impl OperatorSettings {
    /// Validates `node` and resolves its identity placeholders.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::InvalidConfig`] error when validation fails,
    /// an interpolated address no longer parses, or the host's queue name
    /// cannot be resolved.
    pub fn from_node(node: &AmqpNodeConfig, identity: &Identity) -> Result<Self, EmissaryError> {
        validate_config(node).map_err(|errors| EmissaryError::invalid_config(errors.join("; ")))?;
        let broker = node.broker_uri().map_err(|error| {
            EmissaryError::with_origin(ErrorKind::InvalidConfig, "invalid broker URI", error)
        })?;

        let addresses = node
            .subscriptions()
            .map(|raw| {
                let resolved = identity.interpolate(raw);
                resolved.parse::<Address>().map_err(|error| {
                    EmissaryError::with_origin(
                        ErrorKind::InvalidConfig,
                        format!("subscription '{raw}' is invalid after interpolation"),
                        error,
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let direct_key = identity.resolve(IdentityField::QueueName).map_err(|error| {
            EmissaryError::with_origin(
                ErrorKind::InvalidConfig,
                "cannot derive this host's queue name",
                error,
            )
        })?;

        let stats = node.stats().and_then(|stats| {
            stats.queue_base().map(|base| StatsSettings {
                interval: stats.interval(),
                recipient: identity.interpolate(base),
            })
        });

        Ok(Self {
            broker,
            subscriptions: SubscriptionSet::from_addresses(&addresses),
            direct_key,
            startup: node.startup_recipient().map(|raw| identity.interpolate(raw)),
            shutdown: node.shutdown_recipient().map(|raw| identity.interpolate(raw)),
            queue: node.queue_options(),
            stats,
        })
    }

    /// Broker to connect to.
    #[must_use]
    pub fn broker(&self) -> &BrokerUri {
        &self.broker
    }

    /// Configured subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    /// Routing key of this host's implicit direct binding.
    #[must_use]
    pub fn direct_key(&self) -> &str {
        &self.direct_key
    }

    /// Address receiving the startup notice.
    #[must_use]
    pub fn startup_recipient(&self) -> Option<&str> {
        self.startup.as_deref()
    }

    /// Address receiving the shutdown notice.
    #[must_use]
    pub fn shutdown_recipient(&self) -> Option<&str> {
        self.shutdown.as_deref()
    }

    /// Queue declaration flags.
    #[must_use]
    pub fn queue(&self) -> QueueOptions {
        self.queue
    }

    /// Stats reporting, if enabled.
    #[must_use]
    pub fn stats(&self) -> Option<&StatsSettings> {
        self.stats.as_ref()
    }
}
