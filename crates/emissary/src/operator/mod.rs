//! Broker transport: connection, bindings and acknowledgement bookkeeping.
//!
//! An [`Operator`] owns one broker channel for the lifetime of a worker. It
//! declares a queue unique to the connection, binds it to every configured
//! subscription plus a direct binding on the host's own queue name, and turns
//! deliveries into [`Message`]s. Each delivered envelope is tracked until it
//! is acknowledged or rejected exactly once.

mod acks;
mod amqp;
mod broker;
mod settings;
mod subscriptions;


use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use amqp::{AmqpChannel, AmqpConnector};
pub use broker::{BrokerChannel, BrokerConnector, DeliveryTag, InboundDelivery, exchange_name};
pub use settings::{OperatorSettings, StatsSettings, validate_config};
pub use subscriptions::SubscriptionSet;

use self::acks::PendingAcks;
use crate::agent::{AgentRegistry, Dispatch};
use crate::error::{EmissaryError, ErrorKind};
use crate::message::Message;

pub(crate) const OPERATOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::operator");

/// Wait before disconnecting so the final publish can leave the client.
///
/// Publishes are not confirmed, so there is no signal that the last envelope
/// (typically the shutdown notice) has been flushed.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

const DIRECT_EXCHANGE: &str = "amq.direct";

static QUEUE_COUNT: AtomicU32 = AtomicU32::new(1);

/// Broker transport for one configured node.
pub struct Operator<C: BrokerConnector> {
    node: String,
    settings: OperatorSettings,
    connector: C,
    channel: Option<C::Channel>,
    queue_name: String,
    consumer_tag: String,
    subscribed: bool,
    consumer_ended: bool,
    not_acked: PendingAcks,
    displaced: Vec<DeliveryTag>,
}

impl<C: BrokerConnector> Operator<C> {
    /// Builds a disconnected operator.
    ///
    /// The queue name combines the host's queue name with a process-wide
    /// counter so that several connections from one host never collide.
    pub fn new(node: impl Into<String>, settings: OperatorSettings, connector: C) -> Self {
        let count = QUEUE_COUNT.fetch_add(1, Ordering::Relaxed);
        let queue_name = format!("{}.{count}", settings.direct_key());
        let consumer_tag = format!("emissary-{queue_name}");
        Self {
            node: node.into(),
            settings,
            connector,
            channel: None,
            queue_name,
            consumer_tag,
            subscribed: false,
            consumer_ended: false,
            not_acked: PendingAcks::default(),
            displaced: Vec::new(),
        }
    }

    /// Name of the configured node this operator serves.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Name of the per-connection queue.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Address other hosts use to reach this one directly.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:direct", self.settings.direct_key())
    }

    /// Settings this operator was built from.
    #[must_use]
    pub fn settings(&self) -> &OperatorSettings {
        &self.settings
    }

    /// Number of deliveries awaiting ack or reject.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.not_acked.len()
    }

    /// Whether the broker channel is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(BrokerChannel::is_open)
    }

    /// Connects to the broker and declares the per-connection queue.
    ///
    /// # Errors
    ///
    /// Propagates [`ErrorKind::Connection`] errors from the connector,
    /// including a TLS request the build cannot honour.
    pub async fn connect(&mut self) -> Result<(), EmissaryError> {
        let broker = self.settings.broker();
        info!(
            target: OPERATOR_TARGET,
            node = %self.node,
            %broker,
            queue = %self.queue_name,
            "connecting"
        );
        let mut channel = self.connector.connect(broker).await?;
        channel
            .declare_queue(&self.queue_name, self.settings.queue())
            .await?;
        self.channel = Some(channel);
        self.consumer_ended = false;
        Ok(())
    }

    /// Binds every subscription plus the implicit direct binding, then
    /// starts consuming.
    ///
    /// Subscriptions on the headers exchange are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Fails when not connected or when the broker refuses a binding.
    pub async fn subscribe(&mut self) -> Result<(), EmissaryError> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(not_connected());
        };
        for (kind, routing_key) in self.settings.subscriptions().iter() {
            let Some(exchange) = exchange_name(kind) else {
                warn!(
                    target: OPERATOR_TARGET,
                    routing_key,
                    exchange = %kind,
                    "no broker exchange for subscription; skipping"
                );
                continue;
            };
            debug!(target: OPERATOR_TARGET, routing_key, exchange, "subscribing");
            channel.bind(&self.queue_name, exchange, routing_key).await?;
        }
        let direct_key = self.settings.direct_key();
        debug!(target: OPERATOR_TARGET, routing_key = direct_key, "subscribing to own queue");
        channel
            .bind(&self.queue_name, DIRECT_EXCHANGE, direct_key)
            .await?;
        channel.consume(&self.queue_name, &self.consumer_tag).await?;
        self.subscribed = true;
        Ok(())
    }

    /// Removes every binding made by [`Operator::subscribe`] and cancels the
    /// consumer.
    ///
    /// All steps are attempted even if one fails.
    ///
    /// # Errors
    ///
    /// Returns the first failure encountered.
    pub async fn unsubscribe(&mut self) -> Result<(), EmissaryError> {
        if !self.subscribed {
            return Ok(());
        }
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        let mut first_error = None;
        for (kind, routing_key) in self.settings.subscriptions().iter() {
            let Some(exchange) = exchange_name(kind) else {
                continue;
            };
            info!(target: OPERATOR_TARGET, routing_key, exchange, "unsubscribing");
            keep_first(
                &mut first_error,
                channel.unbind(&self.queue_name, exchange, routing_key).await,
            );
        }
        info!(target: OPERATOR_TARGET, "unsubscribing from own queue");
        keep_first(
            &mut first_error,
            channel
                .unbind(&self.queue_name, DIRECT_EXCHANGE, self.settings.direct_key())
                .await,
        );
        info!(target: OPERATOR_TARGET, "cancelling subscription");
        keep_first(&mut first_error, channel.cancel(&self.consumer_tag).await);
        self.subscribed = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Stamps and publishes `message` on the exchange named by its exchange
    /// type.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidExchange`] when the message has no
    /// exchange type or one without a broker exchange; otherwise propagates
    /// encoding and broker failures.
    pub async fn send(&mut self, mut message: Message) -> Result<(), EmissaryError> {
        let Some(exchange) = message.exchange_type().and_then(exchange_name) else {
            let kind = message
                .exchange_type()
                .map_or_else(|| "none".to_owned(), |kind| kind.to_string());
            return Err(EmissaryError::invalid_exchange(format!(
                "publish request on invalid exchange '{kind}' with routing key '{}'",
                message.routing_key()
            )));
        };
        let Some(channel) = self.channel.as_mut() else {
            return Err(not_connected());
        };
        let payload = message.stamp_sent().encode()?;
        debug!(
            target: OPERATOR_TARGET,
            exchange,
            routing_key = message.routing_key(),
            originator = message.originator(),
            recipient = message.recipient(),
            "sending message"
        );
        channel
            .publish(exchange, message.routing_key(), payload)
            .await
    }

    /// Acknowledges the delivery tracked under `uuid`.
    ///
    /// Unknown or already settled uuids are logged and ignored. Returns
    /// whether the broker was sent an ack.
    pub async fn ack(&mut self, uuid: Uuid) -> bool {
        let Some(tag) = self.not_acked.take(uuid) else {
            warn!(target: OPERATOR_TARGET, %uuid, "message not acknowledged: nothing pending");
            return false;
        };
        let Some(channel) = self.channel.as_mut() else {
            warn!(target: OPERATOR_TARGET, %uuid, "message not acknowledged: disconnected");
            return false;
        };
        match channel.ack(tag).await {
            Ok(()) => {
                debug!(target: OPERATOR_TARGET, %uuid, "acknowledged message");
                true
            }
            Err(error) => {
                error!(target: OPERATOR_TARGET, %uuid, %error, "acknowledgement failed");
                false
            }
        }
    }

    /// Rejects the delivery tracked under `uuid`.
    ///
    /// Unknown or already settled uuids are logged and ignored. Returns
    /// whether the broker was sent a reject.
    pub async fn reject(&mut self, uuid: Uuid, requeue: bool) -> bool {
        let Some(tag) = self.not_acked.take(uuid) else {
            warn!(target: OPERATOR_TARGET, %uuid, "message not rejected: nothing pending");
            return false;
        };
        let Some(channel) = self.channel.as_mut() else {
            warn!(target: OPERATOR_TARGET, %uuid, "message not rejected: disconnected");
            return false;
        };
        match channel.reject(tag, requeue).await {
            Ok(()) => {
                debug!(target: OPERATOR_TARGET, %uuid, requeue, "rejected message");
                true
            }
            Err(error) => {
                error!(target: OPERATOR_TARGET, %uuid, %error, "reject failed");
                false
            }
        }
    }

    /// Waits for the next inbound envelope.
    ///
    /// Malformed payloads still produce an envelope, flagged through
    /// [`Message::errors`]. Returns `Ok(None)` once when the consumer stream
    /// ends; after that, and while disconnected, the future never resolves.
    ///
    /// # Errors
    ///
    /// Propagates broker failures while waiting.
    pub async fn receive(&mut self) -> Result<Option<Message>, EmissaryError> {
        if self.consumer_ended {
            return std::future::pending().await;
        }
        let Some(channel) = self.channel.as_mut() else {
            return std::future::pending().await;
        };
        let Some(delivery) = channel.next_delivery().await? else {
            warn!(target: OPERATOR_TARGET, node = %self.node, "consumer stream ended");
            self.consumer_ended = true;
            return Ok(None);
        };
        debug!(
            target: OPERATOR_TARGET,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            "received delivery"
        );

        let mut message = Message::decode_lossy(&delivery.payload);
        message.stamp_received();
        if message.has_errors() {
            warn!(
                target: OPERATOR_TARGET,
                uuid = %message.uuid(),
                errors = ?message.errors(),
                "received malformed message"
            );
        }
        // No await past this point: a cancelled receive must not strand the
        // tracked delivery. Displaced tags are rejected by `process`.
        if let Some(displaced) = self.not_acked.track(message.uuid(), delivery.tag) {
            warn!(
                target: OPERATOR_TARGET,
                uuid = %message.uuid(),
                "duplicate uuid in flight; rejecting the earlier delivery"
            );
            self.displaced.push(displaced);
        }
        Ok(Some(message))
    }

    /// Dispatches an inbound envelope, sends the resulting reply if any, and
    /// acknowledges the envelope whatever the outcome.
    ///
    /// Earlier deliveries displaced by a duplicate uuid are rejected first.
    pub async fn process(&mut self, message: Message, agents: &AgentRegistry) {
        self.reject_displaced().await;
        let uuid = message.uuid();
        match agents.dispatch(&message) {
            Dispatch::Reply(reply) | Dispatch::Error(reply) => {
                if let Err(error) = self.send(reply).await {
                    error!(target: OPERATOR_TARGET, %uuid, %error, "failed to send reply");
                }
            }
            Dispatch::NoReply => {
                debug!(target: OPERATOR_TARGET, %uuid, "no reply requested");
            }
        }
        self.ack(uuid).await;
    }

    /// Connects, subscribes and publishes the startup notice.
    ///
    /// A failed startup notice is logged but does not fail the start.
    ///
    /// # Errors
    ///
    /// Propagates connection and subscription failures.
    pub async fn start(&mut self, agents: &AgentRegistry) -> Result<(), EmissaryError> {
        self.connect().await?;
        self.subscribe().await?;
        if let Err(error) = self.dispatch_local("emissary.startup", agents).await {
            warn!(target: OPERATOR_TARGET, %error, "startup notice not sent");
        }
        Ok(())
    }

    /// Publishes the shutdown notice and closes the connection.
    ///
    /// The connection is closed even when the notice fails.
    ///
    /// # Errors
    ///
    /// Returns the notice failure, or else the close failure.
    pub async fn shutdown(&mut self, agents: &AgentRegistry) -> Result<(), EmissaryError> {
        let notice = self.dispatch_local("emissary.shutdown", agents).await;
        let closed = self.close().await;
        notice.and(closed)
    }

    /// Publishes a stats report.
    pub async fn gather_stats(&mut self, agents: &AgentRegistry) {
        if let Err(error) = self.dispatch_local("stats.gather", agents).await {
            warn!(target: OPERATOR_TARGET, %error, "stats report not sent");
        }
    }

    /// Reports whether the transport wants the worker to stop.
    ///
    /// # Errors
    ///
    /// Returns a [`ErrorKind::Connection`] error if the channel has closed
    /// underneath the operator.
    pub fn shutting_down(&self) -> Result<bool, EmissaryError> {
        if self.consumer_ended {
            return Ok(true);
        }
        match &self.channel {
            Some(channel) if !channel.is_open() => Err(EmissaryError::connection(
                "broker channel is no longer open",
            )),
            _ => Ok(false),
        }
    }

    /// Unsubscribes and disconnects after [`CLOSE_GRACE`].
    ///
    /// Deliveries still awaiting ack are forgotten; the broker redelivers
    /// them to the next consumer.
    ///
    /// # Errors
    ///
    /// Returns the first unsubscribe failure, or else the close failure.
    pub async fn close(&mut self) -> Result<(), EmissaryError> {
        if self.channel.is_none() {
            return Ok(());
        }
        tokio::time::sleep(CLOSE_GRACE).await;
        let unsubscribed = self.unsubscribe().await;
        let closed = match self.channel.take() {
            Some(mut channel) => channel.close().await,
            None => Ok(()),
        };
        if !self.not_acked.is_empty() {
            warn!(
                target: OPERATOR_TARGET,
                pending = self.not_acked.len(),
                "closing with unacknowledged deliveries"
            );
            self.not_acked.clear();
        }
        self.displaced.clear();
        info!(target: OPERATOR_TARGET, node = %self.node, "disconnected");
        unsubscribed.and(closed)
    }

    async fn reject_displaced(&mut self) {
        while let Some(&tag) = self.displaced.last() {
            let Some(channel) = self.channel.as_mut() else {
                return;
            };
            if let Err(error) = channel.reject(tag, false).await {
                warn!(target: OPERATOR_TARGET, %error, "reject of displaced delivery failed");
            }
            self.displaced.pop();
        }
    }

    async fn dispatch_local(
        &mut self,
        message_type: &str,
        agents: &AgentRegistry,
    ) -> Result<(), EmissaryError> {
        let address = self.address();
        let request = Message::new(address.clone(), address, message_type, Vec::new());
        match agents.dispatch(&request) {
            Dispatch::Reply(reply) => self.send(reply).await,
            Dispatch::Error(reply) => Err(EmissaryError::new(
                ErrorKind::Handler,
                format!("{message_type}: {}", reply.status_note()),
            )),
            Dispatch::NoReply => Ok(()),
        }
    }
}

fn not_connected() -> EmissaryError {
    EmissaryError::connection("operator is not connected")
}

fn keep_first(slot: &mut Option<EmissaryError>, result: Result<(), EmissaryError>) {
    if let Err(error) = result {
        warn!(target: OPERATOR_TARGET, %error, "unsubscribe step failed");
        slot.get_or_insert(error);
    }
}
