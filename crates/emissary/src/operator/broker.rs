//! Seam between the operator and a concrete AMQP client.
//!
//! The operator only needs a handful of channel primitives; keeping them
//! behind a trait lets the reactor be exercised against an in-memory broker.

use async_trait::async_trait;
use emissary_config::{BrokerUri, ExchangeKind, QueueOptions};

use crate::error::EmissaryError;

/// Broker-assigned delivery identifier used for ack and reject.
pub type DeliveryTag = u64;

/// One message delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    /// Tag to acknowledge or reject the delivery with.
    pub tag: DeliveryTag,
    /// Exchange the message was routed through.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw body.
    pub payload: Vec<u8>,
}

/// Opens channels to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Channel type produced by this connector.
    type Channel: BrokerChannel;

    /// Connects to the broker and opens one channel.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Connection`](crate::ErrorKind::Connection)
    /// error when the broker is unreachable or the requested transport is
    /// unavailable.
    async fn connect(&self, uri: &BrokerUri) -> Result<Self::Channel, EmissaryError>;
}

/// Channel operations used by the operator.
#[async_trait]
pub trait BrokerChannel: Send {
    /// Declares the per-connection queue.
    async fn declare_queue(&mut self, queue: &str, options: QueueOptions)
    -> Result<(), EmissaryError>;

    /// Binds `queue` to `exchange` for `routing_key`.
    async fn bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), EmissaryError>;

    /// Removes a binding created by [`BrokerChannel::bind`].
    async fn unbind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), EmissaryError>;

    /// Starts consuming `queue` with manual acknowledgement.
    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<(), EmissaryError>;

    /// Cancels the consumer started by [`BrokerChannel::consume`].
    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), EmissaryError>;

    /// Waits for the next delivery.
    ///
    /// Returns `Ok(None)` once the consumer stream has ended. Pends forever
    /// while no consumer is registered.
    async fn next_delivery(&mut self) -> Result<Option<InboundDelivery>, EmissaryError>;

    /// Publishes `payload` on `exchange`.
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), EmissaryError>;

    /// Positively acknowledges a delivery.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), EmissaryError>;

    /// Negatively acknowledges a delivery.
    async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), EmissaryError>;

    /// Whether the connection and channel are still usable.
    fn is_open(&self) -> bool;

    /// Closes the channel and its connection.
    async fn close(&mut self) -> Result<(), EmissaryError>;
}

/// Broker exchange backing each exchange kind.
///
/// The headers kind has no pre-declared exchange, so publishing or binding
/// on it is refused.
#[must_use]
pub fn exchange_name(kind: ExchangeKind) -> Option<&'static str> {
    match kind {
        ExchangeKind::Topic => Some("amq.topic"),
        ExchangeKind::Fanout => Some("amq.fanout"),
        ExchangeKind::Direct => Some("amq.direct"),
        ExchangeKind::Headers => None,
    }
}
