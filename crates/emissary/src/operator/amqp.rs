//! `lapin`-backed implementation of the broker seam.

use async_trait::async_trait;
use emissary_config::{BrokerUri, QueueOptions};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicRejectOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::debug;

use super::OPERATOR_TARGET;
use super::broker::{BrokerChannel, BrokerConnector, DeliveryTag, InboundDelivery};
use crate::error::{EmissaryError, ErrorKind};

const CLOSE_REPLY_CODE: u16 = 200;
const CLOSE_REPLY_TEXT: &str = "emissary shutdown";

/// Connects to a real broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpConnector;

/// Open connection and channel to a real broker.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
}

fn broker_error(action: &str) -> impl FnOnce(lapin::Error) -> EmissaryError + '_ {
    move |error| EmissaryError::with_origin(ErrorKind::Connection, format!("{action} failed"), error)
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    type Channel = AmqpChannel;

    async fn connect(&self, uri: &BrokerUri) -> Result<AmqpChannel, EmissaryError> {
        if uri.tls() && !cfg!(feature = "tls") {
            return Err(EmissaryError::connection(
                "requested a TLS connection but this build has no TLS support",
            ));
        }
        debug!(target: OPERATOR_TARGET, broker = %uri, "connecting to broker");
        let connection = Connection::connect(uri.as_str(), ConnectionProperties::default())
            .await
            .map_err(|error| {
                EmissaryError::with_origin(
                    ErrorKind::Connection,
                    format!("failed to connect to {uri}"),
                    error,
                )
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(broker_error("opening channel"))?;
        Ok(AmqpChannel {
            connection,
            channel,
            consumer: None,
        })
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(
        &mut self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), EmissaryError> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(queue, declare, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(broker_error("queue declare"))
    }

    async fn bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), EmissaryError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error("queue bind"))
    }

    async fn unbind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), EmissaryError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(broker_error("queue unbind"))
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<(), EmissaryError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error("basic consume"))?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), EmissaryError> {
        self.consumer = None;
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(broker_error("basic cancel"))
    }

    async fn next_delivery(&mut self) -> Result<Option<InboundDelivery>, EmissaryError> {
        let Some(consumer) = self.consumer.as_mut() else {
            return std::future::pending().await;
        };
        match consumer.next().await {
            None => Ok(None),
            Some(Err(error)) => Err(broker_error("consuming")(error)),
            Some(Ok(delivery)) => Ok(Some(InboundDelivery {
                tag: delivery.delivery_tag,
                exchange: delivery.exchange.as_str().to_owned(),
                routing_key: delivery.routing_key.as_str().to_owned(),
                payload: delivery.data,
            })),
        }
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), EmissaryError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into());
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(broker_error("basic publish"))
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), EmissaryError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(broker_error("basic ack"))
    }

    async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), EmissaryError> {
        self.channel
            .basic_reject(tag, BasicRejectOptions { requeue })
            .await
            .map_err(broker_error("basic reject"))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&mut self) -> Result<(), EmissaryError> {
        self.consumer = None;
        let channel = self
            .channel
            .close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT)
            .await
            .map_err(broker_error("channel close"));
        let connection = self
            .connection
            .close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT)
            .await
            .map_err(broker_error("connection close"));
        channel.and(connection)
    }
}
