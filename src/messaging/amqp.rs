//! RabbitMQ transport for the bridge
//!
//! Implements the broker seam over lapin (AMQP 0-9-1).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind as LapinExchangeKind,
};
use tracing::{debug, info};

use super::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, ConnectionErrorHandler,
    Delivery, DeliveryStream, PendingConfirm, PublishConfirmation,
};
use crate::error::TransportError;
use crate::types::{ExchangeKind, ExchangeSpec, QueueSpec, TaskEnvelope};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Classify a lapin error.
pub(crate) fn map_lapin_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::IOError(e) => TransportError::Unreachable(e.to_string()),
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::Closed
        }
        lapin::Error::ProtocolError(amqp) => {
            let message = amqp.get_message().as_str().to_string();
            match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    TransportError::PreconditionFailed(message)
                }
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
                    TransportError::AccessRefused(message)
                }
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => TransportError::NotFound(message),
                _ => TransportError::Protocol(message),
            }
        }
        other => TransportError::Protocol(other.to_string()),
    }
}

/// Opens lapin connections.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(connection_name: &str) -> Self {
        Self {
            connection_name: connection_name.to_string(),
        }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let connection = Connection::connect(url, properties)
            .await
            .map_err(map_lapin_error)?;

        info!(connection_name = %self.connection_name, "AMQP connection opened");

        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

/// A lapin connection.
pub struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self.inner.create_channel().await.map_err(map_lapin_error)?;
        debug!(channel_id = channel.id(), "AMQP channel created");
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    fn on_error(&self, mut handler: ConnectionErrorHandler) {
        self.inner.on_error(move |err| handler(map_lapin_error(err)));
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "bridge shutdown")
            .await
            .map_err(map_lapin_error)
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    inner: Channel,
}

fn to_lapin_kind(kind: ExchangeKind) -> LapinExchangeKind {
    match kind {
        ExchangeKind::Direct => LapinExchangeKind::Direct,
        ExchangeKind::Fanout => LapinExchangeKind::Fanout,
    }
}

fn header_table(envelope: &TaskEnvelope) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in envelope.headers() {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn header_map(table: Option<&FieldTable>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    let Some(table) = table else {
        return headers;
    };

    for (key, value) in table.inner() {
        let text = match value {
            AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
            AMQPValue::ShortString(s) => s.as_str().to_string(),
            // Non-string headers are not part of the envelope contract
            _ => continue,
        };
        headers.insert(key.as_str().to_string(), text);
    }
    headers
}

fn into_delivery(delivery: lapin::message::Delivery, no_ack: bool) -> Delivery {
    let properties = &delivery.properties;
    let envelope = TaskEnvelope::from_parts(
        properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        properties
            .content_encoding()
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        header_map(properties.headers().as_ref()),
        delivery.data.clone(),
    );

    if no_ack {
        Delivery::unacked(envelope, delivery.redelivered)
    } else {
        Delivery::with_acker(
            envelope,
            delivery.redelivered,
            Box::new(AmqpAcker {
                inner: delivery.acker.clone(),
            }),
        )
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError> {
        self.inner
            .exchange_declare(
                &exchange.name,
                to_lapin_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TransportError> {
        self.inner
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(map_lapin_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn enable_confirms(&self) -> Result<(), TransportError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &TaskEnvelope,
    ) -> Result<PendingConfirm, TransportError> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_content_type(ShortString::from(envelope.content_type().to_string()))
            .with_content_encoding(ShortString::from(envelope.content_encoding().to_string()))
            .with_headers(header_table(envelope));
        if let Some(id) = envelope.id() {
            properties = properties.with_message_id(ShortString::from(id.to_string()));
        }

        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                envelope.body(),
                properties,
            )
            .await
            .map_err(map_lapin_error)?;

        Ok(Box::pin(async move {
            match confirm.await.map_err(map_lapin_error)? {
                Confirmation::Ack(_) => Ok(PublishConfirmation::Ack),
                Confirmation::Nack(_) => Ok(PublishConfirmation::Nack),
                Confirmation::NotRequested => Ok(PublishConfirmation::NotRequested),
            }
        }))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;

        Ok(consumer
            .map(move |delivery| {
                delivery
                    .map(|d| into_delivery(d, no_ack))
                    .map_err(map_lapin_error)
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "bridge shutdown")
            .await
            .map_err(map_lapin_error)
    }
}

struct AmqpAcker {
    inner: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(map_lapin_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(map_lapin_error)
    }
}
