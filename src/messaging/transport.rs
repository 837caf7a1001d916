//! Broker client seam.
//!
//! The bridge talks to the broker through these traits so the connection
//! manager, publisher and consumer are independent of the client library.
//! [`super::amqp`] implements them over lapin, [`super::memory`] in process.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::TransportError;
use crate::types::{ExchangeSpec, QueueSpec, TaskEnvelope};

/// Callback invoked when a connection is lost without an explicit close.
pub type ConnectionErrorHandler = Box<dyn FnMut(TransportError) + Send + 'static>;

/// Outcome of a publish on a channel in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirmation {
    /// Broker accepted the message
    Ack,
    /// Broker refused the message
    Nack,
    /// Channel is not in confirm mode
    NotRequested,
}

/// Future resolving once the broker confirms (or refuses) a publish.
pub type PendingConfirm = BoxFuture<'static, Result<PublishConfirmation, TransportError>>;

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// One live session with the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Derive a new channel.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Register a callback fired when the connection drops.
    fn on_error(&self, handler: ConnectionErrorHandler);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A multiplexed logical session over a connection.
///
/// Implementations serialize frame writes internally, so one channel may be
/// shared by concurrent publishers.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Put the channel into publisher-confirm mode.
    async fn enable_confirms(&self) -> Result<(), TransportError>;

    /// Write `envelope` to `exchange`. The returned future resolves on broker
    /// confirmation and can be dropped for fire-and-forget publishing.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &TaskEnvelope,
    ) -> Result<PendingConfirm, TransportError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub envelope: TaskEnvelope,
    pub redelivered: bool,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// A delivery that must be settled through `acker`.
    pub fn with_acker(envelope: TaskEnvelope, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            redelivered,
            acker: Some(acker),
        }
    }

    /// A delivery consumed in no-ack mode.
    pub fn unacked(envelope: TaskEnvelope, redelivered: bool) -> Self {
        Self {
            envelope,
            redelivered,
            acker: None,
        }
    }

    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    /// Acknowledge; a no-op for no-ack deliveries.
    pub async fn ack(&self) -> Result<(), TransportError> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Reject; a no-op for no-ack deliveries.
    pub async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        match &self.acker {
            Some(acker) => acker.nack(requeue).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .field("requires_ack", &self.requires_ack())
            .finish()
    }
}
