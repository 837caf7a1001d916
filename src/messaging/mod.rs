//! # Messaging
//!
//! Broker plumbing for the task bridge.
//!
//! ## Components
//! - `BrokerConnectionManager`: one connection, its channels, lifecycle and reconnects
//! - `TaskPublisher`: sends task envelopes to the outbound exchange
//! - `EventConsumer`: streams envelopes from the inbound exchange to a handler
//! - `AmqpConnector` (lapin) and `MemoryBroker` (in-process) behind the transport traits

pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod reconnect;
pub mod topology;
pub mod transport;

pub use amqp::AmqpConnector;
pub use connection::{BrokerConnectionManager, ConnectionState, Lifecycle};
pub use consumer::{EventConsumer, Subscription, SubscriptionStats};
pub use memory::MemoryBroker;
pub use publisher::{PublishReceipt, TaskPublisher};
pub use reconnect::ReconnectPolicy;
pub use transport::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, Delivery, PublishConfirmation,
};
