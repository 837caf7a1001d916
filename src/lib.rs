//! Task Bridge Library
//!
//! Bridges two task-processing systems over an AMQP broker: tasks are
//! published to an outbound exchange and completion events are consumed from
//! an inbound exchange, both through one managed connection.

pub mod api;
pub mod error;
pub mod messaging;
pub mod types;

pub use error::{BridgeError, TransportError};
pub use messaging::{
    BrokerConnectionManager, ConnectionState, EventConsumer, PublishReceipt, Subscription,
    TaskPublisher,
};
pub use types::{AckMode, BridgeConfig, ConsumerOptions, TaskDescriptor, TaskEnvelope, TopologyDescriptor};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::*;
    pub use crate::messaging::*;
    pub use crate::types::*;
}

/// Default basic.qos prefetch for manual-ack consumers
pub const DEFAULT_PREFETCH: u16 = 10;

/// Default deadline for a publisher confirm (5s)
pub const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 5_000;

/// Default bound on one connection attempt (10s)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default bound on each close step during shutdown (5s)
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;

/// Default number of declared topologies remembered for re-declaration
pub const DEFAULT_TOPOLOGY_LIMIT: usize = 256;
