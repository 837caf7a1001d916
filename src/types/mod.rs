//! Core types for the task bridge.

mod config;
mod envelope;
mod topology;

pub use config::{validate_broker_url, AckMode, BridgeConfig, ConsumerOptions};
pub use envelope::{
    TaskBody, TaskDescriptor, TaskEnvelope, CONTENT_ENCODING_UTF8, CONTENT_TYPE_JSON, HEADER_ID,
    HEADER_TASK,
};
pub use topology::{
    ExchangeKind, ExchangeSpec, QueueSpec, TopologyDescriptor, INBOUND_EXCHANGE,
    INBOUND_ROUTING_KEY, OUTBOUND_EXCHANGE, OUTBOUND_ROUTING_KEY,
};
