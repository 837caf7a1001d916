//! Exchange/queue topology descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exchange name used for outbound task dispatch.
pub const OUTBOUND_EXCHANGE: &str = "outbound-tasks";

/// Routing key used for outbound task dispatch.
pub const OUTBOUND_ROUTING_KEY: &str = "task.dispatch";

/// Exchange name used for inbound event notification.
pub const INBOUND_EXCHANGE: &str = "inbound-events";

/// Routing key used for inbound event notification.
pub const INBOUND_ROUTING_KEY: &str = "event.notify";

/// Kind of broker exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes on exact routing key match
    Direct,
    /// Routes to every bound queue, ignoring the routing key
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// Declaration parameters of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Declaration parameters of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

/// Static description of one side of the bridge.
///
/// A descriptor names the exchange, its kind, the routing key queues are bound
/// under, and the durability flags applied when declaring. The queue name is
/// supplied per operation, so one descriptor serves any number of queues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    /// Exchange name
    pub exchange: String,

    /// Exchange kind
    pub kind: ExchangeKind,

    /// Routing key used both for binding and publishing
    pub routing_key: String,

    /// Whether the exchange survives broker restart
    pub durable_exchange: bool,

    /// Whether declared queues survive broker restart
    pub durable_queue: bool,
}

impl TopologyDescriptor {
    /// Create a durable direct-exchange descriptor.
    pub fn direct(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            kind: ExchangeKind::Direct,
            routing_key: routing_key.into(),
            durable_exchange: true,
            durable_queue: true,
        }
    }

    /// Descriptor for the outbound task side.
    pub fn outbound() -> Self {
        Self::direct(OUTBOUND_EXCHANGE, OUTBOUND_ROUTING_KEY)
    }

    /// Descriptor for the inbound event side.
    pub fn inbound() -> Self {
        Self::direct(INBOUND_EXCHANGE, INBOUND_ROUTING_KEY)
    }

    /// Override durability of both exchange and queue.
    pub fn with_durability(mut self, durable: bool) -> Self {
        self.durable_exchange = durable;
        self.durable_queue = durable;
        self
    }

    /// Exchange declaration parameters.
    pub fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.exchange.clone(),
            kind: self.kind,
            durable: self.durable_exchange,
        }
    }

    /// Queue declaration parameters for `queue`.
    pub fn queue_spec(&self, queue: &str) -> QueueSpec {
        QueueSpec {
            name: queue.to_string(),
            durable: self.durable_queue,
        }
    }
}
