//! Configuration types for the bridge.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use super::TopologyDescriptor;
use crate::error::BridgeError;
use crate::messaging::ReconnectPolicy;
use crate::{
    DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_CONFIRM_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_PREFETCH, DEFAULT_TOPOLOGY_LIMIT,
};

/// Acknowledgment mode for consumed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Broker considers a message delivered once sent (at-most-once)
    Auto,
    /// Message is acked after the handler succeeds (at-least-once)
    Manual,
}

impl FromStr for AckMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "manual" => Ok(AckMode::Manual),
            other => Err(BridgeError::Config(format!("unknown ack mode: {other}"))),
        }
    }
}

/// Consumer behavior options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerOptions {
    /// Acknowledgment mode
    pub ack_mode: AckMode,

    /// Unacknowledged messages the broker may push ahead (manual mode only)
    pub prefetch: u16,

    /// Handler invocations allowed in flight; 1 keeps deliveries ordered
    pub concurrency: usize,

    /// Requeue a message whose handler failed (manual mode only)
    pub requeue_on_error: bool,

    /// Consumer tag; generated when absent
    pub consumer_tag: Option<String>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Manual,
            prefetch: DEFAULT_PREFETCH,
            concurrency: 1,
            requeue_on_error: false,
            consumer_tag: None,
        }
    }
}

impl ConsumerOptions {
    /// No-ack consumption, matching fire-and-forget subscribers.
    pub fn auto_ack() -> Self {
        Self {
            ack_mode: AckMode::Auto,
            ..Default::default()
        }
    }

    /// Set the prefetch count.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set handler concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the consumer tag.
    pub fn with_consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_string());
        self
    }
}

/// Global bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Broker URL (scheme, credentials, host, port, vhost)
    pub broker_url: String,

    /// Client-provided connection name
    pub connection_name: String,

    /// Topology used by the task publisher
    pub outbound: TopologyDescriptor,

    /// Topology used by the event consumer
    pub inbound: TopologyDescriptor,

    /// Queue consumed by the service binary
    pub inbound_queue: String,

    /// Consumer behavior
    pub consumer: ConsumerOptions,

    /// Deadline for publisher confirms
    pub confirm_timeout: Duration,

    /// Bound on one connect attempt
    pub connect_timeout: Duration,

    /// Bound on each close step during shutdown
    pub close_timeout: Duration,

    /// Backoff applied by automatic reconnection
    pub reconnect: ReconnectPolicy,

    /// Declared topologies remembered for re-declaration after a reconnect
    pub topology_limit: usize,

    /// HTTP ingress port
    pub http_port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            connection_name: "task-bridge".to_string(),
            outbound: TopologyDescriptor::outbound(),
            inbound: TopologyDescriptor::inbound(),
            inbound_queue: "inbound-events.q".to_string(),
            consumer: ConsumerOptions::default(),
            confirm_timeout: Duration::from_millis(DEFAULT_CONFIRM_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
            reconnect: ReconnectPolicy::default(),
            topology_limit: DEFAULT_TOPOLOGY_LIMIT,
            http_port: 3020,
        }
    }
}

/// Parse `key` from the environment. An unset variable yields `None`; a set
/// but unparsable one is logged and also yields `None`.
fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring unparsable setting, using default");
            None
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    ///
    /// A missing `RABBITMQ_URL` yields an empty URL; it is rejected when the
    /// connection is initialized rather than replaced by a default host.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let defaults_reconnect = defaults.reconnect.clone();

        let outbound = TopologyDescriptor::direct(
            std::env::var("BRIDGE_OUTBOUND_EXCHANGE").unwrap_or(defaults.outbound.exchange),
            std::env::var("BRIDGE_OUTBOUND_ROUTING_KEY").unwrap_or(defaults.outbound.routing_key),
        );
        let inbound = TopologyDescriptor::direct(
            std::env::var("BRIDGE_INBOUND_EXCHANGE").unwrap_or(defaults.inbound.exchange),
            std::env::var("BRIDGE_INBOUND_ROUTING_KEY").unwrap_or(defaults.inbound.routing_key),
        );

        Self {
            broker_url: std::env::var("RABBITMQ_URL").unwrap_or_default(),
            connection_name: std::env::var("BRIDGE_CONNECTION_NAME")
                .unwrap_or(defaults.connection_name),
            outbound,
            inbound,
            inbound_queue: std::env::var("BRIDGE_INBOUND_QUEUE").unwrap_or(defaults.inbound_queue),
            consumer: ConsumerOptions {
                ack_mode: env_parse("BRIDGE_ACK_MODE").unwrap_or(AckMode::Manual),
                prefetch: env_parse("BRIDGE_PREFETCH").unwrap_or(DEFAULT_PREFETCH),
                concurrency: env_parse::<usize>("BRIDGE_CONSUMER_CONCURRENCY")
                    .unwrap_or(1)
                    .max(1),
                requeue_on_error: env_parse("BRIDGE_REQUEUE_ON_ERROR").unwrap_or(false),
                consumer_tag: None,
            },
            confirm_timeout: env_parse("BRIDGE_CONFIRM_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.confirm_timeout),
            connect_timeout: env_parse("BRIDGE_CONNECT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            close_timeout: env_parse("BRIDGE_CLOSE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.close_timeout),
            reconnect: ReconnectPolicy {
                base_delay_ms: env_parse("BRIDGE_RECONNECT_BASE_MS")
                    .unwrap_or(defaults_reconnect.base_delay_ms),
                max_delay_ms: env_parse("BRIDGE_RECONNECT_MAX_MS")
                    .unwrap_or(defaults_reconnect.max_delay_ms),
                max_attempts: env_parse("BRIDGE_RECONNECT_MAX_ATTEMPTS"),
                jitter: defaults_reconnect.jitter,
            },
            topology_limit: env_parse("BRIDGE_TOPOLOGY_LIMIT").unwrap_or(defaults.topology_limit),
            http_port: env_parse("PORT").unwrap_or(defaults.http_port),
        }
    }

    /// Set the broker URL.
    pub fn with_broker_url(mut self, url: &str) -> Self {
        self.broker_url = url.to_string();
        self
    }

    /// Check that the broker URL is usable before any connect attempt.
    pub fn validate_url(&self) -> Result<Url, BridgeError> {
        validate_broker_url(&self.broker_url)
    }
}

/// Parse `raw` as an `amqp://` or `amqps://` URL.
pub fn validate_broker_url(raw: &str) -> Result<Url, BridgeError> {
    if raw.trim().is_empty() {
        return Err(BridgeError::Connection("broker URL is not configured".to_string()));
    }

    let url = Url::parse(raw)
        .map_err(|e| BridgeError::Connection(format!("invalid broker URL: {e}")))?;

    match url.scheme() {
        "amqp" | "amqps" => Ok(url),
        other => Err(BridgeError::Connection(format!(
            "unsupported broker URL scheme: {other}"
        ))),
    }
}
