//! Error types for the bridge.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by the broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Broker could not be reached
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Credentials or vhost access rejected
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// Re-declaration with conflicting parameters
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Referenced exchange or queue does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection or channel is closed
    #[error("connection closed")]
    Closed,

    /// Any other protocol-level failure
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors surfaced by the bridge to its callers.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Broker unreachable, credentials rejected or URL unusable
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// Operation attempted before a successful `initialize()`
    #[error("broker connection not initialized")]
    NotInitialized,

    /// Channel write failed after topology was declared
    #[error("publish failed: {0}")]
    Publish(#[source] TransportError),

    /// Operation interrupted by shutdown or connection loss
    #[error("broker connection closed")]
    ConnectionClosed,

    /// Broker did not confirm a publish in time
    #[error("publish not confirmed within {0:?}")]
    PublishTimeout(Duration),

    /// Exchange/queue/binding declaration rejected
    #[error("topology declaration failed: {0}")]
    Topology(#[source] TransportError),

    /// Broker refused to start a consumer
    #[error("consume failed: {0}")]
    Consume(#[source] TransportError),

    /// Caller supplied an unusable task or queue
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Envelope body could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration value could not be parsed
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Map a failure raised while declaring topology.
    pub(crate) fn from_declare(err: TransportError) -> Self {
        match err {
            TransportError::Closed => BridgeError::ConnectionClosed,
            other => BridgeError::Topology(other),
        }
    }

    /// Map a failure raised while writing to the channel.
    pub(crate) fn from_publish(err: TransportError) -> Self {
        match err {
            TransportError::Closed => BridgeError::ConnectionClosed,
            other => BridgeError::Publish(other),
        }
    }

    /// Map a failure raised while starting a consumer.
    pub(crate) fn from_consume(err: TransportError) -> Self {
        match err {
            TransportError::Closed => BridgeError::ConnectionClosed,
            other => BridgeError::Consume(other),
        }
    }

    /// Whether retrying after a reconnect could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection(_)
                | BridgeError::ConnectionClosed
                | BridgeError::PublishTimeout(_)
                | BridgeError::Publish(_)
        )
    }
}
