//! Task publisher.
//!
//! Publishes task envelopes to the outbound exchange. Every publish first
//! declares the exchange, the destination queue and their binding, so the
//! topology heals itself after reconnects or broker restarts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument};

use super::connection::BrokerConnectionManager;
use super::transport::{BrokerChannel, PendingConfirm, PublishConfirmation};
use crate::error::{BridgeError, TransportError};
use crate::types::{BridgeConfig, TaskDescriptor, TaskEnvelope, TopologyDescriptor};
use crate::DEFAULT_CONFIRM_TIMEOUT_MS;

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    /// Correlation id stamped on the envelope
    pub id: String,
    /// Remote task name
    pub task: String,
    /// Destination queue
    pub queue: String,
    /// Whether the broker acknowledged the message
    pub confirmed: bool,
    /// When the envelope was written to the channel
    pub published_at: DateTime<Utc>,
}

/// Publishes tasks through a shared connection manager.
#[derive(Clone)]
pub struct TaskPublisher {
    manager: Arc<BrokerConnectionManager>,
    topology: TopologyDescriptor,
    confirm_timeout: Duration,
}

impl TaskPublisher {
    /// Create a publisher for `topology`.
    pub fn new(manager: Arc<BrokerConnectionManager>, topology: TopologyDescriptor) -> Self {
        Self {
            manager,
            topology,
            confirm_timeout: Duration::from_millis(DEFAULT_CONFIRM_TIMEOUT_MS),
        }
    }

    /// Create a publisher using the outbound topology and timeouts of `config`.
    pub fn from_config(manager: Arc<BrokerConnectionManager>, config: &BridgeConfig) -> Self {
        Self::new(manager, config.outbound.clone()).with_confirm_timeout(config.confirm_timeout)
    }

    /// Set the deadline for broker confirmation.
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn topology(&self) -> &TopologyDescriptor {
        &self.topology
    }

    /// Publish `task` to `queue` without waiting for the broker.
    ///
    /// Once accepted the message is persistent on a durable queue, but the
    /// caller gets no proof of acceptance: delivery is at-most-once from the
    /// publisher's side. Use [`publish_and_confirm`] when that matters.
    ///
    /// [`publish_and_confirm`]: Self::publish_and_confirm
    #[instrument(skip(self, task), fields(task = %task.task_name))]
    pub async fn publish(
        &self,
        queue: &str,
        task: &TaskDescriptor,
    ) -> Result<PublishReceipt, BridgeError> {
        validate(queue, task)?;
        let channel = self.manager.get_channel().await?;
        let (receipt, _unconfirmed) = self.send(channel.as_ref(), queue, task).await?;
        Ok(receipt)
    }

    /// Publish `task` to `queue` on a confirm-mode channel and wait for the
    /// broker acknowledgment.
    #[instrument(skip(self, task), fields(task = %task.task_name))]
    pub async fn publish_and_confirm(
        &self,
        queue: &str,
        task: &TaskDescriptor,
    ) -> Result<PublishReceipt, BridgeError> {
        validate(queue, task)?;
        let channel = self.manager.confirm_channel().await?;
        let closed = self.manager.closed();
        let (mut receipt, pending) = self.send(channel.as_ref(), queue, task).await?;

        tokio::select! {
            outcome = tokio::time::timeout(self.confirm_timeout, pending) => match outcome {
                Err(_) => {
                    error!(id = %receipt.id, timeout = ?self.confirm_timeout, "publish not confirmed in time");
                    Err(BridgeError::PublishTimeout(self.confirm_timeout))
                }
                Ok(Ok(PublishConfirmation::Ack)) => {
                    receipt.confirmed = true;
                    Ok(receipt)
                }
                Ok(Ok(PublishConfirmation::NotRequested)) => Ok(receipt),
                Ok(Ok(PublishConfirmation::Nack)) => {
                    error!(id = %receipt.id, "broker rejected message");
                    Err(BridgeError::Publish(TransportError::Protocol(
                        "message nacked by broker".to_string(),
                    )))
                }
                Ok(Err(e)) => Err(BridgeError::from_publish(e)),
            },
            _ = closed => Err(BridgeError::ConnectionClosed),
        }
    }

    async fn send(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        task: &TaskDescriptor,
    ) -> Result<(PublishReceipt, PendingConfirm), BridgeError> {
        self.manager
            .declare_topology(channel, &self.topology, queue)
            .await?;

        let envelope = TaskEnvelope::for_task(task)?;
        let pending = channel
            .publish(&self.topology.exchange, &self.topology.routing_key, &envelope)
            .await
            .map_err(|e| {
                error!(exchange = %self.topology.exchange, queue, error = %e, "failed to publish task");
                BridgeError::from_publish(e)
            })?;

        let receipt = PublishReceipt {
            id: envelope.id().unwrap_or_default().to_string(),
            task: task.task_name.clone(),
            queue: queue.to_string(),
            confirmed: false,
            published_at: Utc::now(),
        };
        info!(
            exchange = %self.topology.exchange,
            routing_key = %self.topology.routing_key,
            queue,
            id = %receipt.id,
            "task published"
        );

        Ok((receipt, pending))
    }
}

fn validate(queue: &str, task: &TaskDescriptor) -> Result<(), BridgeError> {
    if queue.trim().is_empty() {
        return Err(BridgeError::InvalidTask("queue name must not be empty".to_string()));
    }
    if task.task_name.trim().is_empty() {
        return Err(BridgeError::InvalidTask("task name must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::ReconnectPolicy;
    use serde_json::json;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default().with_broker_url("amqp://localhost");
        // Keep the supervisor asleep so loss stays observable
        config.reconnect = ReconnectPolicy::fixed(Duration::from_secs(60), 1);
        config
    }

    async fn setup() -> (MemoryBroker, Arc<BrokerConnectionManager>, TaskPublisher) {
        let broker = MemoryBroker::new();
        let manager = BrokerConnectionManager::new(Arc::new(broker.clone()), &config());
        manager.initialize().await.unwrap();
        let publisher = TaskPublisher::from_config(manager.clone(), &config());
        (broker, manager, publisher)
    }

    #[tokio::test]
    async fn test_publish_declares_topology_and_enqueues() {
        let (broker, _manager, publisher) = setup().await;
        let task = TaskDescriptor::new("issue_create_task").arg("Petr").arg(30);

        let receipt = publisher.publish("tasks.q", &task).await.unwrap();

        assert_eq!(receipt.task, "issue_create_task");
        assert_eq!(receipt.queue, "tasks.q");
        assert!(!receipt.confirmed);
        assert!(broker.has_binding("outbound-tasks", "task.dispatch", "tasks.q"));
        assert_eq!(broker.queue_depth("tasks.q"), Some(1));
    }

    #[tokio::test]
    async fn test_publish_requires_initialize() {
        let broker = MemoryBroker::new();
        let manager = BrokerConnectionManager::new(Arc::new(broker), &config());
        let publisher = TaskPublisher::new(manager, TopologyDescriptor::outbound());

        let err = publisher.publish("tasks.q", &TaskDescriptor::new("t")).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotInitialized));
    }

    #[tokio::test]
    async fn test_invalid_inputs_rejected() {
        let (broker, _manager, publisher) = setup().await;

        let err = publisher.publish(" ", &TaskDescriptor::new("t")).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTask(_)));
        let err = publisher.publish("q", &TaskDescriptor::new("")).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTask(_)));
        assert_eq!(broker.queue_depth("q"), None);
    }

    #[tokio::test]
    async fn test_publish_and_confirm() {
        let (broker, _manager, publisher) = setup().await;
        let task = TaskDescriptor::new("sync").kwarg("force", json!(true));

        let receipt = publisher.publish_and_confirm("tasks.q", &task).await.unwrap();

        assert!(receipt.confirmed);
        assert_eq!(broker.queue_depth("tasks.q"), Some(1));
    }

    #[tokio::test]
    async fn test_confirm_deadline() {
        let (broker, _manager, publisher) = setup().await;
        let publisher = publisher.with_confirm_timeout(Duration::from_millis(50));
        broker.withhold_confirms(true);

        let err = publisher
            .publish_and_confirm("tasks.q", &TaskDescriptor::new("slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::PublishTimeout(_)));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_confirm_wait() {
        let (broker, manager, publisher) = setup().await;
        let publisher = publisher.with_confirm_timeout(Duration::from_secs(30));
        broker.withhold_confirms(true);

        let pending = tokio::spawn(async move {
            publisher
                .publish_and_confirm("tasks.q", &TaskDescriptor::new("stuck"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.shutdown().await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("confirm wait hung after shutdown")
            .unwrap();
        assert!(matches!(outcome, Err(BridgeError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connection_loss_surfaces_error() {
        let (broker, _manager, publisher) = setup().await;
        broker.sever_connections();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            publisher.publish("tasks.q", &TaskDescriptor::new("lost")),
        )
        .await
        .expect("publish hung after connection loss");
        assert!(matches!(
            outcome,
            Err(BridgeError::ConnectionClosed) | Err(BridgeError::Publish(_))
        ));
    }

    #[tokio::test]
    async fn test_conflicting_topology_then_recovery() {
        let (broker, manager, publisher) = setup().await;
        publisher.publish("tasks.q", &TaskDescriptor::new("first")).await.unwrap();

        let transient = TaskPublisher::new(
            manager.clone(),
            TopologyDescriptor::outbound().with_durability(false),
        );
        let err = transient
            .publish("tasks.q", &TaskDescriptor::new("second"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Topology(_)));

        publisher.publish("tasks.q", &TaskDescriptor::new("third")).await.unwrap();
        assert_eq!(broker.queue_depth("tasks.q"), Some(2));
    }
}
