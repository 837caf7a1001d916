//! Topology declaration.

use crate::error::TransportError;
use crate::messaging::transport::BrokerChannel;
use crate::types::TopologyDescriptor;

/// A queue declared against a descriptor, remembered for re-declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeclaredTopology {
    pub descriptor: TopologyDescriptor,
    pub queue: String,
}

/// Declare the exchange and `queue`, then bind them under the routing key.
///
/// Each step is idempotent on the broker; conflicting parameters fail with
/// [`TransportError::PreconditionFailed`].
pub async fn declare(
    channel: &dyn BrokerChannel,
    descriptor: &TopologyDescriptor,
    queue: &str,
) -> Result<(), TransportError> {
    channel.declare_exchange(&descriptor.exchange_spec()).await?;
    channel.declare_queue(&descriptor.queue_spec(queue)).await?;
    channel
        .bind_queue(queue, &descriptor.exchange, &descriptor.routing_key)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::transport::BrokerConnector;
    use crate::types::ExchangeKind;

    #[tokio::test]
    async fn test_declare_twice_is_noop() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://memory").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let descriptor = TopologyDescriptor::outbound();

        declare(channel.as_ref(), &descriptor, "tasks.q").await.unwrap();
        declare(channel.as_ref(), &descriptor, "tasks.q").await.unwrap();

        let exchange = broker.exchange("outbound-tasks").unwrap();
        assert_eq!(exchange.kind, ExchangeKind::Direct);
        assert!(exchange.durable);
        assert!(broker.queue("tasks.q").unwrap().durable);
        assert!(broker.has_binding("outbound-tasks", "task.dispatch", "tasks.q"));
    }

    #[tokio::test]
    async fn test_conflicting_queue_durability() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://memory").await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        declare(channel.as_ref(), &TopologyDescriptor::inbound(), "events.q")
            .await
            .unwrap();

        let transient = TopologyDescriptor::direct("other-events", "event.notify").with_durability(false);
        let err = declare(channel.as_ref(), &transient, "events.q").await.unwrap_err();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));
    }
}
