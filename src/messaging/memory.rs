//! In-process broker.
//!
//! Implements the broker seam with the AMQP behaviors the bridge relies on:
//! idempotent declarations that fail with PRECONDITION_FAILED on conflicting
//! parameters (closing the channel, as a real broker does), direct and fanout
//! routing, round-robin delivery, and requeue of unacknowledged messages when
//! their channel closes. Test hooks simulate unreachable brokers, rejected
//! credentials, withheld confirms and abrupt connection loss.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, ConnectionErrorHandler,
    Delivery, DeliveryStream, PendingConfirm, PublishConfirmation,
};
use crate::error::TransportError;
use crate::types::{ExchangeKind, ExchangeSpec, QueueSpec, TaskEnvelope};

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Debug, Clone)]
struct Message {
    envelope: TaskEnvelope,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct MemoryConsumer {
    tag: String,
    channel: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    consumers: Vec<MemoryConsumer>,
    cursor: usize,
}

struct Unacked {
    channel: u64,
    queue: String,
    message: Message,
}

struct ChannelEntry {
    connection: u64,
    confirms: bool,
    prefetch: u16,
    in_flight: u32,
}

#[derive(Default)]
struct ConnectionEntry {
    error_handlers: Vec<ConnectionErrorHandler>,
}

struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    unacked: HashMap<u64, Unacked>,
    next_id: u64,
    connect_attempts: usize,
    reachable: bool,
    reject_credentials: bool,
    withhold_confirms: bool,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            unacked: HashMap::new(),
            next_id: 1,
            connect_attempts: 0,
            reachable: true,
            reject_credentials: false,
            withhold_confirms: false,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_open(&self, channel: u64) -> Result<(), TransportError> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

/// Push ready messages of `queue_name` to consumers with spare prefetch.
fn dispatch(shared: &Shared, state: &mut BrokerState, queue_name: &str) {
    loop {
        let tag = state.next_id;
        let (message, channel, no_ack, tx) = {
            let channels = &state.channels;
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let picked = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&index| {
                    let consumer = &queue.consumers[index];
                    consumer.no_ack
                        || channels.get(&consumer.channel).map_or(false, |c| {
                            c.prefetch == 0 || c.in_flight < u32::from(c.prefetch)
                        })
                });
            let Some(index) = picked else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            queue.cursor = index + 1;
            let consumer = &queue.consumers[index];
            (message, consumer.channel, consumer.no_ack, consumer.tx.clone())
        };

        let delivery = if no_ack {
            Delivery::unacked(message.envelope.clone(), message.redelivered)
        } else {
            state.next_id += 1;
            Delivery::with_acker(
                message.envelope.clone(),
                message.redelivered,
                Box::new(MemoryAcker {
                    shared: Arc::downgrade(shared),
                    tag,
                }),
            )
        };

        if tx.send(Ok(delivery)).is_err() {
            // Receiver dropped without cancelling
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.consumers.retain(|c| !c.tx.same_channel(&tx));
                queue.ready.push_front(message);
            }
            continue;
        }

        if !no_ack {
            if let Some(entry) = state.channels.get_mut(&channel) {
                entry.in_flight += 1;
            }
            state.unacked.insert(
                tag,
                Unacked {
                    channel,
                    queue: queue_name.to_string(),
                    message,
                },
            );
        }
    }
}

/// Close a channel: drop its consumers and requeue what it left unacked.
fn close_channel(shared: &Shared, state: &mut BrokerState, channel: u64) {
    if state.channels.remove(&channel).is_none() {
        return;
    }

    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.channel != channel);
    }

    let mut orphaned: Vec<(u64, Unacked)> = Vec::new();
    let tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, u)| u.channel == channel)
        .map(|(tag, _)| *tag)
        .collect();
    for tag in tags {
        if let Some(unacked) = state.unacked.remove(&tag) {
            orphaned.push((tag, unacked));
        }
    }
    // Newest first so push_front restores delivery order
    orphaned.sort_by(|a, b| b.0.cmp(&a.0));

    let mut touched = Vec::new();
    for (_, unacked) in orphaned {
        if let Some(queue) = state.queues.get_mut(&unacked.queue) {
            queue.ready.push_front(Message {
                envelope: unacked.message.envelope,
                redelivered: true,
            });
        }
        if !touched.contains(&unacked.queue) {
            touched.push(unacked.queue);
        }
    }
    for queue in touched {
        dispatch(shared, state, &queue);
    }

    debug!(channel, "memory channel closed");
}

fn close_connection(
    shared: &Shared,
    state: &mut BrokerState,
    connection: u64,
) -> Vec<ConnectionErrorHandler> {
    let channels: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, c)| c.connection == connection)
        .map(|(id, _)| *id)
        .collect();
    for channel in channels {
        close_channel(shared, state, channel);
    }

    state
        .connections
        .remove(&connection)
        .map(|entry| entry.error_handlers)
        .unwrap_or_default()
}

/// An in-process broker. Clones share the same broker state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Shared,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    /// Number of connect attempts seen, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.shared.lock().connect_attempts
    }

    /// Make subsequent connects fail as unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
    }

    /// Make subsequent connects fail with access refused.
    pub fn reject_credentials(&self, reject: bool) {
        self.shared.lock().reject_credentials = reject;
    }

    /// Hold back publisher confirms so confirm waits never resolve.
    pub fn withhold_confirms(&self, withhold: bool) {
        self.shared.lock().withhold_confirms = withhold;
    }

    /// Drop every open connection as if the network failed.
    pub fn sever_connections(&self) {
        let handlers = {
            let mut state = self.shared.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            let mut handlers = Vec::new();
            for id in ids {
                handlers.extend(close_connection(&self.shared, &mut state, id));
            }
            handlers
        };

        for mut handler in handlers {
            handler(TransportError::Unreachable("connection reset by peer".to_string()));
        }
    }

    /// Cancel every consumer of `queue` from the broker side, as happens
    /// when the queue is deleted. Their channels stay open.
    pub fn cancel_consumers(&self, queue: &str) -> usize {
        let mut state = self.shared.lock();
        state.queues.get_mut(queue).map_or(0, |q| {
            let cancelled = q.consumers.len();
            q.consumers.clear();
            cancelled
        })
    }

    /// Simulate a broker restart: connections drop, transient exchanges and
    /// queues vanish along with their bindings, durable ones survive.
    pub fn restart(&self) {
        self.sever_connections();

        let mut state = self.shared.lock();
        state.exchanges.retain(|_, e| e.durable);
        state.queues.retain(|_, q| q.spec.durable);
        let BrokerState {
            bindings,
            exchanges,
            queues,
            ..
        } = &mut *state;
        bindings.retain(|b| exchanges.contains_key(&b.exchange) && queues.contains_key(&b.queue));
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.shared.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.shared.lock().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn has_binding(&self, exchange: &str, routing_key: &str, queue: &str) -> bool {
        self.shared.lock().bindings.iter().any(|b| {
            b.exchange == exchange && b.routing_key == routing_key && b.queue == queue
        })
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.shared.lock().channels.len()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let mut state = self.shared.lock();
        state.connect_attempts += 1;

        if !state.reachable {
            return Err(TransportError::Unreachable("connection refused".to_string()));
        }
        if state.reject_credentials {
            return Err(TransportError::AccessRefused(
                "ACCESS_REFUSED - Login was refused".to_string(),
            ));
        }

        let id = state.next_id();
        state.connections.insert(id, ConnectionEntry::default());
        debug!(connection = id, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            shared: self.shared.clone(),
        }))
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    shared: Shared,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        // Channel.Open is a round trip on a real broker
        tokio::task::yield_now().await;

        let mut state = self.shared.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                confirms: false,
                prefetch: 0,
                in_flight: 0,
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            shared: self.shared.clone(),
        }))
    }

    fn on_error(&self, handler: ConnectionErrorHandler) {
        if let Some(entry) = self.shared.lock().connections.get_mut(&self.id) {
            entry.error_handlers.push(handler);
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().connections.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        // Explicit close does not fire error handlers
        let _ = close_connection(&self.shared, &mut state, self.id);
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    shared: Shared,
}

impl MemoryChannel {
    /// Fail with a channel-level error, closing the channel like a broker would.
    fn channel_error(&self, state: &mut BrokerState, err: TransportError) -> TransportError {
        close_channel(&self.shared, state, self.id);
        err
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        state.ensure_open(self.id)?;

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => {
                let message = format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared {}/durable={}, existing {}/durable={}",
                    exchange.name, exchange.kind, exchange.durable, existing.kind, existing.durable
                );
                Err(self.channel_error(&mut state, TransportError::PreconditionFailed(message)))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        state.ensure_open(self.id)?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => {
                let message = format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}': received {}, existing {}",
                    queue.name, queue.durable, existing.spec.durable
                );
                Err(self.channel_error(&mut state, TransportError::PreconditionFailed(message)))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        spec: queue.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        state.ensure_open(self.id)?;

        if !state.exchanges.contains_key(exchange) {
            let err = TransportError::NotFound(format!("no exchange '{exchange}'"));
            return Err(self.channel_error(&mut state, err));
        }
        if !state.queues.contains_key(queue) {
            let err = TransportError::NotFound(format!("no queue '{queue}'"));
            return Err(self.channel_error(&mut state, err));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        let entry = state.channels.get_mut(&self.id).ok_or(TransportError::Closed)?;
        entry.confirms = true;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &TaskEnvelope,
    ) -> Result<PendingConfirm, TransportError> {
        let mut state = self.shared.lock();
        let confirms = state
            .channels
            .get(&self.id)
            .map(|c| c.confirms)
            .ok_or(TransportError::Closed)?;

        let Some(kind) = state.exchanges.get(exchange).map(|e| e.kind) else {
            let err = TransportError::NotFound(format!("no exchange '{exchange}'"));
            return Err(self.channel_error(&mut state, err));
        };

        let mut targets: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
            let matches = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            };
            if matches && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        for target in &targets {
            if let Some(queue) = state.queues.get_mut(target) {
                queue.ready.push_back(Message {
                    envelope: envelope.clone(),
                    redelivered: false,
                });
            }
            dispatch(&self.shared, &mut state, target);
        }

        if !confirms {
            return Ok(futures::future::ready(Ok(PublishConfirmation::NotRequested)).boxed());
        }
        if state.withhold_confirms {
            return Ok(futures::future::pending::<Result<PublishConfirmation, TransportError>>().boxed());
        }
        Ok(futures::future::ready(Ok(PublishConfirmation::Ack)).boxed())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        let entry = state.channels.get_mut(&self.id).ok_or(TransportError::Closed)?;
        entry.prefetch = count;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let mut state = self.shared.lock();
        state.ensure_open(self.id)?;

        let Some(target) = state.queues.get_mut(queue) else {
            let err = TransportError::NotFound(format!("no queue '{queue}'"));
            return Err(self.channel_error(&mut state, err));
        };
        if target.consumers.iter().any(|c| c.tag == consumer_tag) {
            return Err(TransportError::Protocol(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        target.consumers.push(MemoryConsumer {
            tag: consumer_tag.to_string(),
            channel: self.id,
            no_ack,
            tx,
        });
        dispatch(&self.shared, &mut state, queue);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        state.ensure_open(self.id)?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == self.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.lock().channels.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        close_channel(&self.shared, &mut state, self.id);
        Ok(())
    }
}

struct MemoryAcker {
    shared: Weak<Mutex<BrokerState>>,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<(), TransportError> {
        let shared = self.shared.upgrade().ok_or(TransportError::Closed)?;
        let mut state = shared.lock();

        // Tags vanish when their channel closes and the message is requeued
        let unacked = state.unacked.remove(&self.tag).ok_or(TransportError::Closed)?;
        if let Some(entry) = state.channels.get_mut(&unacked.channel) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
        if requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(Message {
                    envelope: unacked.message.envelope,
                    redelivered: true,
                });
            }
        }
        dispatch(&shared, &mut state, &unacked.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(requeue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskDescriptor, TopologyDescriptor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn open_channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect("amqp://memory").await.unwrap();
        connection.create_channel().await.unwrap()
    }

    async fn declare(channel: &Arc<dyn BrokerChannel>, topology: &TopologyDescriptor, queue: &str) {
        channel.declare_exchange(&topology.exchange_spec()).await.unwrap();
        channel.declare_queue(&topology.queue_spec(queue)).await.unwrap();
        channel
            .bind_queue(queue, &topology.exchange, &topology.routing_key)
            .await
            .unwrap();
    }

    fn envelope(task: &str) -> TaskEnvelope {
        TaskEnvelope::for_task(&TaskDescriptor::new(task)).unwrap()
    }

    #[tokio::test]
    async fn test_conflicting_declaration_closes_channel() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        let durable = TopologyDescriptor::outbound();

        channel.declare_exchange(&durable.exchange_spec()).await.unwrap();
        channel.declare_exchange(&durable.exchange_spec()).await.unwrap();

        let transient = durable.clone().with_durability(false);
        let err = channel.declare_exchange(&transient.exchange_spec()).await.unwrap_err();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));
        assert!(!channel.is_open());
        assert_eq!(broker.exchange("outbound-tasks").map(|e| e.durable), Some(true));
    }

    #[tokio::test]
    async fn test_direct_routing_only_matches_key() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        let topology = TopologyDescriptor::direct("ex", "a");
        declare(&channel, &topology, "qa").await;

        let _confirm = channel.publish("ex", "a", &envelope("one")).await.unwrap();
        let _confirm = channel.publish("ex", "b", &envelope("two")).await.unwrap();

        assert_eq!(broker.queue_depth("qa"), Some(1));
        assert!(broker.has_binding("ex", "a", "qa"));
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_is_channel_error() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;

        let err = channel.publish("nowhere", "rk", &envelope("t")).await.err();
        assert!(matches!(err, Some(TransportError::NotFound(_))));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_unacked_requeued_when_channel_closes() {
        let broker = MemoryBroker::new();
        let producer = open_channel(&broker).await;
        let topology = TopologyDescriptor::direct("ex", "rk");
        declare(&producer, &topology, "q").await;
        let _confirm = producer.publish("ex", "rk", &envelope("first")).await.unwrap();

        let consumer = open_channel(&broker).await;
        let mut stream = consumer.consume("q", "c1", false).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count(), 1);

        consumer.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("q"), Some(1));
        assert!(delivery.ack().await.is_err());

        let again = open_channel(&broker).await;
        let mut stream = again.consume("q", "c2", false).await.unwrap();
        let redelivery = stream.next().await.unwrap().unwrap();
        assert!(redelivery.redelivered);
        assert_eq!(redelivery.envelope.task(), Some("first"));
        redelivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_nack_requeue() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        declare(&channel, &TopologyDescriptor::direct("ex", "rk"), "q").await;
        let _confirm = channel.publish("ex", "rk", &envelope("retry")).await.unwrap();

        let mut stream = channel.consume("q", "c", false).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        first.nack(true).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        second.nack(false).await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_sever_fires_error_handlers() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://memory").await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        connection.on_error(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let channel = connection.create_channel().await.unwrap();
        channel.set_prefetch(5).await.unwrap();

        broker.sever_connections();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!connection.is_connected());
        assert!(!channel.is_open());
        assert_eq!(broker.open_channels(), 0);
        assert!(matches!(
            connection.create_channel().await.err(),
            Some(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_explicit_close_does_not_fire_handlers() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://memory").await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        connection.on_error(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        connection.close().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        assert!(matches!(
            broker.connect("amqp://memory").await.err(),
            Some(TransportError::Unreachable(_))
        ));
        broker.set_reachable(true);
        broker.reject_credentials(true);
        assert!(matches!(
            broker.connect("amqp://memory").await.err(),
            Some(TransportError::AccessRefused(_))
        ));
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        declare(&channel, &TopologyDescriptor::direct("ex", "rk"), "q").await;
        for task in ["a", "b", "c"] {
            let _confirm = channel.publish("ex", "rk", &envelope(task)).await.unwrap();
        }

        channel.set_prefetch(1).await.unwrap();
        let mut stream = channel.consume("q", "c", false).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("q"), Some(2));

        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.envelope.task(), Some("b"));
        assert_eq!(broker.queue_depth("q"), Some(1));
    }

    #[tokio::test]
    async fn test_restart_keeps_only_durable_topology() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        declare(&channel, &TopologyDescriptor::direct("kept", "rk"), "kept.q").await;
        declare(
            &channel,
            &TopologyDescriptor::direct("gone", "rk").with_durability(false),
            "gone.q",
        )
        .await;
        let _confirm = channel.publish("kept", "rk", &envelope("survivor")).await.unwrap();

        broker.restart();

        assert!(broker.exchange("kept").is_some());
        assert!(broker.exchange("gone").is_none());
        assert!(broker.queue("gone.q").is_none());
        assert!(broker.has_binding("kept", "rk", "kept.q"));
        assert!(!broker.has_binding("gone", "rk", "gone.q"));
        assert_eq!(broker.queue_depth("kept.q"), Some(1));
        assert_eq!(broker.open_connections(), 0);
    }
}
