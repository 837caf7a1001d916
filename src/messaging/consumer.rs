//! Event consumer.
//!
//! Binds a queue to the inbound exchange and feeds every delivered envelope to
//! a caller-supplied handler. Handler errors and panics are logged and never
//! end the subscription. When the subscription ends (cancel, shutdown or
//! connection loss) the handler is called once more with `None`.
//!
//! Delivery guarantees depend on [`AckMode`]: `Auto` is at-most-once, `Manual`
//! acks after the handler succeeds and is at-least-once, so handlers must be
//! idempotent. Handlers should hand long work off to a task and return.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::connection::{BrokerConnectionManager, ConnectionState};
use super::reconnect::ReconnectPolicy;
use super::transport::{BrokerChannel, Delivery, DeliveryStream};
use crate::error::BridgeError;
use crate::types::{AckMode, BridgeConfig, ConsumerOptions, TaskEnvelope, TopologyDescriptor};

/// Counters for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Envelopes handed to the handler
    pub delivered: u64,
    /// Handler returned `Ok`
    pub handled: u64,
    /// Handler returned an error or panicked
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            handled: self.handled.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Handle to a running subscription.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    manager: Arc<BrokerConnectionManager>,
    cancel: Arc<Notify>,
    counters: Arc<Counters>,
    done: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Counters so far.
    pub fn stats(&self) -> SubscriptionStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves once the delivery loop has ended, for whatever reason.
    pub async fn finished(&self) {
        let mut done = self.done.clone();
        // A dropped sender means the loop task is gone too
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Stop consuming and wait for in-flight handlers to settle their
    /// deliveries, then close the subscription's channel. The handler sees
    /// the end-of-stream sentinel before this returns.
    pub async fn cancel(self) -> SubscriptionStats {
        self.cancel.notify_one();
        if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
            debug!(consumer_tag = %self.consumer_tag, error = %e, "basic.cancel failed");
        }

        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "cancelling subscription");
        self.close().await
    }

    /// Wait for the loop to end, then close and release the channel.
    async fn close(self) -> SubscriptionStats {
        let channel = self.channel.clone();
        let manager = self.manager.clone();
        let consumer_tag = self.consumer_tag.clone();
        let stats = self.join().await;

        // Deliveries prefetched but never handled go back to the queue here
        if let Err(e) = channel.close().await {
            debug!(consumer_tag = %consumer_tag, error = %e, "consumer channel close failed");
        }
        manager.release_channel(&channel);
        stats
    }

    /// Wait for the subscription to end on its own.
    pub async fn join(self) -> SubscriptionStats {
        if let Err(e) = self.task.await {
            error!(queue = %self.queue, error = %e, "subscription task failed");
        }
        self.counters.snapshot()
    }
}

/// Why [`EventConsumer::keep_consuming`] stopped waiting on a subscription.
enum SubscriptionEnd {
    Stopped,
    ConnectionLost,
    Finished,
}

/// Consumes envelopes from queues bound to one exchange.
#[derive(Clone)]
pub struct EventConsumer {
    manager: Arc<BrokerConnectionManager>,
    topology: TopologyDescriptor,
    options: ConsumerOptions,
}

impl EventConsumer {
    /// Create a consumer for `topology` with default options (manual ack).
    pub fn new(manager: Arc<BrokerConnectionManager>, topology: TopologyDescriptor) -> Self {
        Self {
            manager,
            topology,
            options: ConsumerOptions::default(),
        }
    }

    /// Create a consumer using the inbound topology and options of `config`.
    pub fn from_config(manager: Arc<BrokerConnectionManager>, config: &BridgeConfig) -> Self {
        Self::new(manager, config.inbound.clone()).with_options(config.consumer.clone())
    }

    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Declare the inbound exchange and `queue`, bind them, and start
    /// invoking `handler` for every delivered envelope.
    #[instrument(skip(self, handler))]
    pub async fn consume<F, Fut>(&self, queue: &str, handler: F) -> Result<Subscription, BridgeError>
    where
        F: Fn(Option<TaskEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if queue.trim().is_empty() {
            return Err(BridgeError::InvalidTask("queue name must not be empty".to_string()));
        }

        let channel = self.manager.open_channel().await?;
        match self.subscribe(channel.clone(), queue, handler).await {
            Ok(subscription) => Ok(subscription),
            Err(e) => {
                let _ = channel.close().await;
                self.manager.release_channel(&channel);
                Err(e)
            }
        }
    }

    async fn subscribe<F, Fut>(
        &self,
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        handler: F,
    ) -> Result<Subscription, BridgeError>
    where
        F: Fn(Option<TaskEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.manager
            .declare_topology(channel.as_ref(), &self.topology, queue)
            .await?;

        let no_ack = self.options.ack_mode == AckMode::Auto;
        if !no_ack && self.options.prefetch > 0 {
            channel
                .set_prefetch(self.options.prefetch)
                .await
                .map_err(BridgeError::from_consume)?;
        }

        let consumer_tag = self
            .options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("task-bridge-{}", Uuid::new_v4()));
        let closed = self.manager.closed();
        let stream = channel
            .consume(queue, &consumer_tag, no_ack)
            .await
            .map_err(BridgeError::from_consume)?;

        info!(
            queue,
            consumer_tag = %consumer_tag,
            ack_mode = ?self.options.ack_mode,
            "listening for incoming events"
        );

        let cancel = Arc::new(Notify::new());
        let counters = Arc::new(Counters::default());
        let run = SubscriptionLoop {
            queue: queue.to_string(),
            concurrency: self.options.concurrency.max(1),
            requeue_on_error: self.options.requeue_on_error,
            counters: counters.clone(),
        };
        let stop = {
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = closed => {}
                    _ = cancel.notified() => {}
                }
            }
        };
        let (done_tx, done) = watch::channel(false);
        let task = tokio::spawn(async move {
            run.run(stream, stop, handler).await;
            let _ = done_tx.send(true);
        });

        Ok(Subscription {
            queue: queue.to_string(),
            consumer_tag,
            channel,
            manager: self.manager.clone(),
            cancel,
            counters,
            done,
            task,
        })
    }

    /// Keep `queue` subscribed until `stop` flips to `true`.
    ///
    /// Waits for the manager to be `Ready`, subscribes, and subscribes again
    /// after a reconnect or when the subscription ends while the connection
    /// stays up (a closed consumer channel, a broker-side cancel). Failed or
    /// ended subscriptions are retried with `retry`'s backoff. Returns when
    /// stopped or once the manager is shut down.
    pub async fn keep_consuming<F, Fut>(
        &self,
        queue: &str,
        handler: F,
        retry: &ReconnectPolicy,
        mut stop: watch::Receiver<bool>,
    ) where
        F: Fn(Option<TaskEnvelope>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut lifecycle = self.manager.subscribe();
        let mut failures: u32 = 0;
        loop {
            if *stop.borrow() {
                return;
            }
            let ready = tokio::select! {
                _ = stop.changed() => return,
                outcome = lifecycle.wait_for(|l| {
                    matches!(l.state, ConnectionState::Ready | ConnectionState::Closing | ConnectionState::Closed)
                }) => outcome.map(|l| l.state == ConnectionState::Ready).unwrap_or(false),
            };
            if !ready {
                return;
            }

            match self.consume(queue, handler.clone()).await {
                Ok(subscription) => {
                    let ended = tokio::select! {
                        _ = stop.changed() => SubscriptionEnd::Stopped,
                        _ = self.manager.closed() => SubscriptionEnd::ConnectionLost,
                        _ = subscription.finished() => SubscriptionEnd::Finished,
                    };
                    match ended {
                        SubscriptionEnd::Stopped => {
                            let stats = subscription.cancel().await;
                            info!(queue, handled = stats.handled, failed = stats.failed, "consumer stopped");
                            return;
                        }
                        SubscriptionEnd::ConnectionLost => {
                            let stats = subscription.close().await;
                            warn!(queue, delivered = stats.delivered, "subscription ended with the connection");
                            failures = 0;
                            continue;
                        }
                        SubscriptionEnd::Finished => {
                            let stats = subscription.close().await;
                            warn!(
                                queue,
                                delivered = stats.delivered,
                                "subscription ended while connected, re-subscribing"
                            );
                        }
                    }
                }
                Err(e) => warn!(queue, error = %e, "failed to subscribe"),
            }

            let delay = retry.delay_for(failures);
            failures = failures.saturating_add(1);
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

struct SubscriptionLoop {
    queue: String,
    concurrency: usize,
    requeue_on_error: bool,
    counters: Arc<Counters>,
}

impl SubscriptionLoop {
    async fn run<F, Fut, S>(self, stream: DeliveryStream, stop: S, handler: F)
    where
        F: Fn(Option<TaskEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        // take_until checks `stop` before pulling each delivery, so nothing
        // is dispatched once shutdown or cancel has been signalled
        let this = &self;
        let handler_ref = &handler;
        stream
            .take_until(stop)
            .for_each_concurrent(self.concurrency, move |item| async move {
                match item {
                    Ok(delivery) => this.dispatch(handler_ref, delivery).await,
                    Err(e) => error!(queue = %this.queue, error = %e, "consumer error"),
                }
            })
            .await;

        debug!(queue = %self.queue, "subscription stream ended");
        match AssertUnwindSafe(async { handler(None).await }).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(queue = %self.queue, error = %e, "handler failed on end of stream"),
            Err(_) => error!(queue = %self.queue, "handler panicked on end of stream"),
        }
    }

    async fn dispatch<F, Fut>(&self, handler: &F, delivery: Delivery)
    where
        F: Fn(Option<TaskEnvelope>) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        self.counters.delivered.fetch_add(1, Ordering::SeqCst);
        let id = delivery.envelope.id().unwrap_or("-").to_string();
        let task = delivery.envelope.task().unwrap_or("-").to_string();
        let envelope = delivery.envelope.clone();

        let outcome = AssertUnwindSafe(async { handler(Some(envelope)).await })
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("handler panicked".to_string()),
        };

        match failure {
            None => {
                self.counters.handled.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = delivery.ack().await {
                    warn!(queue = %self.queue, id = %id, error = %e, "ack failed");
                }
            }
            Some(reason) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    queue = %self.queue,
                    id = %id,
                    task = %task,
                    redelivered = delivery.redelivered,
                    error = %reason,
                    "event handler failed"
                );
                if let Err(e) = delivery.nack(self.requeue_on_error).await {
                    warn!(queue = %self.queue, id = %id, error = %e, "nack failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::{ReconnectPolicy, TaskPublisher};
    use crate::types::TaskDescriptor;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default().with_broker_url("amqp://localhost");
        config.reconnect = ReconnectPolicy::fixed(Duration::from_secs(60), 1);
        config
    }

    async fn setup() -> (MemoryBroker, Arc<BrokerConnectionManager>) {
        let broker = MemoryBroker::new();
        let manager = BrokerConnectionManager::new(Arc::new(broker.clone()), &config());
        manager.initialize().await.unwrap();
        (broker, manager)
    }

    /// Handler forwarding every call into a channel.
    fn forwarding(
        tx: mpsc::UnboundedSender<Option<TaskEnvelope>>,
    ) -> impl Fn(Option<TaskEnvelope>) -> futures::future::Ready<anyhow::Result<()>>
           + Clone
           + Send
           + Sync
           + 'static {
        move |envelope| {
            let _ = tx.send(envelope);
            futures::future::ready(Ok(()))
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Option<TaskEnvelope>>) -> Option<TaskEnvelope> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("handler was not invoked")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn test_publish_then_consume_round_trip() {
        let (broker, manager) = setup().await;
        let publisher = TaskPublisher::new(manager.clone(), TopologyDescriptor::outbound());
        let task = TaskDescriptor::new("issue_create_task").arg("Petr").arg(30);
        let receipt = publisher.publish("tasks.q", &task).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = EventConsumer::new(manager.clone(), TopologyDescriptor::inbound());
        let subscription = consumer.consume("tasks.q", forwarding(tx)).await.unwrap();

        let envelope = next(&mut rx).await.unwrap();
        assert_eq!(envelope.task(), Some("issue_create_task"));
        assert_eq!(envelope.id(), Some(receipt.id.as_str()));
        assert_eq!(envelope.content_type(), "application/json");
        assert_eq!(envelope.content_encoding(), "utf-8");
        let body: Value = serde_json::from_slice(envelope.body()).unwrap();
        assert_eq!(body, json!({"args": ["Petr", 30], "kwargs": {}, "other_data": {}}));

        assert!(broker.has_binding("inbound-events", "event.notify", "tasks.q"));
        let stats = subscription.cancel().await;
        assert_eq!(stats, SubscriptionStats { delivered: 1, handled: 1, failed: 0 });
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("tasks.q"), Some(0));
    }

    #[tokio::test]
    async fn test_cancel_sends_sentinel() {
        let (_broker, manager) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = EventConsumer::new(manager, TopologyDescriptor::inbound());
        let subscription = consumer.consume("events.q", forwarding(tx)).await.unwrap();

        subscription.cancel().await;
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_subscription() {
        let (broker, manager) = setup().await;
        let publisher = TaskPublisher::new(manager.clone(), TopologyDescriptor::outbound());
        for name in ["bad", "panic", "good"] {
            publisher.publish("q", &TaskDescriptor::new(name)).await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let consumer = EventConsumer::new(manager, TopologyDescriptor::inbound());
        let subscription = consumer
            .consume("q", move |envelope: Option<TaskEnvelope>| {
                let log = log.clone();
                async move {
                    let Some(envelope) = envelope else {
                        return Ok(());
                    };
                    let task = envelope.task().unwrap_or_default().to_string();
                    log.lock().push(task.clone());
                    match task.as_str() {
                        "bad" => anyhow::bail!("cannot handle {task}"),
                        "panic" => panic!("handler blew up"),
                        _ => Ok(()),
                    }
                }
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while subscription.stats().delivered < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stats = subscription.cancel().await;
        assert_eq!(stats, SubscriptionStats { delivered: 3, handled: 1, failed: 2 });
        assert_eq!(*seen.lock(), vec!["bad", "panic", "good"]);
        // Failed messages are dropped unless requeue_on_error is set
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn test_requeue_on_error_redelivers() {
        let (broker, manager) = setup().await;
        let publisher = TaskPublisher::new(manager.clone(), TopologyDescriptor::outbound());
        publisher.publish("q", &TaskDescriptor::new("flaky")).await.unwrap();

        let attempts = Arc::new(AtomicU64::new(0));
        let counter = attempts.clone();
        let mut options = ConsumerOptions::default();
        options.requeue_on_error = true;
        let consumer = EventConsumer::new(manager, TopologyDescriptor::inbound()).with_options(options);
        let subscription = consumer
            .consume("q", move |envelope: Option<TaskEnvelope>| {
                let counter = counter.clone();
                async move {
                    if envelope.is_some() && counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("transient failure");
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while subscription.stats().handled < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stats = subscription.cancel().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn test_auto_ack_leaves_nothing_unacked() {
        let (broker, manager) = setup().await;
        let publisher = TaskPublisher::new(manager.clone(), TopologyDescriptor::outbound());
        publisher.publish("q", &TaskDescriptor::new("fire")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = EventConsumer::new(manager, TopologyDescriptor::inbound())
            .with_options(ConsumerOptions::auto_ack());
        let subscription = consumer.consume("q", forwarding(tx)).await.unwrap();

        assert!(next(&mut rx).await.is_some());
        assert_eq!(broker.unacked_count(), 0);
        subscription.cancel().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_handler_stops_deliveries() {
        let (broker, manager) = setup().await;
        let publisher = TaskPublisher::new(manager.clone(), TopologyDescriptor::outbound());
        publisher.publish("q", &TaskDescriptor::new("first")).await.unwrap();
        publisher.publish("q", &TaskDescriptor::new("second")).await.unwrap();

        let gate = Arc::new(Notify::new());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let handler_gate = gate.clone();
        let consumer = EventConsumer::new(manager.clone(), TopologyDescriptor::inbound())
            .with_options(ConsumerOptions::default().with_prefetch(1));
        let subscription = consumer
            .consume("q", move |envelope: Option<TaskEnvelope>| {
                let gate = handler_gate.clone();
                let started = started_tx.clone();
                async move {
                    if envelope.is_some() {
                        let _ = started.send(());
                        gate.notified().await;
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        started_rx.recv().await.unwrap();
        manager.shutdown().await;
        gate.notify_one();

        let stats = tokio::time::timeout(Duration::from_secs(2), subscription.join())
            .await
            .unwrap();

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.handled, 1);
        // The channel closed before the ack, so the first message was requeued
        assert_eq!(broker.queue_depth("q"), Some(2));
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_handlers() {
        let (_broker, manager) = setup().await;
        let publisher = TaskPublisher::new(manager.clone(), TopologyDescriptor::outbound());
        for i in 0..4 {
            publisher
                .publish("q", &TaskDescriptor::new("parallel").arg(i))
                .await
                .unwrap();
        }

        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let handler_barrier = barrier.clone();
        let consumer = EventConsumer::new(manager, TopologyDescriptor::inbound())
            .with_options(ConsumerOptions::default().with_concurrency(4));
        let subscription = consumer
            .consume("q", move |envelope: Option<TaskEnvelope>| {
                let barrier = handler_barrier.clone();
                async move {
                    // Only completes if all four run at once
                    if envelope.is_some() {
                        barrier.wait().await;
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while subscription.stats().handled < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        subscription.cancel().await;
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_handler_ack() {
        let (broker, manager) = setup().await;
        let publisher = TaskPublisher::new(manager.clone(), TopologyDescriptor::outbound());
        publisher.publish("q", &TaskDescriptor::new("slow")).await.unwrap();

        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let consumer = EventConsumer::new(manager, TopologyDescriptor::inbound());
        let subscription = consumer
            .consume("q", move |envelope: Option<TaskEnvelope>| {
                let started = started_tx.clone();
                async move {
                    if envelope.is_some() {
                        let _ = started.send(());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        started_rx.recv().await.unwrap();
        let stats = subscription.cancel().await;

        assert_eq!(stats, SubscriptionStats { delivered: 1, handled: 1, failed: 0 });
        // Acked before the channel closed, so nothing comes back
        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_cancel_requeues_prefetched_but_unhandled() {
        let (broker, manager) = setup().await;
        let publisher = TaskPublisher::new(manager.clone(), TopologyDescriptor::outbound());
        publisher.publish("q", &TaskDescriptor::new("first")).await.unwrap();
        publisher.publish("q", &TaskDescriptor::new("second")).await.unwrap();

        let gate = Arc::new(Notify::new());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let handler_gate = gate.clone();
        let consumer = EventConsumer::new(manager, TopologyDescriptor::inbound());
        let subscription = consumer
            .consume("q", move |envelope: Option<TaskEnvelope>| {
                let gate = handler_gate.clone();
                let started = started_tx.clone();
                async move {
                    if envelope.is_some() {
                        let _ = started.send(());
                        gate.notified().await;
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        started_rx.recv().await.unwrap();
        let cancelled = tokio::spawn(subscription.cancel());
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();
        let stats = tokio::time::timeout(Duration::from_secs(2), cancelled)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(broker.queue_depth("q"), Some(1));
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_resolves_when_broker_cancels() {
        let (broker, manager) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = EventConsumer::new(manager.clone(), TopologyDescriptor::inbound());
        let subscription = consumer.consume("q", forwarding(tx)).await.unwrap();

        assert_eq!(broker.cancel_consumers("q"), 1);
        tokio::time::timeout(Duration::from_secs(2), subscription.finished())
            .await
            .expect("subscription did not notice the cancel");

        assert!(next(&mut rx).await.is_none());
        assert_eq!(manager.state(), crate::messaging::ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_keep_consuming_resubscribes_while_connected() {
        let (broker, manager) = setup().await;
        let publisher = TaskPublisher::new(manager.clone(), TopologyDescriptor::outbound());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let consumer = EventConsumer::new(manager.clone(), TopologyDescriptor::inbound());
        let retry = ReconnectPolicy::fixed(Duration::from_millis(10), 1);
        let running = tokio::spawn(async move {
            consumer.keep_consuming("q", forwarding(tx), &retry, stop_rx).await;
        });

        async fn next_task(rx: &mut mpsc::UnboundedReceiver<Option<TaskEnvelope>>) -> String {
            loop {
                if let Some(envelope) = next(rx).await {
                    return envelope.task().unwrap_or_default().to_string();
                }
            }
        }

        // The queue exists once the first subscription has declared it
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.queue("q").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        publisher.publish("q", &TaskDescriptor::new("one")).await.unwrap();
        assert_eq!(next_task(&mut rx).await, "one");

        let generation = manager.lifecycle().generation;
        assert_eq!(broker.cancel_consumers("q"), 1);
        publisher.publish("q", &TaskDescriptor::new("two")).await.unwrap();
        assert_eq!(next_task(&mut rx).await, "two");
        assert_eq!(manager.lifecycle().generation, generation);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn test_consume_requires_initialize() {
        let broker = MemoryBroker::new();
        let manager = BrokerConnectionManager::new(Arc::new(broker), &config());
        let consumer = EventConsumer::new(manager, TopologyDescriptor::inbound());

        let outcome = consumer.consume("q", |_| async { Ok(()) }).await;
        assert!(matches!(outcome.err(), Some(BridgeError::NotInitialized)));
    }
}
