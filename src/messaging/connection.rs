//! Broker connection lifecycle.
//!
//! [`BrokerConnectionManager`] owns one connection and the channels derived
//! from it. It moves through
//! `Uninitialized -> Connecting -> Ready -> Closing -> Closed`; a failed
//! connect falls back to `Uninitialized`, and a connection lost while `Ready`
//! goes back to `Connecting` while a supervisor task reconnects with backoff
//! and re-declares every topology declared so far.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::amqp::AmqpConnector;
use super::reconnect::ReconnectPolicy;
use super::topology::{self, DeclaredTopology};
use super::transport::{BrokerChannel, BrokerConnection, BrokerConnector};
use crate::error::{BridgeError, TransportError};
use crate::types::{validate_broker_url, BridgeConfig, TopologyDescriptor};

static INSTANCE: OnceLock<Arc<BrokerConnectionManager>> = OnceLock::new();

/// Lifecycle states of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Ready,
    Closing,
    Closed,
}

/// State plus the number of connections established so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub state: ConnectionState,
    pub generation: u64,
}

#[derive(Debug)]
struct ConnectionLoss {
    generation: u64,
    error: TransportError,
}

#[derive(Default)]
struct Session {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    confirm_channel: Option<Arc<dyn BrokerChannel>>,
    dedicated: Vec<Arc<dyn BrokerChannel>>,
}

impl Session {
    fn is_live(&self) -> bool {
        matches!(&self.connection, Some(c) if c.is_connected()) && self.channel.is_some()
    }
}

/// Owner of the broker connection shared by publishers and consumers.
pub struct BrokerConnectionManager {
    me: Weak<BrokerConnectionManager>,
    connector: Arc<dyn BrokerConnector>,
    broker_url: String,
    connect_timeout: Duration,
    close_timeout: Duration,
    reconnect: ReconnectPolicy,
    session: Mutex<Session>,
    lifecycle: watch::Sender<Lifecycle>,
    connect_lock: tokio::sync::Mutex<()>,
    declared: Mutex<HashSet<DeclaredTopology>>,
    topology_limit: usize,
    loss_tx: mpsc::UnboundedSender<ConnectionLoss>,
    loss_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionLoss>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnectionManager {
    /// Create a manager. Nothing touches the network until [`initialize`].
    ///
    /// [`initialize`]: Self::initialize
    pub fn new(connector: Arc<dyn BrokerConnector>, config: &BridgeConfig) -> Arc<Self> {
        let (lifecycle, _) = watch::channel(Lifecycle {
            state: ConnectionState::Uninitialized,
            generation: 0,
        });
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connector,
            broker_url: config.broker_url.clone(),
            connect_timeout: config.connect_timeout,
            close_timeout: config.close_timeout,
            reconnect: config.reconnect.clone(),
            session: Mutex::new(Session::default()),
            lifecycle,
            connect_lock: tokio::sync::Mutex::new(()),
            declared: Mutex::new(HashSet::new()),
            topology_limit: config.topology_limit,
            loss_tx,
            loss_rx: Mutex::new(Some(loss_rx)),
            supervisor: Mutex::new(None),
        })
    }

    /// Process-wide manager backed by RabbitMQ and configured from the
    /// environment. Created on first call; creation does not connect.
    pub fn instance() -> Arc<Self> {
        INSTANCE
            .get_or_init(|| {
                let config = BridgeConfig::from_env();
                let connector = Arc::new(AmqpConnector::new(&config.connection_name));
                Self::new(connector, &config)
            })
            .clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.borrow().state
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Resolves once the current connection stops being usable, through
    /// shutdown or loss. Resolves immediately when not `Ready`.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.lifecycle.subscribe();
        let generation = rx.borrow().generation;
        async move {
            let _ = rx
                .wait_for(|l| l.state != ConnectionState::Ready || l.generation != generation)
                .await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.lifecycle.send_modify(|l| l.state = state);
    }

    /// Connect and open the shared channel. Returns immediately when a live
    /// connection already exists.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        let _guard = self.connect_lock.lock().await;
        if self.session.lock().is_live() && self.state() == ConnectionState::Ready {
            return Ok(());
        }

        match self.establish().await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_state(ConnectionState::Uninitialized);
                error!(error = %e, "failed to initialize broker connection");
                Err(e)
            }
        }
    }

    /// Open a connection and its shared channel. On failure nothing is kept,
    /// the caller decides which state to fall back to.
    async fn establish(&self) -> Result<u64, BridgeError> {
        validate_broker_url(&self.broker_url)?;
        self.set_state(ConnectionState::Connecting);

        let connection =
            match tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.broker_url))
                .await
            {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => return Err(BridgeError::Connection(e.to_string())),
                Err(_) => {
                    return Err(BridgeError::Connection(format!(
                        "connect timed out after {:?}",
                        self.connect_timeout
                    )))
                }
            };
        info!("broker connection is ready");

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(BridgeError::Connection(format!("channel creation failed: {e}")));
            }
        };
        info!("broker channel created");

        let generation = self.lifecycle.borrow().generation + 1;
        let loss_tx = self.loss_tx.clone();
        connection.on_error(Box::new(move |error| {
            let _ = loss_tx.send(ConnectionLoss { generation, error });
        }));

        *self.session.lock() = Session {
            connection: Some(connection),
            channel: Some(channel),
            ..Default::default()
        };
        self.ensure_supervisor();
        self.lifecycle.send_replace(Lifecycle {
            state: ConnectionState::Ready,
            generation,
        });

        Ok(generation)
    }

    fn ensure_supervisor(&self) {
        let Some(losses) = self.loss_rx.lock().take() else {
            return;
        };
        let handle = tokio::spawn(supervise(self.me.clone(), losses));
        *self.supervisor.lock() = Some(handle);
    }

    fn unavailable(&self) -> BridgeError {
        let lifecycle = self.lifecycle();
        match lifecycle.state {
            ConnectionState::Uninitialized => BridgeError::NotInitialized,
            ConnectionState::Connecting if lifecycle.generation == 0 => BridgeError::NotInitialized,
            _ => BridgeError::ConnectionClosed,
        }
    }

    fn live_session(&self) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), BridgeError> {
        if self.state() != ConnectionState::Ready {
            return Err(self.unavailable());
        }
        let session = self.session.lock();
        match (&session.connection, &session.channel) {
            (Some(connection), Some(channel)) => Ok((connection.clone(), channel.clone())),
            _ => Err(self.unavailable()),
        }
    }

    /// The shared channel. A channel closed by a channel-level error is
    /// replaced with a fresh one while the connection is alive.
    pub async fn get_channel(&self) -> Result<Arc<dyn BrokerChannel>, BridgeError> {
        let (connection, channel) = self.live_session()?;
        if channel.is_open() {
            return Ok(channel);
        }
        if !connection.is_connected() {
            return Err(BridgeError::ConnectionClosed);
        }

        let fresh = connection.create_channel().await.map_err(channel_failure)?;
        debug!("replaced closed broker channel");

        let mut session = self.session.lock();
        match &session.channel {
            Some(current) if !Arc::ptr_eq(current, &channel) && current.is_open() => {
                Ok(current.clone())
            }
            _ => {
                session.channel = Some(fresh.clone());
                Ok(fresh)
            }
        }
    }

    /// A channel in publisher-confirm mode, cached per connection.
    pub async fn confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, BridgeError> {
        let (connection, _) = self.live_session()?;
        let cached = self.session.lock().confirm_channel.clone();
        if let Some(channel) = cached.filter(|c| c.is_open()) {
            return Ok(channel);
        }

        let channel = connection.create_channel().await.map_err(channel_failure)?;
        channel.enable_confirms().await.map_err(channel_failure)?;

        // A concurrent caller may have cached one in the meantime
        let existing = {
            let mut session = self.session.lock();
            match session.confirm_channel.clone().filter(|c| c.is_open()) {
                Some(existing) => Some(existing),
                None => {
                    session.confirm_channel = Some(channel.clone());
                    None
                }
            }
        };
        if let Some(existing) = existing {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "surplus confirm channel close failed");
            }
            return Ok(existing);
        }

        debug!("opened publisher-confirm channel");
        Ok(channel)
    }

    /// A new channel on the shared connection, closed by [`shutdown`].
    ///
    /// [`shutdown`]: Self::shutdown
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BridgeError> {
        let (connection, _) = self.live_session()?;
        let channel = connection.create_channel().await.map_err(channel_failure)?;

        let mut session = self.session.lock();
        session.dedicated.retain(|c| c.is_open());
        session.dedicated.push(channel.clone());
        Ok(channel)
    }

    /// Forget a dedicated channel the caller has closed itself.
    pub fn release_channel(&self, channel: &Arc<dyn BrokerChannel>) {
        self.session
            .lock()
            .dedicated
            .retain(|c| !Arc::ptr_eq(c, channel));
    }

    /// Declare `descriptor` with `queue` on `channel` and remember it for
    /// re-declaration after a reconnect.
    pub async fn declare_topology(
        &self,
        channel: &dyn BrokerChannel,
        descriptor: &TopologyDescriptor,
        queue: &str,
    ) -> Result<(), BridgeError> {
        topology::declare(channel, descriptor, queue)
            .await
            .map_err(|e| {
                warn!(exchange = %descriptor.exchange, queue, error = %e, "topology declaration rejected");
                BridgeError::from_declare(e)
            })?;

        let entry = DeclaredTopology {
            descriptor: descriptor.clone(),
            queue: queue.to_string(),
        };
        let mut declared = self.declared.lock();
        if declared.len() < self.topology_limit || declared.contains(&entry) {
            declared.insert(entry);
        } else {
            // Still declared on every publish, just not re-declared eagerly
            debug!(queue, limit = self.topology_limit, "topology registry full");
        }
        Ok(())
    }

    /// Number of topologies remembered for re-declaration.
    pub fn declared_topologies(&self) -> usize {
        self.declared.lock().len()
    }

    async fn redeclare_topology(&self) {
        let declared: Vec<DeclaredTopology> = self.declared.lock().iter().cloned().collect();
        if declared.is_empty() {
            return;
        }

        let channel = match self.get_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "cannot re-declare topology");
                return;
            }
        };

        for entry in &declared {
            if let Err(e) = topology::declare(channel.as_ref(), &entry.descriptor, &entry.queue).await {
                warn!(
                    exchange = %entry.descriptor.exchange,
                    queue = %entry.queue,
                    error = %e,
                    "topology re-declaration failed"
                );
            }
        }
        info!(count = declared.len(), "topology re-declared after reconnect");
    }

    async fn recover(&self, loss: ConnectionLoss) {
        // Only the connection that is currently Ready may trigger a reconnect
        let claimed = self.lifecycle.send_if_modified(|l| {
            if l.generation == loss.generation && l.state == ConnectionState::Ready {
                l.state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return;
        }

        warn!(error = %loss.error, "broker connection lost, reconnecting");
        let stale = std::mem::take(&mut *self.session.lock());
        drop(stale);

        let mut attempt = 0;
        loop {
            if !self.reconnect.allows(attempt) {
                error!(attempts = attempt, "giving up on broker reconnection");
                self.set_state(ConnectionState::Uninitialized);
                return;
            }
            tokio::time::sleep(self.reconnect.delay_for(attempt)).await;

            let guard = self.connect_lock.lock().await;
            if self.state() != ConnectionState::Connecting {
                // Shut down or re-initialized while waiting
                return;
            }

            match self.establish().await {
                Ok(generation) => {
                    info!(generation, attempts = attempt + 1, "broker connection restored");
                    drop(guard);
                    self.redeclare_topology().await;
                    return;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Connecting);
                    warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
            attempt += 1;
        }
    }

    /// Close every channel, then the connection. Each close is bounded by the
    /// close timeout; calling this on a closed manager is a no-op.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closing);

        let _guard = self.connect_lock.lock().await;
        let session = std::mem::take(&mut *self.session.lock());

        let mut channels = session.dedicated;
        channels.extend(session.confirm_channel);
        channels.extend(session.channel);
        for channel in channels {
            if !channel.is_open() {
                continue;
            }
            match tokio::time::timeout(self.close_timeout, channel.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "channel close failed"),
                Err(_) => warn!(timeout = ?self.close_timeout, "channel close timed out"),
            }
        }

        if let Some(connection) = session.connection {
            match tokio::time::timeout(self.close_timeout, connection.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "connection close failed"),
                Err(_) => warn!(timeout = ?self.close_timeout, "connection close timed out"),
            }
        }

        self.set_state(ConnectionState::Closed);
        info!("broker connection closed");
    }
}

impl Drop for BrokerConnectionManager {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
    }
}

fn channel_failure(err: TransportError) -> BridgeError {
    match err {
        TransportError::Closed => BridgeError::ConnectionClosed,
        other => BridgeError::Connection(other.to_string()),
    }
}

async fn supervise(
    manager: Weak<BrokerConnectionManager>,
    mut losses: mpsc::UnboundedReceiver<ConnectionLoss>,
) {
    while let Some(loss) = losses.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.recover(loss).await;
    }
}
