//! Task Bridge Service - Main Entry Point
//!
//! Publishes tasks submitted over HTTP to the outbound exchange and logs the
//! completion events arriving on the inbound exchange.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use task_bridge::api::{self, AppState};
use task_bridge::messaging::{AmqpConnector, BrokerConnectionManager, EventConsumer};
use task_bridge::types::{BridgeConfig, TaskEnvelope};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();

    // Initialize tracing
    let json_logs = std::env::var("LOG_FORMAT").map_or(false, |f| f == "json");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "task_bridge=info,tower_http=info".into()),
        ))
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let config = BridgeConfig::from_env();
    config.validate_url()?;

    info!("Starting Task Bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        outbound = %config.outbound.exchange,
        inbound = %config.inbound.exchange,
        queue = %config.inbound_queue,
        ack_mode = ?config.consumer.ack_mode,
        "Bridge topology"
    );

    // Connect
    let connector = Arc::new(AmqpConnector::new(&config.connection_name));
    let manager = BrokerConnectionManager::new(connector, &config);
    connect_with_retry(&manager, &config).await?;

    // Inbound events
    let (stop_tx, stop_rx) = watch::channel(false);
    let consumer = EventConsumer::from_config(manager.clone(), &config);
    let queue = config.inbound_queue.clone();
    let retry = config.reconnect.clone();
    let inbound = tokio::spawn(async move {
        consumer.keep_consuming(&queue, log_event, &retry, stop_rx).await;
    });

    // HTTP ingress
    let port = config.http_port;
    let state = Arc::new(AppState::new(manager.clone(), config));
    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    let _ = stop_tx.send(true);
    if let Err(e) = inbound.await {
        error!(error = %e, "inbound consumer task failed");
    }
    manager.shutdown().await;

    Ok(())
}

/// Initialize the manager, retrying with the configured backoff.
async fn connect_with_retry(manager: &BrokerConnectionManager, config: &BridgeConfig) -> Result<()> {
    let mut attempt = 0;
    loop {
        match manager.initialize().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && config.reconnect.allows(attempt) => {
                let delay = config.reconnect.delay_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Broker not ready, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn log_event(envelope: Option<TaskEnvelope>) -> anyhow::Result<()> {
    let Some(envelope) = envelope else {
        debug!("Inbound event stream closed");
        return Ok(());
    };

    let body = envelope.decode_body()?;
    info!(
        task = envelope.task().unwrap_or("-"),
        id = envelope.id().unwrap_or("-"),
        args = body.args.len(),
        kwargs = body.kwargs.len(),
        "Inbound event"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}
