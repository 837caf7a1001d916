//! HTTP request handlers for the task bridge.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::messaging::{BrokerConnectionManager, ConnectionState, PublishReceipt, TaskPublisher};
use crate::types::{BridgeConfig, TaskDescriptor};

/// Application state shared across handlers.
pub struct AppState {
    pub manager: Arc<BrokerConnectionManager>,
    pub publisher: TaskPublisher,
    pub config: BridgeConfig,
}

impl AppState {
    pub fn new(manager: Arc<BrokerConnectionManager>, config: BridgeConfig) -> Self {
        let publisher = TaskPublisher::from_config(manager.clone(), &config);
        Self {
            manager,
            publisher,
            config,
        }
    }
}

/// Routes served by the ingress.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/tasks", post(submit_task))
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    broker: ConnectionState,
    generation: u64,
}

/// Health check endpoint. Reports 503 while the broker is not ready.
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let lifecycle = state.manager.lifecycle();
    let (code, status) = match lifecycle.state {
        ConnectionState::Ready => (StatusCode::OK, "healthy"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            broker: lifecycle.state,
            generation: lifecycle.generation,
        }),
    )
}

/// Task submission request.
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub queue: String,
    #[serde(flatten)]
    pub task: TaskDescriptor,
    /// Wait for the broker to confirm the publish
    #[serde(default)]
    pub confirm: bool,
}

/// Publish a task to the outbound exchange.
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<PublishReceipt>), ApiError> {
    info!(
        queue = %request.queue,
        task = %request.task.task_name,
        confirm = request.confirm,
        "Received task submission"
    );

    let receipt = if request.confirm {
        state
            .publisher
            .publish_and_confirm(&request.queue, &request.task)
            .await?
    } else {
        state.publisher.publish(&request.queue, &request.task).await?
    };

    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Error body returned by the ingress.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// A [`BridgeError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(BridgeError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BridgeError::InvalidTask(_) | BridgeError::Serialization(_) => StatusCode::BAD_REQUEST,
            BridgeError::Topology(_) => StatusCode::CONFLICT,
            BridgeError::Publish(_) | BridgeError::Consume(_) => StatusCode::BAD_GATEWAY,
            BridgeError::NotInitialized
            | BridgeError::ConnectionClosed
            | BridgeError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::PublishTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(status = %status, error = %self.0, "task submission failed");
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
