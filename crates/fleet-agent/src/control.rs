//! Local HTTP control surface of the daemon and its client.
//!
//! Routes, all answering with the resulting [`AgentStatus`]:
//! - `POST /start` with [`StartParams`]
//! - `POST /stop` with [`StopParams`]
//! - `POST /reset`
//! - `GET /status`

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::supervisor::{AgentStatus, AgentSupervisor, SupervisorError};

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParams {
    #[serde(default)]
    pub start_dataplane: bool,
    /// Run the system checker before starting.
    #[serde(default = "default_true")]
    pub check_system: bool,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            start_dataplane: false,
            check_system: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopParams {
    #[serde(default = "default_true")]
    pub stop_dataplane: bool,
}

impl Default for StopParams {
    fn default() -> Self {
        Self {
            stop_dataplane: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(SupervisorError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "Control request failed");
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<AgentStatus>, ApiError>;

async fn start_handler(
    State(supervisor): State<Arc<AgentSupervisor>>,
    Json(params): Json<StartParams>,
) -> ApiResult {
    supervisor
        .start(params.start_dataplane, params.check_system)
        .await
        .map_err(ApiError)?;
    Ok(Json(supervisor.status().await))
}

async fn stop_handler(
    State(supervisor): State<Arc<AgentSupervisor>>,
    Json(params): Json<StopParams>,
) -> ApiResult {
    supervisor
        .stop(params.stop_dataplane)
        .await
        .map_err(ApiError)?;
    Ok(Json(supervisor.status().await))
}

async fn reset_handler(State(supervisor): State<Arc<AgentSupervisor>>) -> ApiResult {
    supervisor.reset().await.map_err(ApiError)?;
    Ok(Json(supervisor.status().await))
}

async fn status_handler(State(supervisor): State<Arc<AgentSupervisor>>) -> Json<AgentStatus> {
    Json(supervisor.status().await)
}

/// Create the control router.
#[must_use]
pub fn router(supervisor: Arc<AgentSupervisor>) -> Router {
    Router::new()
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/reset", post(reset_handler))
        .route("/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// Serve the control surface on the loopback interface until `shutdown`.
///
/// # Errors
/// Returns error if the port cannot be bound.
pub async fn serve(
    supervisor: Arc<AgentSupervisor>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Control surface listening on http://{addr}");
    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Control client error.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Agent reported an error: {0}")]
    Daemon(String),
}

/// Outcome of a control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonReply {
    Done(AgentStatus),
    /// Nothing listens on the control port.
    NotRunning,
}

/// Client of a daemon's control surface.
pub struct ControlClient {
    client: reqwest::Client,
    base: String,
}

impl ControlClient {
    /// Create a client for the daemon listening on `port`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(port: u16, timeout: Duration) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: format!("http://127.0.0.1:{port}"),
        })
    }

    /// # Errors
    /// Returns error if the daemon fails the request or cannot be reached.
    pub async fn start(&self, params: StartParams) -> Result<DaemonReply, ControlError> {
        self.send(self.client.post(self.url("start")).json(&params))
            .await
    }

    /// # Errors
    /// Returns error if the daemon fails the request or cannot be reached.
    pub async fn stop(&self, params: StopParams) -> Result<DaemonReply, ControlError> {
        self.send(self.client.post(self.url("stop")).json(&params))
            .await
    }

    /// # Errors
    /// Returns error if the daemon fails the request or cannot be reached.
    pub async fn reset(&self) -> Result<DaemonReply, ControlError> {
        self.send(self.client.post(self.url("reset"))).await
    }

    /// # Errors
    /// Returns error if the daemon fails the request or cannot be reached.
    pub async fn status(&self) -> Result<DaemonReply, ControlError> {
        self.send(self.client.get(self.url("status"))).await
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{route}", self.base)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<DaemonReply, ControlError> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => return Ok(DaemonReply::NotRunning),
            Err(e) => return Err(e.into()),
        };
        if response.status().is_success() {
            return Ok(DaemonReply::Done(response.json().await?));
        }
        let status = response.status();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(ControlError::Daemon(message))
    }
}
