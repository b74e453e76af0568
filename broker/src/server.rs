//! HTTP and WebSocket surface of the broker.
//!
//! - `GET /ws/worker`: admission, then WebSocket upgrade for a worker.
//! - `POST /work_generate`: JSON adapter over [`Dispatcher::dispatch`] for
//!   service principals.
//! - `GET /stats`: connected workers per bucket.
//! - `GET /metrics`: Prometheus text exposition.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use bpow_types::PrincipalKind;

use crate::admission::Admission;
use crate::connection::{serve_connection, ConnectionSettings};
use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::hub::HubHandle;
use crate::metrics::BrokerMetrics;
use crate::BrokerError;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub dispatcher: Dispatcher,
    pub admission: Arc<Admission>,
    pub metrics: Arc<BrokerMetrics>,
    pub connection: ConnectionSettings,
    pub enable_metrics: bool,
    next_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        hub: HubHandle,
        dispatcher: Dispatcher,
        admission: Arc<Admission>,
        metrics: Arc<BrokerMetrics>,
        connection: ConnectionSettings,
        enable_metrics: bool,
    ) -> Self {
        Self {
            hub,
            dispatcher,
            admission,
            metrics,
            connection,
            enable_metrics,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkGenerateBody {
    pub hash: String,
    #[serde(default = "default_multiplier")]
    pub difficulty_multiplier: i64,
}

fn default_multiplier() -> i64 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkGenerateReply {
    pub work: String,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = match self {
            BrokerError::InvalidHash(_) => StatusCode::BAD_REQUEST,
            BrokerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::HubClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/worker", get(worker_ws))
        .route("/work_generate", post(work_generate))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), BrokerError> {
    info!(addr = %listener.local_addr()?, "broker listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
    })
    .await?;
    Ok(())
}

async fn worker_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let (principal, addr) = match state.admission.admit(&headers, remote, &state.hub).await {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!(%remote, reason = %e, "worker refused");
            return e.into_response();
        }
    };

    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let settings = state.connection;
    let hub = state.hub.clone();
    ws.max_message_size(settings.max_message_size)
        .on_upgrade(move |socket| {
            serve_connection(socket, id, addr, principal.identity, hub, settings)
        })
}

async fn work_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WorkGenerateBody>,
) -> Response {
    let principal = match state.admission.principal(&headers, PrincipalKind::Service) {
        Ok(principal) => principal,
        Err(e) => return e.into_response(),
    };
    let request = DispatchRequest::new(body.hash, body.difficulty_multiplier, principal.identity);
    match state.dispatcher.dispatch(request).await {
        Ok(work) => Json(WorkGenerateReply { work }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.hub.counts().await {
        Ok(counts) => Json(serde_json::json!({
            "connected_workers": counts.total(),
            "buckets": counts,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    if !state.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.metrics.gather() {
        Ok(text) => text.into_response(),
        Err(e) => BrokerError::from(e).into_response(),
    }
}
