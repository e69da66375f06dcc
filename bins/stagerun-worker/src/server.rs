// HTTP surface of the worker: live log streams, health and metrics

use crate::log_hub::LogHub;
use crate::metrics;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub hub: LogHub,
    pub start_time: Arc<Instant>,
}

impl AppState {
    pub fn new(hub: LogHub) -> Self {
        Self {
            hub,
            start_time: Arc::new(Instant::now()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub jobs_in_flight: i64,
    pub viewers_attached: i64,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logs/:commit_sha", get(stream_logs))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
}

/// GET /logs/:commit_sha - Attach as the viewer of one job.
///
/// Each event carries `{"message": "..."}`. The stream ends when the job
/// finishes; a second concurrent viewer for the same job gets 409.
pub async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(commit_sha): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, (StatusCode, Json<serde_json::Value>)> {
    let Some(viewer) = state.hub.subscribe(&commit_sha) else {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("a viewer is already attached to {}", commit_sha)
            })),
        ));
    };

    let events = viewer.map(|message| Event::default().json_data(&message));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// GET /health - Liveness plus a little load information
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        jobs_in_flight: metrics::JOBS_IN_FLIGHT.get(),
        viewers_attached: metrics::VIEWERS_ATTACHED.get(),
    })
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler() -> Response {
    match metrics::render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve until `shutdown` flips to true
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new().merge(routes()).with_state(Arc::new(state));

    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}
