//! Axum JSON layer over the feed engine. All error translation to HTTP
//! lives here; the engine itself only speaks typed statuses and errors.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cof_engine::{EngineError, FeedEngine};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "cof-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FeedEngine>,
}

impl AppState {
    pub fn new(engine: Arc<FeedEngine>) -> Self {
        Self { engine }
    }
}

/// Engine error wrapper carrying the transport mapping.
struct WebError(EngineError);

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            EngineError::ProfileUnavailable => (
                StatusCode::BAD_REQUEST,
                "complete your profile first".to_string(),
            ),
            EngineError::RefreshInFlight { cluster_key } => (
                StatusCode::CONFLICT,
                format!("a refresh is already running for cluster {cluster_key}"),
            ),
            // Provider details stay server-side; the caller only learns the
            // upstream was unavailable.
            EngineError::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                "opportunity provider unavailable, try again later".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/feed/{user}", get(feed_handler))
        .route("/feed/{user}/refresh", post(refresh_handler))
        .route("/feed/{user}/click/{hash}", post(click_handler))
        .route("/feed/{user}/dismiss/{hash}", post(dismiss_handler))
        .route("/clusters", get(clusters_handler))
        .route("/fetch-log", get(fetch_log_handler))
        .with_state(state)
}

pub async fn serve_from_env(engine: Arc<FeedEngine>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("COF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving feed API");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn feed_handler(
    State(state): State<AppState>,
    AxumPath(user): AxumPath<String>,
) -> Response {
    let feed = state.engine.list_opportunities(&user).await;
    Json(feed).into_response()
}

async fn refresh_handler(
    State(state): State<AppState>,
    AxumPath(user): AxumPath<String>,
) -> Response {
    match state.engine.refresh_now(&user).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => WebError(err).into_response(),
    }
}

async fn click_handler(
    State(state): State<AppState>,
    AxumPath((user, hash)): AxumPath<(String, String)>,
) -> Response {
    state.engine.record_click(&user, &hash);
    Json(json!({ "recorded": true })).into_response()
}

async fn dismiss_handler(
    State(state): State<AppState>,
    AxumPath((user, hash)): AxumPath<(String, String)>,
) -> Response {
    state.engine.record_dismiss(&user, &hash);
    Json(json!({ "recorded": true })).into_response()
}

async fn clusters_handler(State(state): State<AppState>) -> Response {
    Json(state.engine.cluster_profiles()).into_response()
}

async fn fetch_log_handler(State(state): State<AppState>) -> Response {
    Json(state.engine.fetch_log()).into_response()
}
