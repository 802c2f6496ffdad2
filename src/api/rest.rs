// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// `/health` is public. Every other endpoint requires a valid Bearer token
// via the `AuthBearer` extractor. CORS is permissive for the dashboard
// origin in development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;

/// Build the REST + SSE router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/pairs", get(pairs))
        .route("/balance/stream", get(crate::api::sse::balance_stream))
        .route("/decisions/stream", get(crate::api::sse::decision_stream))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: u64,
    server_time_ms: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: state.version.load(std::sync::atomic::Ordering::SeqCst),
        server_time_ms: chrono::Utc::now().timestamp_millis(),
    })
}

async fn pairs(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}
