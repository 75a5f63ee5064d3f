//! Health, metrics, and event-ingress HTTP surface.

use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use nervus_core::{Error, Event};
use serde::Serialize;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/events", post(ingest_event_handler))
        .route("/ws", get(crate::websocket::websocket_handler))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy", version: env!("CARGO_PKG_VERSION") })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.prometheus_text(),
    )
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn ingest_event_handler(State(state): State<AppState>, Json(event): Json<Event>) -> impl IntoResponse {
    match state.distributor.distribute_event(event).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            let status = match &err {
                Error::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
                Error::BackpressureDrop(_) | Error::CapReached(_) => StatusCode::TOO_MANY_REQUESTS,
                Error::Expired => StatusCode::GONE,
                Error::Validation(_) | Error::DecodeError { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ErrorBody { error: err.to_string() })).into_response()
        }
    }
}
