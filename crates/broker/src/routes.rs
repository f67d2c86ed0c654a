//! Route configuration.

use crate::broker::{Broker, HealthStatus};
use crate::metrics::metrics_handler;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the HTTP router serving health and metrics.
pub fn create_router(broker: Arc<Broker>) -> Router {
    Router::new()
        // Health check (unauthenticated, for supervisors and CI checks)
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Handler for GET /health.
///
/// Answers 503 once the shared server failed to start or stopped answering.
async fn health_check(State(broker): State<Arc<Broker>>) -> (StatusCode, Json<HealthStatus>) {
    let health = broker.health().await;
    let status = if health.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}
