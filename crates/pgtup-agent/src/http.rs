//! HTTP surface: Prometheus scrape endpoint and liveness probe.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::compression::CompressionLayer;
use tracing::error;

use pgtup_core::Publisher;

pub(crate) fn router(publisher: Arc<Publisher>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .with_state(publisher)
        .layer(CompressionLayer::new())
}

/// Read-only view of the registry; safe while the driver is mid-tick.
async fn handle_metrics(State(publisher): State<Arc<Publisher>>) -> Response {
    match publisher.render() {
        Ok(body) => ([(header::CONTENT_TYPE, publisher.content_type())], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn handle_health() -> &'static str {
    "ok"
}
