use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod analysis;
pub mod auth;
pub mod error;
pub mod health;
pub mod metrics;

/// Room for multipart boundaries and the text fields next to the image.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the API router. `/metrics` is only mounted when a recorder handle
/// is supplied.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let body_limit = state.ingestor.max_upload_bytes() + MULTIPART_OVERHEAD;

    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/analyses", post(analysis::submit_analysis))
        .route("/api/v1/analyses/{job_id}", get(analysis::get_analysis))
        .route(
            "/api/v1/analyses/{job_id}/retry",
            post(analysis::retry_analysis),
        )
        .with_state(state);

    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    app.layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
