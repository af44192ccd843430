use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Instant;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub execution_mode: &'static str,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    /// Absent when jobs run inline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<ComponentHealth>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u64>,
}

impl ComponentHealth {
    fn ok(started: Instant) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms: Some(started.elapsed().as_millis() as u64),
            depth: None,
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
            depth: None,
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: dependency status for the job store and, in queued mode, the queue.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();
    let db_check = match state.jobs.health_check().await {
        Ok(()) => ComponentHealth::ok(start),
        Err(e) => {
            tracing::warn!(error = %e, "Job store health check failed");
            ComponentHealth::error()
        }
    };

    let strategy = state.executor.strategy();
    let queue_check = match strategy.queue() {
        Some(queue) => {
            let start = Instant::now();
            Some(match queue.health_check().await {
                Ok(()) => {
                    let mut check = ComponentHealth::ok(start);
                    check.depth = queue.depth().await.ok();
                    if let Some(depth) = check.depth {
                        metrics::gauge!("analysis_queue_depth").set(depth as f64);
                    }
                    check
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Queue health check failed");
                    ComponentHealth::error()
                }
            })
        }
        None => None,
    };

    let all_healthy = db_check.is_ok() && queue_check.as_ref().map_or(true, ComponentHealth::is_ok);
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        execution_mode: strategy.name(),
        checks: HealthChecks {
            database: db_check,
            queue: queue_check,
        },
    };

    (status_code, Json(response))
}
