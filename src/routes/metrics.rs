use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint (text exposition format).
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the service emits.
pub fn describe() {
    metrics::describe_counter!("analysis_jobs_submitted_total", "Scans accepted by ingestion");
    metrics::describe_counter!("analysis_jobs_completed_total", "Analysis jobs completed");
    metrics::describe_counter!("analysis_jobs_failed_total", "Analysis attempts that ended in failed");
    metrics::describe_counter!(
        "analysis_job_retries_total",
        "Job-level retries, labelled by kind (manual or queue)"
    );
    metrics::describe_counter!("inference_attempts_total", "Outbound inference calls");
    metrics::describe_histogram!(
        "inference_duration_seconds",
        "Wall time of a successful inference call including retries"
    );
    metrics::describe_counter!("notifications_failed_total", "Notifications that could not be delivered");
    metrics::describe_gauge!("analysis_queue_depth", "Pending messages in the analysis queue");
}
