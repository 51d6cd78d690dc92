use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics: pipeline counters and histograms in Prometheus text format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the metrics the pipeline emits.
pub fn describe() {
    metrics::describe_counter!(
        "pixelpipe_jobs_total",
        "Image jobs reaching a terminal status, by status"
    );
    metrics::describe_histogram!(
        "pixelpipe_job_duration_seconds",
        "Wall time from pipeline start to terminal status"
    );
    metrics::describe_counter!("pixelpipe_download_bytes_total", "Source image bytes downloaded");
    metrics::describe_counter!(
        "pixelpipe_download_failures_total",
        "Failed source downloads, by reason code"
    );
    metrics::describe_counter!(
        "pixelpipe_artifacts_uploaded_total",
        "Artifacts written to object storage, by type"
    );
    metrics::describe_counter!("pixelpipe_messages_total", "Queue messages settled, by outcome");
    metrics::describe_gauge!("pixelpipe_queue_depth", "Messages waiting in the pending list");
}
