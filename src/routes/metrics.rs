use axum::extract::State;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for the OCR pipeline metrics.
pub fn describe_metrics() {
    metrics::describe_counter!("ocr_jobs_submitted_total", "Scans accepted into the OCR queue");
    metrics::describe_counter!(
        "ocr_jobs_rejected_total",
        "Scans rejected because the OCR queue was full"
    );
    metrics::describe_counter!("ocr_jobs_completed_total", "OCR jobs ending in completed");
    metrics::describe_counter!("ocr_jobs_failed_total", "OCR jobs ending in failed");
    metrics::describe_counter!(
        "ocr_retries_total",
        "Pipeline re-runs triggered by scans with no recognized panel"
    );
    metrics::describe_counter!(
        "ocr_persistence_faults_total",
        "Terminal writes that matched no pending record or could not be applied"
    );
    metrics::describe_counter!(
        "ocr_jobs_superseded_total",
        "OCR jobs dropped because a newer invocation owns the record"
    );
    metrics::describe_histogram!(
        "ocr_processing_seconds",
        "Time from job start to terminal outcome, excluding the write"
    );
    metrics::describe_gauge!("ocr_queue_depth", "Scans waiting for a worker");
}

/// GET /metrics — Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> String {
    handle.render()
}
