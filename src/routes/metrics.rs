use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;

/// Install the Prometheus recorder for a process that serves `/metrics`
/// through its own router.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

/// Install the recorder together with a standalone scrape listener on `addr`.
/// Must be called from within a tokio runtime.
pub fn install_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "prediction_jobs_submitted_total",
        "Prediction jobs accepted and enqueued"
    );
    metrics::describe_counter!(
        "prediction_jobs_enqueue_failed_total",
        "Jobs persisted as Pending whose enqueue failed"
    );
    metrics::describe_counter!(
        "prediction_jobs_completed_total",
        "Jobs finalized as Done"
    );
    metrics::describe_counter!(
        "prediction_jobs_failed_total",
        "Jobs finalized as Failed"
    );
    metrics::describe_counter!(
        "prediction_jobs_unpersisted_total",
        "Job writes that failed after retries and were left for redelivery"
    );
    metrics::describe_counter!(
        "prediction_jobs_reconciled_total",
        "Stale Pending jobs re-enqueued by the reconciliation sweep"
    );
    metrics::describe_histogram!(
        "prediction_batch_seconds",
        "Time to process one worker batch"
    );
    metrics::describe_gauge!(
        "prediction_queue_depth",
        "Messages waiting in the work queue"
    );
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
