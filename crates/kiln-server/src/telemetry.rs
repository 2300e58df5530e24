use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};
use axum::response::IntoResponse;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::routes::AppState;

/// Install the global Prometheus recorder and describe kiln's metrics
pub fn install() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!("kiln_jobs_total", "Jobs finished, by action and status");
    describe_histogram!("kiln_job_duration_ms", "Job duration in milliseconds");
    describe_counter!(
        "kiln_admission_rejected_total",
        "Jobs turned away by admission control"
    );
    describe_gauge!("kiln_active_jobs", "Jobs holding a running slot");

    Ok(handle)
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    let Some(handle) = state.prometheus else {
        return (StatusCode::NOT_FOUND, HeaderMap::new(), String::new());
    };
    handle.run_upkeep();
    let body = handle.render();
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    (StatusCode::OK, headers, body)
}
