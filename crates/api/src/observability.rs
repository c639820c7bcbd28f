use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use playbook_domain::apply::ApplyRun;
use playbook_domain::engine::TriggerResponse;

const HTTP_REQUESTS_TOTAL: &str = "playbook_api_http_requests_total";
const HTTP_REQUEST_DURATION_SECONDS: &str = "playbook_api_http_request_duration_seconds";
const HTTP_REQUEST_ERRORS_TOTAL: &str = "playbook_api_http_errors_total";
const TRIGGER_DECISIONS_TOTAL: &str = "playbook_api_trigger_decisions_total";
const APPLY_RUNS_TOTAL: &str = "playbook_api_apply_runs_total";
const APPLY_ITEMS_TOTAL: &str = "playbook_api_apply_items_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_http_request(method: &str, route: &str, status: StatusCode, elapsed: Duration) {
    let status_code = status.as_u16().to_string();
    let result = if status.is_server_error() {
        "error"
    } else {
        "success"
    };

    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code.clone(),
        "result" => result
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code.clone()
    )
    .record(elapsed.as_secs_f64());

    if status.is_server_error() {
        counter!(
            HTTP_REQUEST_ERRORS_TOTAL,
            "method" => method.to_string(),
            "route" => route.to_string(),
            "status" => status_code
        )
        .increment(1);
    }
}

pub fn register_trigger_decision(response: &TriggerResponse) {
    let (outcome, reason) = match response.suppressed_reason {
        Some(reason) => ("suppressed", reason.as_str()),
        None => ("allowed", "none"),
    };
    counter!(
        TRIGGER_DECISIONS_TOTAL,
        "outcome" => outcome,
        "reason" => reason
    )
    .increment(1);
}

pub fn register_apply_run(run: &ApplyRun) {
    let stopped_reason = match run.stopped_reason {
        Some(reason) => reason.as_str(),
        None => "none",
    };
    counter!(
        APPLY_RUNS_TOTAL,
        "outcome" => run.status.as_str(),
        "stopped_reason" => stopped_reason
    )
    .increment(1);

    for (result, count) in [
        ("updated", run.updated),
        ("skipped", run.skipped),
        ("failed", run.failed),
        ("unattempted", run.unattempted),
    ] {
        if count > 0 {
            counter!(APPLY_ITEMS_TOTAL, "result" => result).increment(u64::from(count));
        }
    }
}
