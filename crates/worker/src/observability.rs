use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use playbook_domain::ports::jobs::QueueDepth;

const JOBS_PROCESSED_TOTAL: &str = "playbook_worker_jobs_processed_total";
const JOBS_PROCESSING_DURATION_MS: &str = "playbook_worker_job_processing_duration_ms";
const QUEUE_READY_GAUGE: &str = "playbook_worker_queue_ready_total";
const QUEUE_PROCESSING_GAUGE: &str = "playbook_worker_queue_processing_total";
const QUEUE_LAG_GAUGE: &str = "playbook_worker_queue_lag_ms";
const DRAFTS_EXPIRED_TOTAL: &str = "playbook_worker_drafts_expired_total";
const JOBS_RECOVERED_TOTAL: &str = "playbook_worker_jobs_recovered_total";

/// Installs the recorder. A non-zero `port` also serves the Prometheus
/// exposition over HTTP.
pub fn init_metrics(port: u16) -> Result<()> {
    let builder = PrometheusBuilder::new();
    if port == 0 {
        builder.install_recorder()?;
    } else {
        builder.with_http_listener(([0, 0, 0, 0], port)).install()?;
    }
    Ok(())
}

pub fn register_job_processed(job_type: &str, result: &str, duration_ms: f64) {
    counter!(
        JOBS_PROCESSED_TOTAL,
        "job_type" => job_type.to_string(),
        "result" => result.to_string()
    )
    .increment(1);

    histogram!(
        JOBS_PROCESSING_DURATION_MS,
        "job_type" => job_type.to_string()
    )
    .record(duration_ms);
}

pub fn set_queue_depth(depth: &QueueDepth) {
    gauge!(QUEUE_READY_GAUGE).set(depth.ready as f64);
    gauge!(QUEUE_PROCESSING_GAUGE).set(depth.processing as f64);
}

pub fn set_queue_lag_ms(lag_ms: i64) {
    gauge!(QUEUE_LAG_GAUGE).set(lag_ms.max(0) as f64);
}

pub fn register_drafts_expired(count: usize) {
    counter!(DRAFTS_EXPIRED_TOTAL).increment(count as u64);
}

pub fn register_jobs_recovered(count: usize) {
    counter!(JOBS_RECOVERED_TOTAL).increment(count as u64);
}
