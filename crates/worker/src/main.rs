mod observability;

use std::time::Duration;

use playbook_domain::engine::AutomationEngine;
use playbook_domain::jobs::now_ms;
use playbook_domain::ports::jobs::JobQueueError;
use playbook_infra::consumer::{GenerationConsumer, JobReport};
use playbook_infra::wiring::{DataBackend, build_engine, build_generator};
use playbook_infra::{config::AppConfig, logging::init_tracing};
use tracing::info;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing("playbook-worker", &config)?;
    observability::init_metrics(config.worker_metrics_port)?;

    let (engine, backends) = build_engine(&config).await?;
    if backends.backend == DataBackend::Memory {
        tracing::warn!("memory backend: this worker only sees jobs enqueued in its own process");
    }
    let consumer = GenerationConsumer::new(
        backends.stores.jobs.clone(),
        engine.generation_service(build_generator(&config)?),
        Duration::from_millis(config.worker_poll_interval_ms.max(1)),
    );

    let recovered = consumer.recover(config.worker_requeue_batch).await?;
    observability::register_jobs_recovered(recovered);

    info!(
        poll_interval_ms = config.worker_poll_interval_ms,
        sweep_interval_ms = config.worker_sweep_interval_ms,
        "worker started"
    );

    let sweeper = tokio::spawn(sweep_expired_drafts(
        engine,
        Duration::from_millis(config.worker_sweep_interval_ms.max(1_000)),
    ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // A job interrupted by shutdown stays in processing and is requeued by
    // `recover` on the next start.
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            processed = consumer.process_next() => {
                handle_processed(&consumer, processed).await;
            }
        }
    }

    sweeper.abort();
    info!("worker shutdown");
    Ok(())
}

async fn sweep_expired_drafts(engine: AutomationEngine, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match engine.expire_stale(now_ms()).await {
            Ok(expired) => observability::register_drafts_expired(expired),
            Err(err) => tracing::error!(error = %err, "draft expiry sweep failed"),
        }
    }
}

async fn handle_processed(
    consumer: &GenerationConsumer,
    processed: Result<Option<JobReport>, JobQueueError>,
) {
    match processed {
        Ok(Some(report)) => {
            observability::register_job_processed(
                report.job_type.as_str(),
                report.result,
                report.duration_ms,
            );
            observability::set_queue_lag_ms(report.lag_ms);
            match consumer.queue().depth().await {
                Ok(depth) => observability::set_queue_depth(&depth),
                Err(err) => tracing::warn!(error = %err, "queue depth unavailable"),
            }
        }
        Ok(None) => {}
        Err(err) => {
            tracing::error!(error = %err, "job queue error");
            tokio::time::sleep(ERROR_BACKOFF).await;
        }
    }
}
