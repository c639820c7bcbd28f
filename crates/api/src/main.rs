mod error;
mod middleware;
mod observability;
mod routes;
mod state;
mod validation;

use std::net::SocketAddr;
use std::time::Duration;

use playbook_domain::jobs::now_ms;
use playbook_infra::consumer::GenerationConsumer;
use playbook_infra::wiring::{Backends, DataBackend, build_generator};
use playbook_infra::{config::AppConfig, logging::init_tracing};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing("playbook-api", &config)?;
    observability::init_metrics()?;

    let (state, backends) = state::AppState::new(config.clone()).await?;
    if backends.backend == DataBackend::Memory {
        spawn_in_process_worker(&config, &state, &backends)?;
    }
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "starting api");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "server exited");
        err
    })?;

    Ok(())
}

/// The in-memory job queue is not shared across processes, so with the
/// memory backend the api consumes its own generation jobs and sweeps
/// expired drafts.
fn spawn_in_process_worker(
    config: &AppConfig,
    state: &state::AppState,
    backends: &Backends,
) -> anyhow::Result<()> {
    let consumer = GenerationConsumer::new(
        backends.stores.jobs.clone(),
        state.engine.generation_service(build_generator(config)?),
        Duration::from_millis(config.worker_poll_interval_ms),
    );
    tokio::spawn(async move {
        loop {
            match consumer.process_next().await {
                Ok(Some(report)) => {
                    tracing::debug!(job_id = %report.job_id, result = report.result, "job processed");
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(error = %err, "in-process job consumer failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let engine = state.engine.clone();
    let sweep_every = Duration::from_millis(config.worker_sweep_interval_ms.max(1_000));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            if let Err(err) = engine.expire_stale(now_ms()).await {
                tracing::error!(error = %err, "draft expiry sweep failed");
            }
        }
    });

    info!("in-process generation worker started");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
