use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use playbook_domain::engine::{AutomationEngine, EngineCollaborators, EngineStores};
use playbook_domain::ports::collaborators::GenerationCapability;
use playbook_domain::ports::db::DbAdapter;
use playbook_domain::ports::jobs::JobQueue;
use playbook_domain::triggers::InMemoryTriggerRecordStore;

use crate::config::AppConfig;
use crate::connectors::{GenerationClient, PlatformClient};
use crate::db::{SurrealConnection, SurrealSettings};
use crate::jobs::{InMemoryJobQueue, RedisJobQueue};
use crate::repositories::{
    InMemoryApplyRunRepository, InMemoryDraftRepository, InMemoryQuotaLedgerRepository,
    SurrealApplyRunRepository, SurrealDraftRepository, SurrealQuotaLedgerRepository,
    ensure_schema,
};
use crate::triggers::RedisTriggerRecordStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataBackend {
    Memory,
    Surreal,
}

impl DataBackend {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        match config.data_backend.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "surreal" | "surrealdb" => Ok(Self::Surreal),
            other => bail!("unsupported data_backend '{other}', expected memory or surreal"),
        }
    }
}

/// Storage handles for one process. `db` is set when a database backs the
/// stores and is used for health reporting.
#[derive(Clone)]
pub struct Backends {
    pub backend: DataBackend,
    pub stores: EngineStores,
    pub db: Option<Arc<dyn DbAdapter>>,
}

pub fn memory_stores(trigger_key_prefix: &str) -> EngineStores {
    EngineStores {
        drafts: Arc::new(InMemoryDraftRepository::new()),
        apply_runs: Arc::new(InMemoryApplyRunRepository::new()),
        quota_ledger: Arc::new(InMemoryQuotaLedgerRepository::new()),
        trigger_records: Arc::new(InMemoryTriggerRecordStore::new(trigger_key_prefix)),
        jobs: Arc::new(InMemoryJobQueue::new()),
    }
}

pub async fn build_backends(config: &AppConfig) -> anyhow::Result<Backends> {
    let backend = DataBackend::from_config(config)?;
    match backend {
        DataBackend::Memory => {
            tracing::warn!("using in-memory stores; state is lost on restart");
            Ok(Backends {
                backend,
                stores: memory_stores(&config.trigger_key_prefix),
                db: None,
            })
        }
        DataBackend::Surreal => {
            let connection = SurrealConnection::open(SurrealSettings::from_app_config(config)?)
                .await
                .context("open surreal session")?;
            let client = connection.client();
            ensure_schema(&client).await.context("define surreal schema")?;

            let trigger_records = RedisTriggerRecordStore::connect_with_prefix(
                &config.redis_url,
                config.trigger_key_prefix.clone(),
                Duration::from_millis(config.trigger_retention_ms),
            )
            .await
            .context("connect trigger record store")?;
            let jobs: Arc<dyn JobQueue> = Arc::new(
                RedisJobQueue::connect_with_prefix(
                    &config.redis_url,
                    config.worker_queue_prefix.clone(),
                )
                .await
                .context("connect job queue")?,
            );

            Ok(Backends {
                backend,
                stores: EngineStores {
                    drafts: Arc::new(SurrealDraftRepository::with_client(client.clone())),
                    apply_runs: Arc::new(SurrealApplyRunRepository::with_client(client.clone())),
                    quota_ledger: Arc::new(SurrealQuotaLedgerRepository::with_client(client)),
                    trigger_records: Arc::new(trigger_records),
                    jobs,
                },
                db: Some(Arc::new(connection)),
            })
        }
    }
}

pub fn build_collaborators(config: &AppConfig) -> anyhow::Result<EngineCollaborators> {
    let platform = Arc::new(PlatformClient::from_config(config).context("platform client")?);
    Ok(EngineCollaborators {
        targets: platform.clone(),
        settings: platform.clone(),
        connector: platform.clone(),
        roles: platform.clone(),
        issues: platform.clone(),
        approvals: platform,
    })
}

pub fn build_generator(config: &AppConfig) -> anyhow::Result<Arc<dyn GenerationCapability>> {
    Ok(Arc::new(
        GenerationClient::from_config(config).context("generation client")?,
    ))
}

pub async fn build_engine(config: &AppConfig) -> anyhow::Result<(AutomationEngine, Backends)> {
    let backends = build_backends(config).await?;
    let collaborators = build_collaborators(config)?;
    let engine_config = config.engine_config().context("engine config")?;
    let engine = AutomationEngine::new(backends.stores.clone(), collaborators, engine_config);
    Ok((engine, backends))
}
