use std::sync::Arc;

use playbook_domain::engine::AutomationEngine;
use playbook_domain::ports::db::DbAdapter;
use playbook_infra::config::AppConfig;
use playbook_infra::wiring::{Backends, build_engine};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: AutomationEngine,
    pub db: Option<Arc<dyn DbAdapter>>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<(Self, Backends)> {
        let (engine, backends) = build_engine(&config).await?;
        let state = Self {
            config,
            engine,
            db: backends.db.clone(),
        };
        Ok((state, backends))
    }

    #[cfg(test)]
    pub fn with_engine(config: AppConfig, engine: AutomationEngine) -> Self {
        Self {
            config,
            engine,
            db: None,
        }
    }
}
