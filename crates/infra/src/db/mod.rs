use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use playbook_domain::ports::BoxFuture;
use playbook_domain::ports::db::{DbAdapter, DbError};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use url::Url;

use crate::config::AppConfig;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_SURREAL_PORT: u16 = 8000;

/// Where the draft, apply run and quota tables live.
#[derive(Debug, Clone)]
pub struct SurrealSettings {
    pub address: String,
    pub namespace: String,
    pub database: String,
    username: String,
    password: String,
}

impl SurrealSettings {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, DbError> {
        Ok(Self {
            address: ws_address(&config.surreal_endpoint)?,
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        })
    }
}

/// A signed-in session shared by every Surreal repository.
#[derive(Clone)]
pub struct SurrealConnection {
    settings: SurrealSettings,
    client: Arc<Surreal<Client>>,
}

impl SurrealConnection {
    pub async fn open(settings: SurrealSettings) -> anyhow::Result<Self> {
        let client = Surreal::<Client>::init();
        client
            .connect::<Ws>(settings.address.as_str())
            .await
            .with_context(|| format!("connect to {}", settings.address))?;
        client
            .signin(Root {
                username: settings.username.clone(),
                password: settings.password.clone(),
            })
            .await
            .context("surreal signin")?;
        client
            .use_ns(&settings.namespace)
            .use_db(&settings.database)
            .await?;
        tracing::info!(
            address = %settings.address,
            namespace = %settings.namespace,
            database = %settings.database,
            "surreal session ready"
        );
        Ok(Self {
            settings,
            client: Arc::new(client),
        })
    }

    pub fn client(&self) -> Arc<Surreal<Client>> {
        self.client.clone()
    }
}

impl DbAdapter for SurrealConnection {
    fn name(&self) -> &'static str {
        "surrealdb"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async move {
            match tokio::time::timeout(HEALTH_TIMEOUT, self.client.health()).await {
                Ok(Ok(())) => {
                    tracing::debug!(address = %self.settings.address, "surreal healthy");
                    Ok(())
                }
                Ok(Err(err)) => Err(DbError::Unavailable(format!("surreal health: {err}"))),
                Err(_) => Err(DbError::Unavailable(format!(
                    "surreal health timed out after {}ms",
                    HEALTH_TIMEOUT.as_millis()
                ))),
            }
        })
    }
}

/// The websocket engine takes `host:port`; configured endpoints may carry a
/// `ws://` or `http://` scheme.
fn ws_address(endpoint: &str) -> Result<String, DbError> {
    let endpoint = endpoint.trim();
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let parsed = Url::parse(&with_scheme)
        .map_err(|err| DbError::Unavailable(format!("bad surreal endpoint {endpoint:?}: {err}")))?;
    if !matches!(parsed.scheme(), "ws" | "http") {
        return Err(DbError::Unavailable(format!(
            "unsupported surreal scheme {:?}",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| DbError::Unavailable(format!("surreal endpoint {endpoint:?} has no host")))?;
    let port = parsed.port().unwrap_or(DEFAULT_SURREAL_PORT);
    Ok(format!("{host}:{port}"))
}
