use std::time::Duration;

use playbook_domain::apply::ApplyConfig;
use playbook_domain::automations::PlanTier;
use playbook_domain::drafts::DraftConfig;
use playbook_domain::engine::EngineConfig;
use playbook_domain::generation::GenerationConfig;
use playbook_domain::quota::{Allowance, QuotaConfig, QuotaPolicy, QuotaResource};
use playbook_domain::triggers::TriggerGateConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub data_backend: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub api_request_timeout_ms: u64,
    pub api_rate_limit_per_second: u64,
    pub api_rate_limit_burst: u32,
    pub platform_base_url: String,
    pub platform_token: String,
    pub platform_timeout_ms: u64,
    pub generation_base_url: String,
    pub generation_timeout_ms: u64,
    pub apply_item_timeout_ms: u64,
    pub apply_run_lease_ms: u64,
    pub worker_queue_prefix: String,
    pub worker_poll_interval_ms: u64,
    pub worker_requeue_batch: usize,
    pub worker_sweep_interval_ms: u64,
    pub worker_metrics_port: u16,
    pub trigger_key_prefix: String,
    pub trigger_in_flight_ttl_ms: u64,
    pub trigger_retention_ms: u64,
    pub draft_ttl_ms: u64,
    pub draft_sample_size: usize,
    pub quota_window_ms: u64,
    pub quota_soft_threshold_pct: u8,
    pub quota_enforce: bool,
    pub quota_free_generation_limit: String,
    pub quota_free_apply_limit: String,
    pub quota_pro_generation_limit: String,
    pub quota_pro_apply_limit: String,
    pub quota_business_generation_limit: String,
    pub quota_business_apply_limit: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "playbook")?
            .set_default("surreal_db", "engine")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("api_request_timeout_ms", 30_000)?
            .set_default("api_rate_limit_per_second", 50)?
            .set_default("api_rate_limit_burst", 100)?
            .set_default("platform_base_url", "http://127.0.0.1:4000")?
            .set_default("platform_token", "")?
            .set_default("platform_timeout_ms", 5_000)?
            .set_default("generation_base_url", "http://127.0.0.1:4100")?
            .set_default("generation_timeout_ms", 30_000)?
            .set_default("apply_item_timeout_ms", 10_000)?
            .set_default("apply_run_lease_ms", 60_000)?
            .set_default("worker_queue_prefix", "playbook:jobs")?
            .set_default("worker_poll_interval_ms", 1_000)?
            .set_default("worker_requeue_batch", 100)?
            .set_default("worker_sweep_interval_ms", 60_000)?
            .set_default("worker_metrics_port", 9100)?
            .set_default("trigger_key_prefix", "playbook:trigger")?
            .set_default("trigger_in_flight_ttl_ms", 900_000)?
            .set_default("trigger_retention_ms", 2_592_000_000u64)?
            .set_default("draft_ttl_ms", 604_800_000u64)?
            .set_default("draft_sample_size", 3)?
            .set_default("quota_window_ms", 2_592_000_000u64)?
            .set_default("quota_soft_threshold_pct", 80)?
            .set_default("quota_enforce", true)?
            .set_default("quota_free_generation_limit", "50")?
            .set_default("quota_free_apply_limit", "25")?
            .set_default("quota_pro_generation_limit", "1000")?
            .set_default("quota_pro_apply_limit", "500")?
            .set_default("quota_business_generation_limit", "unlimited")?
            .set_default("quota_business_apply_limit", "unlimited")?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn is_test(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("test")
    }

    pub fn engine_config(&self) -> Result<EngineConfig, config::ConfigError> {
        Ok(EngineConfig {
            drafts: DraftConfig {
                ttl: Duration::from_millis(self.draft_ttl_ms),
                sample_size: self.draft_sample_size,
            },
            triggers: TriggerGateConfig {
                in_flight_ttl: Duration::from_millis(self.trigger_in_flight_ttl_ms),
            },
            quota: self.quota_config()?,
            apply: ApplyConfig {
                item_timeout: Duration::from_millis(self.apply_item_timeout_ms),
                run_lease: Duration::from_millis(self.apply_run_lease_ms),
            },
            generation: GenerationConfig {
                call_timeout: Duration::from_millis(self.generation_timeout_ms),
            },
        })
    }

    fn quota_config(&self) -> Result<QuotaConfig, config::ConfigError> {
        let limits = [
            (PlanTier::Free, QuotaResource::GenerationCall, "quota_free_generation_limit", &self.quota_free_generation_limit),
            (PlanTier::Free, QuotaResource::AppliedChange, "quota_free_apply_limit", &self.quota_free_apply_limit),
            (PlanTier::Pro, QuotaResource::GenerationCall, "quota_pro_generation_limit", &self.quota_pro_generation_limit),
            (PlanTier::Pro, QuotaResource::AppliedChange, "quota_pro_apply_limit", &self.quota_pro_apply_limit),
            (PlanTier::Business, QuotaResource::GenerationCall, "quota_business_generation_limit", &self.quota_business_generation_limit),
            (PlanTier::Business, QuotaResource::AppliedChange, "quota_business_apply_limit", &self.quota_business_apply_limit),
        ];

        let mut quota = QuotaConfig::new(Duration::from_millis(self.quota_window_ms));
        for (tier, resource, name, raw) in limits {
            let limit = Allowance::parse(raw).ok_or_else(|| {
                config::ConfigError::Message(format!(
                    "{name} must be a number or 'unlimited', got '{raw}'"
                ))
            })?;
            quota = quota.with_policy(
                tier,
                resource,
                QuotaPolicy {
                    limit,
                    soft_threshold_pct: self.quota_soft_threshold_pct.min(100),
                    enforce: self.quota_enforce,
                },
            );
        }
        Ok(quota)
    }
}
