use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::jobs::now_ms;
use crate::ports::BoxFuture;
use crate::ports::triggers::{CasOutcome, PutOutcome, TriggerRecordStore, TriggerStoreError};
use crate::util::{join_key_parts, prefixed_id, truncate_message};

const MAX_DECISION_ROUNDS: usize = 4;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    IssueDetected,
    CatalogSync,
    ScheduledRecheck,
    UserAction,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssueDetected => "issue_detected",
            Self::CatalogSync => "catalog_sync",
            Self::ScheduledRecheck => "scheduled_recheck",
            Self::UserAction => "user_action",
        }
    }
}

impl FromStr for TriggerType {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "issue_detected" => Ok(Self::IssueDetected),
            "catalog_sync" => Ok(Self::CatalogSync),
            "scheduled_recheck" => Ok(Self::ScheduledRecheck),
            "user_action" => Ok(Self::UserAction),
            _ => Err("unknown trigger type"),
        }
    }
}

/// Idempotency record key. The content hash makes a change to the target's
/// content a different key entirely.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TriggerKey {
    pub trigger_type: TriggerType,
    pub owner_id: String,
    pub automation_id: String,
    pub target_id: String,
    pub content_hash: String,
}

impl TriggerKey {
    pub fn new(
        trigger_type: TriggerType,
        owner_id: impl Into<String>,
        automation_id: impl Into<String>,
        target_id: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            trigger_type,
            owner_id: owner_id.into(),
            automation_id: automation_id.into(),
            target_id: target_id.into(),
            content_hash: content_hash.into(),
        }
    }

    pub fn cache_key(&self, prefix: &str) -> String {
        let parts = join_key_parts([
            self.trigger_type.as_str(),
            self.owner_id.as_str(),
            self.automation_id.as_str(),
            self.target_id.as_str(),
            self.content_hash.as_str(),
        ]);
        format!("{prefix}:{parts}")
    }

    fn validate(&self) -> DomainResult<()> {
        let parts = [
            ("owner_id", &self.owner_id),
            ("automation_id", &self.automation_id),
            ("target_id", &self.target_id),
            ("content_hash", &self.content_hash),
        ];
        for (name, value) in parts {
            if value.trim().is_empty() {
                return Err(DomainError::Validation(format!("{name} is required")));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TriggerRecord {
    pub run_id: String,
    pub key: TriggerKey,
    pub status: TriggerStatus,
    pub attempts: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub error_message: Option<String>,
}

impl TriggerRecord {
    fn queued(key: &TriggerKey, now: i64) -> Self {
        Self {
            run_id: prefixed_id("trg"),
            key: key.clone(),
            status: TriggerStatus::Queued,
            attempts: 1,
            created_at_ms: now,
            updated_at_ms: now,
            completed_at_ms: None,
            error_message: None,
        }
    }

    /// Same key, fresh run: used for `FAILED -> QUEUED` and stale reclaim.
    fn requeued(&self, now: i64) -> Self {
        Self {
            run_id: prefixed_id("trg"),
            key: self.key.clone(),
            status: TriggerStatus::Queued,
            attempts: self.attempts.saturating_add(1),
            created_at_ms: self.created_at_ms,
            updated_at_ms: now,
            completed_at_ms: None,
            error_message: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    SettingDisabled,
    PlanIneligible,
    InFlight,
    IdempotentAlreadyDone,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SettingDisabled => "setting_disabled",
            Self::PlanIneligible => "plan_ineligible",
            Self::InFlight => "in_flight",
            Self::IdempotentAlreadyDone => "idempotent_already_done",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerDecision {
    Allow { run_id: String, retried: bool },
    Suppress(SuppressReason),
}

#[derive(Clone, Debug)]
pub struct TriggerInput {
    pub key: TriggerKey,
    pub setting_enabled: bool,
    pub plan_eligible: bool,
}

#[derive(Clone, Debug)]
pub struct TriggerGateConfig {
    /// Time without an update after which a queued or running record is
    /// treated as abandoned. Running jobs heartbeat before each generation
    /// call, so this must exceed the generation call timeout.
    pub in_flight_ttl: Duration,
}

impl Default for TriggerGateConfig {
    fn default() -> Self {
        Self {
            in_flight_ttl: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Clone)]
pub struct TriggerGate {
    store: Arc<dyn TriggerRecordStore>,
    config: TriggerGateConfig,
}

impl TriggerGate {
    pub fn new(store: Arc<dyn TriggerRecordStore>, config: TriggerGateConfig) -> Self {
        Self { store, config }
    }

    pub async fn evaluate_trigger(&self, input: &TriggerInput) -> DomainResult<TriggerDecision> {
        if !input.setting_enabled {
            return Ok(suppress(&input.key, SuppressReason::SettingDisabled));
        }
        if !input.plan_eligible {
            return Ok(suppress(&input.key, SuppressReason::PlanIneligible));
        }
        input.key.validate()?;

        let key = &input.key;
        for _ in 0..MAX_DECISION_ROUNDS {
            let now = now_ms();
            let Some(existing) = self.store.get(key).await? else {
                let record = TriggerRecord::queued(key, now);
                match self.store.put_if_absent(key, &record).await? {
                    PutOutcome::Stored => return Ok(allow(key, record.run_id, false)),
                    PutOutcome::Existing(_) => continue,
                }
            };

            match existing.status {
                TriggerStatus::Succeeded => {
                    return Ok(suppress(key, SuppressReason::IdempotentAlreadyDone));
                }
                TriggerStatus::Queued | TriggerStatus::Running
                    if !self.is_abandoned(&existing, now) =>
                {
                    return Ok(suppress(key, SuppressReason::InFlight));
                }
                TriggerStatus::Queued | TriggerStatus::Running | TriggerStatus::Failed => {
                    if existing.status.is_in_flight() {
                        tracing::warn!(
                            run_id = %existing.run_id,
                            status = existing.status.as_str(),
                            "reclaiming abandoned trigger record"
                        );
                    }
                    let record = existing.requeued(now);
                    match self
                        .store
                        .compare_and_set(key, existing.status, &existing.run_id, &record)
                        .await?
                    {
                        CasOutcome::Updated => return Ok(allow(key, record.run_id, true)),
                        CasOutcome::Mismatch(_) => continue,
                    }
                }
            }
        }
        Err(DomainError::Conflict)
    }

    pub async fn get_record(&self, key: &TriggerKey) -> DomainResult<Option<TriggerRecord>> {
        Ok(self.store.get(key).await?)
    }

    /// `QUEUED -> RUNNING`. Returns `false` when the record has moved on
    /// (another run owns the key), in which case the job must not proceed.
    pub async fn mark_running(&self, key: &TriggerKey, run_id: &str) -> DomainResult<bool> {
        self.transition(key, run_id, &[TriggerStatus::Queued], |record, now| {
            record.status = TriggerStatus::Running;
            record.updated_at_ms = now;
        })
        .await
    }

    /// Refreshes `updated_at_ms` on a running record so it is not taken for
    /// abandoned. Returns `false` once another run owns the key.
    pub async fn heartbeat(&self, key: &TriggerKey, run_id: &str) -> DomainResult<bool> {
        self.transition(key, run_id, &[TriggerStatus::Running], |record, now| {
            record.updated_at_ms = now;
        })
        .await
    }

    pub async fn mark_succeeded(&self, key: &TriggerKey, run_id: &str) -> DomainResult<bool> {
        self.transition(key, run_id, &[TriggerStatus::Running], |record, now| {
            record.status = TriggerStatus::Succeeded;
            record.updated_at_ms = now;
            record.completed_at_ms = Some(now);
        })
        .await
    }

    /// Failing a queued record covers work that never reached a worker.
    pub async fn mark_failed(
        &self,
        key: &TriggerKey,
        run_id: &str,
        message: &str,
    ) -> DomainResult<bool> {
        let message = truncate_message(message);
        self.transition(
            key,
            run_id,
            &[TriggerStatus::Queued, TriggerStatus::Running],
            |record, now| {
                record.status = TriggerStatus::Failed;
                record.updated_at_ms = now;
                record.completed_at_ms = Some(now);
                record.error_message = Some(message.clone());
            },
        )
        .await
    }

    fn is_abandoned(&self, record: &TriggerRecord, now: i64) -> bool {
        let ttl_ms = self.config.in_flight_ttl.as_millis() as i64;
        ttl_ms > 0 && now.saturating_sub(record.updated_at_ms) >= ttl_ms
    }

    async fn transition<F>(
        &self,
        key: &TriggerKey,
        run_id: &str,
        from: &[TriggerStatus],
        update: F,
    ) -> DomainResult<bool>
    where
        F: Fn(&mut TriggerRecord, i64),
    {
        for _ in 0..MAX_DECISION_ROUNDS {
            let Some(current) = self.store.get(key).await? else {
                return Ok(false);
            };
            if current.run_id != run_id || !from.contains(&current.status) {
                tracing::debug!(
                    run_id,
                    current_run_id = %current.run_id,
                    status = current.status.as_str(),
                    "trigger record transition skipped"
                );
                return Ok(false);
            }
            let mut next = current.clone();
            update(&mut next, now_ms());
            match self
                .store
                .compare_and_set(key, current.status, run_id, &next)
                .await?
            {
                CasOutcome::Updated => return Ok(true),
                CasOutcome::Mismatch(_) => continue,
            }
        }
        Err(DomainError::Conflict)
    }
}

fn allow(key: &TriggerKey, run_id: String, retried: bool) -> TriggerDecision {
    tracing::info!(
        owner_id = %key.owner_id,
        automation_id = %key.automation_id,
        target_id = %key.target_id,
        run_id = %run_id,
        retried,
        "trigger allowed"
    );
    TriggerDecision::Allow { run_id, retried }
}

fn suppress(key: &TriggerKey, reason: SuppressReason) -> TriggerDecision {
    tracing::debug!(
        owner_id = %key.owner_id,
        automation_id = %key.automation_id,
        target_id = %key.target_id,
        reason = reason.as_str(),
        "trigger suppressed"
    );
    TriggerDecision::Suppress(reason)
}

#[derive(Clone, Debug)]
pub struct InMemoryTriggerRecordStore {
    prefix: String,
    inner: Arc<Mutex<HashMap<String, TriggerRecord>>>,
}

impl InMemoryTriggerRecordStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cache_key(&self, key: &TriggerKey) -> String {
        key.cache_key(&self.prefix)
    }
}

fn lock_error<T>(_: T) -> TriggerStoreError {
    TriggerStoreError::Store("trigger store lock poisoned".into())
}

impl TriggerRecordStore for InMemoryTriggerRecordStore {
    fn get(
        &self,
        key: &TriggerKey,
    ) -> BoxFuture<'_, Result<Option<TriggerRecord>, TriggerStoreError>> {
        let cache_key = self.cache_key(key);
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.lock().map_err(lock_error)?;
            Ok(guard.get(&cache_key).cloned())
        })
    }

    fn put_if_absent(
        &self,
        key: &TriggerKey,
        record: &TriggerRecord,
    ) -> BoxFuture<'_, Result<PutOutcome, TriggerStoreError>> {
        let cache_key = self.cache_key(key);
        let inner = self.inner.clone();
        let record = record.clone();
        Box::pin(async move {
            let mut guard = inner.lock().map_err(lock_error)?;
            if let Some(existing) = guard.get(&cache_key) {
                return Ok(PutOutcome::Existing(existing.clone()));
            }
            guard.insert(cache_key, record);
            Ok(PutOutcome::Stored)
        })
    }

    fn compare_and_set(
        &self,
        key: &TriggerKey,
        expected_status: TriggerStatus,
        expected_run_id: &str,
        record: &TriggerRecord,
    ) -> BoxFuture<'_, Result<CasOutcome, TriggerStoreError>> {
        let cache_key = self.cache_key(key);
        let inner = self.inner.clone();
        let expected_run_id = expected_run_id.to_string();
        let record = record.clone();
        Box::pin(async move {
            let mut guard = inner.lock().map_err(lock_error)?;
            match guard.get(&cache_key) {
                Some(current)
                    if current.status == expected_status
                        && current.run_id == expected_run_id =>
                {
                    guard.insert(cache_key, record);
                    Ok(CasOutcome::Updated)
                }
                current => Ok(CasOutcome::Mismatch(current.cloned())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_includes_every_key_part() {
        let key = TriggerKey::new(
            TriggerType::CatalogSync,
            "shop-1",
            "seo-title",
            "p-1",
            "content_abc",
        );
        assert_eq!(
            key.cache_key("playbook:trigger"),
            "playbook:trigger:catalog_sync:shop-1:seo-title:p-1:content_abc"
        );
    }

    #[test]
    fn cache_key_separates_parts_containing_colons() {
        let joined = TriggerKey::new(TriggerType::UserAction, "shop:1", "seo", "p", "h");
        let split = TriggerKey::new(TriggerType::UserAction, "shop", "1:seo", "p", "h");
        assert_ne!(joined.cache_key("t"), split.cache_key("t"));

        let gid = TriggerKey::new(TriggerType::UserAction, "shop-1", "seo", "gid://p/1", "h");
        assert_eq!(gid.cache_key("t"), "t:user_action:shop-1:seo:gid%3A//p/1:h");
    }

    #[test]
    fn requeued_record_gets_fresh_run_and_counts_attempts() {
        let key = TriggerKey::new(TriggerType::UserAction, "o", "a", "t", "h");
        let mut record = TriggerRecord::queued(&key, 10);
        record.status = TriggerStatus::Failed;
        record.error_message = Some("boom".to_string());
        let next = record.requeued(20);
        assert_ne!(next.run_id, record.run_id);
        assert_eq!(next.attempts, 2);
        assert_eq!(next.status, TriggerStatus::Queued);
        assert_eq!(next.created_at_ms, 10);
        assert_eq!(next.error_message, None);
    }

    #[test]
    fn suppress_reasons_use_snake_case_codes() {
        assert_eq!(SuppressReason::InFlight.as_str(), "in_flight");
        assert_eq!(
            serde_json::to_value(SuppressReason::IdempotentAlreadyDone).expect("json"),
            serde_json::json!("idempotent_already_done")
        );
    }
}
