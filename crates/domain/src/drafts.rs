use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::jobs::now_ms;
use crate::ports::collaborators::RoleResolver;
use crate::ports::drafts::DraftRepository;
use crate::util::join_key_parts;

const MAX_SUGGESTION_LENGTH: usize = 5_000;
const MAX_UPDATE_ATTEMPTS: usize = 4;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Partial,
    Ready,
    Applied,
    Expired,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Partial => "partial",
            Self::Ready => "ready",
            Self::Applied => "applied",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }
}

impl FromStr for DraftStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "partial" => Ok(Self::Partial),
            "ready" => Ok(Self::Ready),
            "applied" => Ok(Self::Applied),
            "expired" => Ok(Self::Expired),
            _ => Err("unknown draft status"),
        }
    }
}

/// Identity of cached draft content: who, which automation, over which
/// targets, under which rules.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DraftKey {
    pub owner_id: String,
    pub automation_id: String,
    pub scope_id: String,
    pub rules_hash: String,
}

impl DraftKey {
    pub fn new(
        owner_id: impl Into<String>,
        automation_id: impl Into<String>,
        scope_id: impl Into<String>,
        rules_hash: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            automation_id: automation_id.into(),
            scope_id: scope_id.into(),
            rules_hash: rules_hash.into(),
        }
    }

    pub fn storage_key(&self) -> String {
        join_key_parts([
            self.owner_id.as_str(),
            self.automation_id.as_str(),
            self.scope_id.as_str(),
            self.rules_hash.as_str(),
        ])
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DraftItem {
    pub target_id: String,
    pub raw_suggestion: String,
    pub final_suggestion: String,
    pub current_value: Option<String>,
    pub generated_at_ms: i64,
    pub edited_by: Option<String>,
    pub edited_at_ms: Option<i64>,
}

impl DraftItem {
    /// The content apply would write, if any.
    pub fn usable_suggestion(&self) -> Option<&str> {
        let value = self.final_suggestion.trim();
        if value.is_empty() { None } else { Some(value) }
    }
}

/// Output of one generation call, ready to be appended to a draft.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GeneratedItem {
    pub target_id: String,
    pub suggestion: String,
    pub current_value: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Draft {
    pub draft_id: String,
    pub owner_id: String,
    pub automation_id: String,
    pub scope_id: String,
    pub rules_hash: String,
    pub status: DraftStatus,
    pub target_field: String,
    pub target_ids: Vec<String>,
    pub sample_target_ids: Vec<String>,
    pub items: Vec<DraftItem>,
    pub version: u64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub expires_at_ms: i64,
    pub applied_at_ms: Option<i64>,
    pub expired_at_ms: Option<i64>,
}

impl Draft {
    pub fn key(&self) -> DraftKey {
        DraftKey::new(
            self.owner_id.clone(),
            self.automation_id.clone(),
            self.scope_id.clone(),
            self.rules_hash.clone(),
        )
    }

    pub fn item_for(&self, target_id: &str) -> Option<&DraftItem> {
        self.items.iter().find(|item| item.target_id == target_id)
    }

    pub fn missing_target_ids(&self) -> Vec<String> {
        let present: HashSet<&str> = self
            .items
            .iter()
            .map(|item| item.target_id.as_str())
            .collect();
        self.target_ids
            .iter()
            .filter(|target_id| !present.contains(target_id.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_target_ids().is_empty()
    }

    /// Expired either by status or by time, whichever comes first.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.status == DraftStatus::Expired || self.expires_at_ms <= now_ms
    }
}

/// Everything needed to create a draft for a key.
#[derive(Clone, Debug)]
pub struct DraftSeed {
    pub key: DraftKey,
    pub target_field: String,
    pub target_ids: Vec<String>,
    pub sample_target_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpdatedItem {
    pub draft_id: String,
    pub item_index: usize,
    pub item: DraftItem,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MarkApplied {
    Applied(Draft),
    AlreadyApplied(Draft),
}

impl MarkApplied {
    pub fn into_draft(self) -> Draft {
        match self {
            Self::Applied(draft) | Self::AlreadyApplied(draft) => draft,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DraftConfig {
    pub ttl: Duration,
    pub sample_size: usize,
}

impl Default for DraftConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60 * 24 * 7),
            sample_size: 3,
        }
    }
}

#[derive(Clone)]
pub struct DraftService {
    repository: Arc<dyn DraftRepository>,
    roles: Arc<dyn RoleResolver>,
    config: DraftConfig,
}

impl DraftService {
    pub fn new(
        repository: Arc<dyn DraftRepository>,
        roles: Arc<dyn RoleResolver>,
        config: DraftConfig,
    ) -> Self {
        Self {
            repository,
            roles,
            config,
        }
    }

    pub fn config(&self) -> &DraftConfig {
        &self.config
    }

    /// First `sample_size` targets in enumeration order.
    pub fn sample_of(&self, target_ids: &[String]) -> Vec<String> {
        target_ids
            .iter()
            .take(self.config.sample_size)
            .cloned()
            .collect()
    }

    pub async fn get_or_create_draft(&self, seed: DraftSeed) -> DomainResult<Draft> {
        let seed = validate_seed(seed)?;
        let now = now_ms();

        if let Some(existing) = self.repository.get_live_by_key(&seed.key).await? {
            if !existing.is_expired_at(now) {
                return Ok(existing);
            }
            self.expire_one(existing, now).await?;
        }

        let draft = Draft {
            draft_id: crate::util::prefixed_id("draft"),
            owner_id: seed.key.owner_id.clone(),
            automation_id: seed.key.automation_id.clone(),
            scope_id: seed.key.scope_id.clone(),
            rules_hash: seed.key.rules_hash.clone(),
            status: DraftStatus::Partial,
            target_field: seed.target_field,
            target_ids: seed.target_ids,
            sample_target_ids: seed.sample_target_ids,
            items: Vec::new(),
            version: 1,
            created_at_ms: now,
            updated_at_ms: now,
            expires_at_ms: now.saturating_add(self.config.ttl.as_millis() as i64),
            applied_at_ms: None,
            expired_at_ms: None,
        };

        match self.repository.create(&draft).await {
            Ok(created) => {
                tracing::info!(
                    draft_id = %created.draft_id,
                    owner_id = %created.owner_id,
                    automation_id = %created.automation_id,
                    scope_id = %created.scope_id,
                    "draft created"
                );
                Ok(created)
            }
            Err(DomainError::Conflict) => self
                .repository
                .get_live_by_key(&seed.key)
                .await?
                .ok_or(DomainError::Conflict),
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, draft_id: &str) -> DomainResult<Draft> {
        self.repository
            .get(draft_id)
            .await?
            .ok_or(DomainError::NotFound)
    }

    /// Live draft for a key; drafts past their expiry are not returned even
    /// before the sweep has marked them.
    pub async fn get_by_key(&self, key: &DraftKey) -> DomainResult<Option<Draft>> {
        let now = now_ms();
        Ok(self
            .repository
            .get_live_by_key(key)
            .await?
            .filter(|draft| !draft.is_expired_at(now)))
    }

    pub async fn list_by_owner(&self, owner_id: &str) -> DomainResult<Vec<Draft>> {
        self.repository.list_by_owner(owner_id).await
    }

    pub async fn append_items(
        &self,
        draft_id: &str,
        items: Vec<GeneratedItem>,
    ) -> DomainResult<Draft> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.get(draft_id).await?;
            let now = now_ms();
            let next = apply_generated_items(&current, &items, now)?;
            match self.repository.update(&next, current.version).await {
                Ok(updated) => {
                    if current.status == DraftStatus::Partial
                        && updated.status == DraftStatus::Ready
                    {
                        tracing::info!(draft_id = %updated.draft_id, "draft ready");
                    }
                    return Ok(updated);
                }
                Err(DomainError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::Conflict)
    }

    pub async fn edit_item(
        &self,
        actor: &ActorIdentity,
        draft_id: &str,
        item_index: usize,
        value: String,
    ) -> DomainResult<UpdatedItem> {
        let value = value.trim().to_string();
        if value.chars().count() > MAX_SUGGESTION_LENGTH {
            return Err(DomainError::Validation(format!(
                "suggestion exceeds max length of {MAX_SUGGESTION_LENGTH}"
            )));
        }

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.get(draft_id).await?;
            let allowed = self
                .roles
                .can_edit(&current.owner_id, &actor.user_id)
                .await?;
            if !allowed {
                return Err(DomainError::PermissionDenied);
            }

            let now = now_ms();
            match current.status {
                DraftStatus::Applied => return Err(DomainError::DraftApplied),
                DraftStatus::Expired => return Err(DomainError::DraftExpired),
                DraftStatus::Partial | DraftStatus::Ready => {}
            }
            if current.is_expired_at(now) {
                return Err(DomainError::DraftExpired);
            }

            let mut next = current.clone();
            let item = next.items.get_mut(item_index).ok_or_else(|| {
                DomainError::Validation(format!("item index {item_index} is out of range"))
            })?;
            item.final_suggestion = value.clone();
            item.edited_by = Some(actor.user_id.clone());
            item.edited_at_ms = Some(now);
            let item = item.clone();
            next.updated_at_ms = now;
            next.version = current.version + 1;

            match self.repository.update(&next, current.version).await {
                Ok(updated) => {
                    return Ok(UpdatedItem {
                        draft_id: updated.draft_id,
                        item_index,
                        item,
                        updated_at_ms: now,
                    });
                }
                Err(DomainError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::Conflict)
    }

    /// Only the apply executor calls this. A second call is a no-op success.
    pub async fn mark_applied(&self, draft_id: &str) -> DomainResult<MarkApplied> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.get(draft_id).await?;
            match current.status {
                DraftStatus::Applied => return Ok(MarkApplied::AlreadyApplied(current)),
                DraftStatus::Expired => return Err(DomainError::DraftExpired),
                DraftStatus::Partial => return Err(DomainError::DraftNotReady),
                DraftStatus::Ready => {}
            }

            let now = now_ms();
            let mut next = current.clone();
            next.status = DraftStatus::Applied;
            next.applied_at_ms = Some(now);
            next.updated_at_ms = now;
            next.version = current.version + 1;

            match self.repository.update(&next, current.version).await {
                Ok(updated) => {
                    tracing::info!(draft_id = %updated.draft_id, "draft applied");
                    return Ok(MarkApplied::Applied(updated));
                }
                Err(DomainError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::Conflict)
    }

    pub async fn expire_stale(&self, now_ms: i64) -> DomainResult<usize> {
        let expired = self.repository.expire_due(now_ms).await?;
        if expired > 0 {
            tracing::info!(expired, "expired stale drafts");
        }
        Ok(expired)
    }

    /// Expires live drafts of an automation built over a different target set.
    pub async fn invalidate_scope(
        &self,
        owner_id: &str,
        automation_id: &str,
        current_scope_id: &str,
    ) -> DomainResult<usize> {
        let expired = self
            .repository
            .expire_other_scopes(owner_id, automation_id, current_scope_id, now_ms())
            .await?;
        if expired > 0 {
            tracing::info!(
                owner_id,
                automation_id,
                current_scope_id,
                expired,
                "invalidated drafts for changed scope"
            );
        }
        Ok(expired)
    }

    async fn expire_one(&self, draft: Draft, now: i64) -> DomainResult<()> {
        let mut next = draft.clone();
        next.status = DraftStatus::Expired;
        next.expired_at_ms = Some(now);
        next.updated_at_ms = now;
        next.version = draft.version + 1;
        match self.repository.update(&next, draft.version).await {
            Ok(_) | Err(DomainError::Conflict) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn validate_seed(mut seed: DraftSeed) -> DomainResult<DraftSeed> {
    seed.target_field = seed.target_field.trim().to_string();
    if seed.target_field.is_empty() {
        return Err(DomainError::Validation("target_field is required".into()));
    }
    if seed.key.owner_id.trim().is_empty() || seed.key.automation_id.trim().is_empty() {
        return Err(DomainError::Validation(
            "owner_id and automation_id are required".into(),
        ));
    }
    if seed.target_ids.is_empty() {
        return Err(DomainError::Validation(
            "a draft needs at least one target".into(),
        ));
    }
    let known: HashSet<&str> = seed.target_ids.iter().map(String::as_str).collect();
    if seed
        .sample_target_ids
        .iter()
        .any(|target_id| !known.contains(target_id.as_str()))
    {
        return Err(DomainError::Validation(
            "sample targets must belong to the draft scope".into(),
        ));
    }
    Ok(seed)
}

/// Upserts generated items by target and recomputes the lifecycle status.
fn apply_generated_items(
    current: &Draft,
    items: &[GeneratedItem],
    now: i64,
) -> DomainResult<Draft> {
    match current.status {
        DraftStatus::Applied => return Err(DomainError::DraftApplied),
        DraftStatus::Expired => return Err(DomainError::DraftExpired),
        DraftStatus::Partial | DraftStatus::Ready => {}
    }

    let mut next = current.clone();
    for generated in items {
        if !current.target_ids.contains(&generated.target_id) {
            return Err(DomainError::Validation(format!(
                "target '{}' is not part of the draft scope",
                generated.target_id
            )));
        }
        let item = DraftItem {
            target_id: generated.target_id.clone(),
            raw_suggestion: generated.suggestion.clone(),
            final_suggestion: generated.suggestion.trim().to_string(),
            current_value: generated.current_value.clone(),
            generated_at_ms: now,
            edited_by: None,
            edited_at_ms: None,
        };
        match next
            .items
            .iter_mut()
            .find(|existing| existing.target_id == generated.target_id)
        {
            Some(existing) => *existing = item,
            None => next.items.push(item),
        }
    }

    next.items.sort_by_key(|item| {
        current
            .target_ids
            .iter()
            .position(|target_id| target_id == &item.target_id)
            .unwrap_or(usize::MAX)
    });
    if next.is_complete() {
        next.status = DraftStatus::Ready;
    }
    next.updated_at_ms = now;
    next.version = current.version + 1;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft_over(targets: &[&str]) -> Draft {
        Draft {
            draft_id: "draft_1".to_string(),
            owner_id: "shop-1".to_string(),
            automation_id: "seo-title".to_string(),
            scope_id: "scope_x".to_string(),
            rules_hash: "rules_x".to_string(),
            status: DraftStatus::Partial,
            target_field: "seo_title".to_string(),
            target_ids: targets.iter().map(|value| value.to_string()).collect(),
            sample_target_ids: vec![],
            items: vec![],
            version: 1,
            created_at_ms: 1,
            updated_at_ms: 1,
            expires_at_ms: 10_000,
            applied_at_ms: None,
            expired_at_ms: None,
        }
    }

    fn generated(target_id: &str, suggestion: &str) -> GeneratedItem {
        GeneratedItem {
            target_id: target_id.to_string(),
            suggestion: suggestion.to_string(),
            current_value: None,
        }
    }

    #[test]
    fn appending_every_target_makes_draft_ready() {
        let draft = draft_over(&["p-1", "p-2"]);
        let partial = apply_generated_items(&draft, &[generated("p-2", "Two")], 5).expect("append");
        assert_eq!(partial.status, DraftStatus::Partial);
        assert_eq!(partial.version, 2);

        let ready =
            apply_generated_items(&partial, &[generated("p-1", "One")], 6).expect("append");
        assert_eq!(ready.status, DraftStatus::Ready);
        let order: Vec<_> = ready.items.iter().map(|item| item.target_id.as_str()).collect();
        assert_eq!(order, vec!["p-1", "p-2"]);
    }

    #[test]
    fn reappending_a_target_overwrites_its_item() {
        let draft = draft_over(&["p-1"]);
        let first = apply_generated_items(&draft, &[generated("p-1", "First")], 5).expect("append");
        let second =
            apply_generated_items(&first, &[generated("p-1", "Second")], 6).expect("append");
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].final_suggestion, "Second");
    }

    #[test]
    fn appending_outside_scope_is_rejected() {
        let draft = draft_over(&["p-1"]);
        let err = apply_generated_items(&draft, &[generated("p-9", "Nope")], 5).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn applied_drafts_reject_generation() {
        let mut draft = draft_over(&["p-1"]);
        draft.status = DraftStatus::Applied;
        let err = apply_generated_items(&draft, &[generated("p-1", "x")], 5).unwrap_err();
        assert!(matches!(err, DomainError::DraftApplied));
    }

    #[test]
    fn blank_final_suggestion_is_not_usable() {
        let draft = draft_over(&["p-1"]);
        let next = apply_generated_items(&draft, &[generated("p-1", "   ")], 5).expect("append");
        assert_eq!(next.items[0].usable_suggestion(), None);
    }

    #[test]
    fn expiry_is_time_or_status_based() {
        let mut draft = draft_over(&["p-1"]);
        assert!(!draft.is_expired_at(9_999));
        assert!(draft.is_expired_at(10_000));
        draft.status = DraftStatus::Expired;
        assert!(draft.is_expired_at(0));
    }

    #[test]
    fn storage_keys_stay_distinct_when_ids_contain_colons() {
        let joined = DraftKey::new("shop:1", "seo", "scope_x", "rules_x");
        let split = DraftKey::new("shop", "1:seo", "scope_x", "rules_x");
        assert_ne!(joined.storage_key(), split.storage_key());
        assert_eq!(
            DraftKey::new("shop-1", "seo", "scope_x", "rules_x").storage_key(),
            "shop-1:seo:scope_x:rules_x"
        );
    }

    #[test]
    fn seed_rejects_samples_outside_scope() {
        let err = validate_seed(DraftSeed {
            key: DraftKey::new("shop-1", "seo-title", "scope_x", "rules_x"),
            target_field: "seo_title".to_string(),
            target_ids: vec!["p-1".to_string()],
            sample_target_ids: vec!["p-2".to_string()],
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
