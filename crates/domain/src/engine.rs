use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::apply::{ApplyConfig, ApplyExecutor, ApplyRequest, ApplyRun};
use crate::automations::{AutomationDefinition, target_ids};
use crate::drafts::{Draft, DraftConfig, DraftKey, DraftSeed, DraftService, DraftStatus, UpdatedItem};
use crate::error::DomainError;
use crate::fingerprint::{compute_content_hash, compute_scope_id};
use crate::generation::{DraftGenerationService, GenerationConfig};
use crate::identity::ActorIdentity;
use crate::jobs::GenerationJobPayload;
use crate::ports::apply_runs::ApplyRunRepository;
use crate::ports::collaborators::{
    ApprovalProvider, AutomationSettingsProvider, CommerceConnector, EligibleTargetProvider,
    GenerationCapability, IssueProvider, RoleResolver,
};
use crate::ports::drafts::DraftRepository;
use crate::ports::jobs::JobQueue;
use crate::ports::quota::QuotaLedgerRepository;
use crate::ports::triggers::TriggerRecordStore;
use crate::quota::{QuotaAssessment, QuotaConfig, QuotaController, QuotaResource};
use crate::triggers::{
    SuppressReason, TriggerDecision, TriggerGate, TriggerGateConfig, TriggerInput, TriggerKey,
    TriggerType,
};
use crate::util::prefixed_id;
use crate::work_queue::{Bundle, WorkQueueDeriver, WorkQueueFilters};

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub drafts: DraftConfig,
    pub triggers: TriggerGateConfig,
    pub quota: QuotaConfig,
    pub apply: ApplyConfig,
    pub generation: GenerationConfig,
}

#[derive(Clone)]
pub struct EngineStores {
    pub drafts: Arc<dyn DraftRepository>,
    pub apply_runs: Arc<dyn ApplyRunRepository>,
    pub quota_ledger: Arc<dyn QuotaLedgerRepository>,
    pub trigger_records: Arc<dyn TriggerRecordStore>,
    pub jobs: Arc<dyn JobQueue>,
}

/// External collaborators, minus generation: the engine facade never holds
/// a generation capability.
#[derive(Clone)]
pub struct EngineCollaborators {
    pub targets: Arc<dyn EligibleTargetProvider>,
    pub settings: Arc<dyn AutomationSettingsProvider>,
    pub connector: Arc<dyn CommerceConnector>,
    pub roles: Arc<dyn RoleResolver>,
    pub issues: Arc<dyn IssueProvider>,
    pub approvals: Arc<dyn ApprovalProvider>,
}

/// A content-mutating event. Either a precomputed content hash or the raw
/// content to hash must be given.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_type: TriggerType,
    pub owner_id: String,
    pub automation_id: String,
    pub target_id: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TriggerResponse {
    pub allowed: bool,
    pub run_id: Option<String>,
    pub suppressed_reason: Option<SuppressReason>,
    pub draft_id: Option<String>,
    pub queued_targets: usize,
}

impl TriggerResponse {
    fn suppressed(reason: SuppressReason) -> Self {
        Self {
            allowed: false,
            run_id: None,
            suppressed_reason: Some(reason),
            draft_id: None,
            queued_targets: 0,
        }
    }
}

/// Correlation ids carried from the caller into queued work.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DraftSummary {
    pub draft_id: String,
    pub status: DraftStatus,
    pub item_count: usize,
    pub target_count: usize,
    pub expires_at_ms: i64,
}

impl From<&Draft> for DraftSummary {
    fn from(draft: &Draft) -> Self {
        Self {
            draft_id: draft.draft_id.clone(),
            status: draft.status,
            item_count: draft.items.len(),
            target_count: draft.target_ids.len(),
            expires_at_ms: draft.expires_at_ms,
        }
    }
}

/// Read-only preview of what triggering an automation would do.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutomationEstimate {
    pub automation_id: String,
    pub scope_id: String,
    pub rules_hash: String,
    pub eligible_count: usize,
    pub setting_enabled: bool,
    pub plan_eligible: bool,
    pub draft: Option<DraftSummary>,
    pub generation_needed: usize,
    pub quota: Option<QuotaAssessment>,
}

#[derive(Clone)]
pub struct AutomationEngine {
    gate: TriggerGate,
    drafts: DraftService,
    quota: QuotaController,
    apply: ApplyExecutor,
    work_queue: WorkQueueDeriver,
    collaborators: EngineCollaborators,
    jobs: Arc<dyn JobQueue>,
    config: EngineConfig,
}

impl AutomationEngine {
    pub fn new(stores: EngineStores, collaborators: EngineCollaborators, config: EngineConfig) -> Self {
        let gate = TriggerGate::new(stores.trigger_records.clone(), config.triggers.clone());
        let drafts = DraftService::new(
            stores.drafts.clone(),
            collaborators.roles.clone(),
            config.drafts.clone(),
        );
        let quota = QuotaController::new(stores.quota_ledger.clone(), config.quota.clone());
        let apply = ApplyExecutor::new(
            drafts.clone(),
            stores.apply_runs.clone(),
            quota.clone(),
            collaborators.targets.clone(),
            collaborators.settings.clone(),
            collaborators.connector.clone(),
            collaborators.roles.clone(),
            config.apply.clone(),
        );
        let work_queue = WorkQueueDeriver::new(
            collaborators.issues.clone(),
            collaborators.approvals.clone(),
            collaborators.settings.clone(),
            collaborators.targets.clone(),
            drafts.clone(),
            stores.apply_runs.clone(),
            collaborators.roles.clone(),
        );
        Self {
            gate,
            drafts,
            quota,
            apply,
            work_queue,
            collaborators,
            jobs: stores.jobs,
            config,
        }
    }

    /// Builds the job consumer that owns the generation capability.
    pub fn generation_service(
        &self,
        generator: Arc<dyn GenerationCapability>,
    ) -> DraftGenerationService {
        DraftGenerationService::new(
            self.gate.clone(),
            self.drafts.clone(),
            self.quota.clone(),
            self.collaborators.targets.clone(),
            self.collaborators.settings.clone(),
            generator,
            self.config.generation.clone(),
        )
    }

    pub fn quota(&self) -> &QuotaController {
        &self.quota
    }

    pub fn trigger_gate(&self) -> &TriggerGate {
        &self.gate
    }

    /// The only entry point that evaluates triggers.
    pub async fn trigger_automation(
        &self,
        event: TriggerEvent,
        context: RequestContext,
    ) -> DomainResult<TriggerResponse> {
        let content_hash = match (&event.content_hash, &event.content) {
            (Some(hash), _) if !hash.trim().is_empty() => hash.trim().to_string(),
            (_, Some(content)) => compute_content_hash(content)?,
            _ => {
                return Err(DomainError::Validation(
                    "content_hash or content is required".into(),
                ));
            }
        };

        let automation = self.automation(&event.owner_id, &event.automation_id).await?;
        let tier = self.collaborators.settings.plan_tier(&event.owner_id).await?;
        let key = TriggerKey::new(
            event.trigger_type,
            event.owner_id.clone(),
            event.automation_id.clone(),
            event.target_id.clone(),
            content_hash,
        );
        let input = TriggerInput {
            key: key.clone(),
            setting_enabled: automation.enabled,
            plan_eligible: tier.permits(automation.min_plan),
        };

        let run_id = match self.gate.evaluate_trigger(&input).await? {
            TriggerDecision::Suppress(reason) => return Ok(TriggerResponse::suppressed(reason)),
            TriggerDecision::Allow { run_id, .. } => run_id,
        };

        match self
            .schedule_generation(&automation, &key, &run_id, &context)
            .await
        {
            Ok((draft_id, queued_targets)) => Ok(TriggerResponse {
                allowed: true,
                run_id: Some(run_id),
                suppressed_reason: None,
                draft_id: Some(draft_id),
                queued_targets,
            }),
            Err(err) => {
                if let Err(mark_err) = self.gate.mark_failed(&key, &run_id, &err.to_string()).await
                {
                    tracing::error!(run_id, error = %mark_err, "failed to record trigger failure");
                }
                Err(err)
            }
        }
    }

    pub async fn get_draft(
        &self,
        owner_id: &str,
        automation_id: &str,
        scope_id: &str,
        rules_hash: &str,
    ) -> DomainResult<Draft> {
        let key = DraftKey::new(owner_id, automation_id, scope_id, rules_hash);
        self.drafts
            .get_by_key(&key)
            .await?
            .ok_or(DomainError::NotFound)
    }

    pub async fn get_draft_by_id(&self, owner_id: &str, draft_id: &str) -> DomainResult<Draft> {
        let draft = self.drafts.get(draft_id).await?;
        if draft.owner_id != owner_id {
            return Err(DomainError::NotFound);
        }
        Ok(draft)
    }

    pub async fn edit_draft_item(
        &self,
        actor: &ActorIdentity,
        owner_id: &str,
        draft_id: &str,
        item_index: usize,
        value: String,
    ) -> DomainResult<UpdatedItem> {
        self.get_draft_by_id(owner_id, draft_id).await?;
        self.drafts.edit_item(actor, draft_id, item_index, value).await
    }

    pub async fn apply_draft(
        &self,
        actor: &ActorIdentity,
        request: &ApplyRequest,
    ) -> DomainResult<ApplyRun> {
        self.apply.apply_draft(actor, request).await
    }

    pub async fn get_apply_run(&self, owner_id: &str, run_id: &str) -> DomainResult<ApplyRun> {
        let run = self.apply.get_run(run_id).await?;
        if run.owner_id != owner_id {
            return Err(DomainError::NotFound);
        }
        Ok(run)
    }

    pub async fn list_apply_runs(
        &self,
        owner_id: &str,
        draft_id: &str,
    ) -> DomainResult<Vec<ApplyRun>> {
        self.get_draft_by_id(owner_id, draft_id).await?;
        self.apply.list_runs(draft_id).await
    }

    pub async fn get_work_queue(
        &self,
        owner_id: &str,
        actor: &ActorIdentity,
        filters: &WorkQueueFilters,
    ) -> DomainResult<Vec<Bundle>> {
        self.work_queue.derive_bundles(owner_id, actor, filters).await
    }

    pub async fn estimate(
        &self,
        owner_id: &str,
        automation_id: &str,
    ) -> DomainResult<AutomationEstimate> {
        let automation = self.automation(owner_id, automation_id).await?;
        let tier = self.collaborators.settings.plan_tier(owner_id).await?;
        let targets = self
            .collaborators
            .targets
            .list_eligible_targets(owner_id, automation_id)
            .await?;
        let ids = target_ids(&targets);
        let scope_id = compute_scope_id(&ids)?;
        let rules_hash = automation.rules_hash()?;

        let key = DraftKey::new(owner_id, automation_id, scope_id.clone(), rules_hash.clone());
        let draft = self.drafts.get_by_key(&key).await?;
        let generation_needed = match &draft {
            Some(draft) if draft.status == DraftStatus::Applied => 0,
            Some(draft) => draft.missing_target_ids().len(),
            None => ids.len(),
        };
        let quota = if generation_needed > 0 {
            Some(
                self.quota
                    .assess(
                        owner_id,
                        tier,
                        QuotaResource::GenerationCall,
                        generation_needed as u64,
                    )
                    .await?,
            )
        } else {
            None
        };

        Ok(AutomationEstimate {
            automation_id: automation.automation_id.clone(),
            scope_id,
            rules_hash,
            eligible_count: ids.len(),
            setting_enabled: automation.enabled,
            plan_eligible: tier.permits(automation.min_plan),
            draft: draft.as_ref().map(DraftSummary::from),
            generation_needed,
            quota,
        })
    }

    pub async fn expire_stale(&self, now_ms: i64) -> DomainResult<usize> {
        self.drafts.expire_stale(now_ms).await
    }

    async fn automation(
        &self,
        owner_id: &str,
        automation_id: &str,
    ) -> DomainResult<AutomationDefinition> {
        self.collaborators
            .settings
            .get_automation(owner_id, automation_id)
            .await?
            .ok_or(DomainError::NotFound)
    }

    /// Resolves the draft for the current scope and rules and queues
    /// generation for the triggering target plus every target still missing
    /// an item.
    async fn schedule_generation(
        &self,
        automation: &AutomationDefinition,
        key: &TriggerKey,
        run_id: &str,
        context: &RequestContext,
    ) -> DomainResult<(String, usize)> {
        let targets = self
            .collaborators
            .targets
            .list_eligible_targets(&key.owner_id, &key.automation_id)
            .await?;
        let ids = target_ids(&targets);
        if ids.is_empty() {
            return Err(DomainError::Validation(
                "automation has no eligible targets".into(),
            ));
        }
        let scope_id = compute_scope_id(&ids)?;
        let rules_hash = automation.rules_hash()?;

        self.drafts
            .invalidate_scope(&key.owner_id, &key.automation_id, &scope_id)
            .await?;
        let draft = self
            .drafts
            .get_or_create_draft(DraftSeed {
                key: DraftKey::new(
                    key.owner_id.clone(),
                    key.automation_id.clone(),
                    scope_id,
                    rules_hash,
                ),
                target_field: automation.target_field.clone(),
                sample_target_ids: self.drafts.sample_of(&ids),
                target_ids: ids,
            })
            .await?;

        let pending = targets_to_generate(&draft, &key.target_id);
        if pending.is_empty() {
            self.gate.mark_running(key, run_id).await?;
            self.gate.mark_succeeded(key, run_id).await?;
            tracing::debug!(run_id, draft_id = %draft.draft_id, "nothing to generate");
            return Ok((draft.draft_id, 0));
        }

        let job = GenerationJobPayload {
            run_id: run_id.to_string(),
            trigger_key: key.clone(),
            draft_id: draft.draft_id.clone(),
            target_ids: pending.clone(),
        }
        .into_job(prefixed_id("job"), context)?;
        self.jobs.enqueue(&job).await?;
        tracing::info!(
            run_id,
            job_id = %job.job_id,
            draft_id = %draft.draft_id,
            targets = pending.len(),
            "draft generation queued"
        );
        Ok((draft.draft_id, pending.len()))
    }
}

/// Samples first, then the remaining missing targets, then the triggering
/// target if its item already exists and needs regenerating.
fn targets_to_generate(draft: &Draft, trigger_target_id: &str) -> Vec<String> {
    if draft.status == DraftStatus::Applied {
        return Vec::new();
    }
    let missing = draft.missing_target_ids();
    let mut pending: Vec<String> = draft
        .sample_target_ids
        .iter()
        .filter(|target_id| missing.contains(target_id))
        .cloned()
        .collect();
    for target_id in &missing {
        if !pending.contains(target_id) {
            pending.push(target_id.clone());
        }
    }
    if draft.target_ids.iter().any(|id| id == trigger_target_id)
        && !pending.iter().any(|id| id == trigger_target_id)
    {
        pending.push(trigger_target_id.to_string());
    }
    pending
}
