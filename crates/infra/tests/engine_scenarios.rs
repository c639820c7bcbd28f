use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use playbook_domain::apply::{
    ApplyConfig, ApplyItemStatus, ApplyRequest, ApplyRun, ApplyRunStatus, SkipReason,
    StoppedReason,
};
use playbook_domain::auth::Role;
use playbook_domain::automations::{
    AutomationDefinition, DetectedIssue, IssueSeverity, PendingApproval, PlanTier, RuleConfig,
    ScopeType, TargetDescriptor,
};
use playbook_domain::drafts::{DraftConfig, DraftKey, DraftSeed, DraftService, DraftStatus};
use playbook_domain::engine::{
    AutomationEngine, EngineCollaborators, EngineConfig, EngineStores, RequestContext,
    TriggerEvent,
};
use playbook_domain::error::DomainError;
use playbook_domain::fingerprint::compute_scope_id;
use playbook_domain::identity::ActorIdentity;
use playbook_domain::jobs::now_ms;
use playbook_domain::ports::BoxFuture;
use playbook_domain::ports::collaborators::{
    ApprovalProvider, AutomationSettingsProvider, CollaboratorError, CommerceConnector,
    EligibleTargetProvider, GenerationCapability, IssueProvider, RoleResolver,
};
use playbook_domain::quota::{
    Allowance, QuotaConfig, QuotaController, QuotaPolicy, QuotaPosture, QuotaResource,
};
use playbook_domain::triggers::{SuppressReason, TriggerGateConfig, TriggerType};
use playbook_domain::work_queue::{BundleAction, WorkQueueFilters};
use playbook_infra::consumer::GenerationConsumer;
use playbook_infra::repositories::{InMemoryDraftRepository, InMemoryQuotaLedgerRepository};
use playbook_infra::wiring::memory_stores;
use serde_json::json;

const OWNER: &str = "shop-1";
const AUTOMATION: &str = "seo-title";

struct FakePlatform {
    automations: Mutex<Vec<AutomationDefinition>>,
    targets: Mutex<HashMap<String, Vec<TargetDescriptor>>>,
    tier: Mutex<PlanTier>,
    roles: Mutex<HashMap<String, Role>>,
    issues: Mutex<Vec<DetectedIssue>>,
    approvals: Mutex<Vec<PendingApproval>>,
    failing_targets: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    applied: Mutex<Vec<(String, String, String)>>,
}

impl FakePlatform {
    fn new() -> Self {
        let platform = Self {
            automations: Mutex::new(vec![automation(AUTOMATION, true)]),
            targets: Mutex::new(HashMap::new()),
            tier: Mutex::new(PlanTier::Pro),
            roles: Mutex::new(HashMap::from([
                ("owner-user".to_string(), Role::Owner),
                ("editor-user".to_string(), Role::Editor),
                ("viewer-user".to_string(), Role::Viewer),
            ])),
            issues: Mutex::new(Vec::new()),
            approvals: Mutex::new(Vec::new()),
            failing_targets: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
        };
        platform.set_targets(AUTOMATION, &["p1", "p2", "p3"]);
        platform
    }

    fn set_targets(&self, automation_id: &str, ids: &[&str]) {
        let targets = ids
            .iter()
            .map(|id| {
                let mut target = TargetDescriptor::new(*id);
                target.title = Some(format!("Product {id}"));
                target.current_value = Some(format!("old title {id}"));
                target
            })
            .collect();
        self.targets
            .lock()
            .unwrap()
            .insert(automation_id.to_string(), targets);
    }

    fn fail_on(&self, target_id: &str) {
        self.failing_targets
            .lock()
            .unwrap()
            .insert(target_id.to_string());
    }

    fn delay_on(&self, target_id: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(target_id.to_string(), delay);
    }

    fn clear_failures(&self) {
        self.failing_targets.lock().unwrap().clear();
    }

    fn applied_targets(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|(target_id, _, _)| target_id.clone())
            .collect()
    }

    fn role(&self, user_id: &str) -> Option<Role> {
        self.roles.lock().unwrap().get(user_id).copied()
    }
}

fn automation(automation_id: &str, enabled: bool) -> AutomationDefinition {
    let mut rule_config = RuleConfig::new();
    rule_config.insert("tone".to_string(), json!("friendly"));
    rule_config.insert("max_length".to_string(), json!(60));
    AutomationDefinition {
        automation_id: automation_id.to_string(),
        owner_id: OWNER.to_string(),
        name: format!("Automation {automation_id}"),
        action_key: "fix_seo_title".to_string(),
        scope_type: ScopeType::Products,
        target_field: "seo_title".to_string(),
        enabled,
        min_plan: PlanTier::Pro,
        rule_config,
    }
}

impl EligibleTargetProvider for FakePlatform {
    fn list_eligible_targets(
        &self,
        _owner_id: &str,
        automation_id: &str,
    ) -> BoxFuture<'_, Result<Vec<TargetDescriptor>, CollaboratorError>> {
        let targets = self
            .targets
            .lock()
            .unwrap()
            .get(automation_id)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(targets) })
    }
}

impl AutomationSettingsProvider for FakePlatform {
    fn get_automation(
        &self,
        _owner_id: &str,
        automation_id: &str,
    ) -> BoxFuture<'_, Result<Option<AutomationDefinition>, CollaboratorError>> {
        let found = self
            .automations
            .lock()
            .unwrap()
            .iter()
            .find(|automation| automation.automation_id == automation_id)
            .cloned();
        Box::pin(async move { Ok(found) })
    }

    fn list_automations(
        &self,
        _owner_id: &str,
    ) -> BoxFuture<'_, Result<Vec<AutomationDefinition>, CollaboratorError>> {
        let automations = self.automations.lock().unwrap().clone();
        Box::pin(async move { Ok(automations) })
    }

    fn plan_tier(&self, _owner_id: &str) -> BoxFuture<'_, Result<PlanTier, CollaboratorError>> {
        let tier = *self.tier.lock().unwrap();
        Box::pin(async move { Ok(tier) })
    }
}

impl RoleResolver for FakePlatform {
    fn can_edit(
        &self,
        _owner_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>> {
        let allowed = self.role(user_id).is_some_and(|role| role.can_edit());
        Box::pin(async move { Ok(allowed) })
    }

    fn can_apply(
        &self,
        _owner_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>> {
        let allowed = self.role(user_id).is_some_and(|role| role.can_apply());
        Box::pin(async move { Ok(allowed) })
    }
}

impl IssueProvider for FakePlatform {
    fn list_detected_issues(
        &self,
        _owner_id: &str,
    ) -> BoxFuture<'_, Result<Vec<DetectedIssue>, CollaboratorError>> {
        let issues = self.issues.lock().unwrap().clone();
        Box::pin(async move { Ok(issues) })
    }
}

impl ApprovalProvider for FakePlatform {
    fn list_pending_approvals(
        &self,
        _owner_id: &str,
    ) -> BoxFuture<'_, Result<Vec<PendingApproval>, CollaboratorError>> {
        let approvals = self.approvals.lock().unwrap().clone();
        Box::pin(async move { Ok(approvals) })
    }
}

impl CommerceConnector for FakePlatform {
    fn apply_change(
        &self,
        target_id: &str,
        field: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        let change = (target_id.to_string(), field.to_string(), value.to_string());
        let delay = self.delays.lock().unwrap().get(target_id).copied();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing_targets.lock().unwrap().contains(&change.0) {
                return Err(CollaboratorError::Rejected(format!(
                    "{} rejected the change",
                    change.0
                )));
            }
            self.applied.lock().unwrap().push(change);
            Ok(())
        })
    }
}

#[derive(Default)]
struct CountingGenerator {
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl CountingGenerator {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

impl GenerationCapability for CountingGenerator {
    fn generate(
        &self,
        target: &TargetDescriptor,
        _rules: &RuleConfig,
    ) -> BoxFuture<'_, Result<String, CollaboratorError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let suggestion = format!("New title for {}", target.target_id);
        let delay = *self.delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(suggestion)
        })
    }
}

struct Harness {
    engine: AutomationEngine,
    platform: Arc<FakePlatform>,
    generator: Arc<CountingGenerator>,
    consumer: GenerationConsumer,
    stores: EngineStores,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        let platform = Arc::new(FakePlatform::new());
        let generator = Arc::new(CountingGenerator::default());
        let stores = memory_stores("test:trigger");
        let collaborators = EngineCollaborators {
            targets: platform.clone(),
            settings: platform.clone(),
            connector: platform.clone(),
            roles: platform.clone(),
            issues: platform.clone(),
            approvals: platform.clone(),
        };
        let engine = AutomationEngine::new(stores.clone(), collaborators, config);
        let consumer = GenerationConsumer::new(
            stores.jobs.clone(),
            engine.generation_service(generator.clone()),
            Duration::from_millis(5),
        );
        Self {
            engine,
            platform,
            generator,
            consumer,
            stores,
        }
    }

    async fn trigger(&self, target_id: &str, content_hash: &str) -> playbook_domain::engine::TriggerResponse {
        self.engine
            .trigger_automation(
                TriggerEvent {
                    trigger_type: TriggerType::IssueDetected,
                    owner_id: OWNER.to_string(),
                    automation_id: AUTOMATION.to_string(),
                    target_id: target_id.to_string(),
                    content_hash: Some(content_hash.to_string()),
                    content: None,
                },
                RequestContext::default(),
            )
            .await
            .expect("trigger")
    }

    async fn drain(&self) -> Vec<&'static str> {
        let mut results = Vec::new();
        while let Some(report) = self.consumer.process_next().await.expect("process job") {
            results.push(report.result);
        }
        results
    }

    async fn ready_draft(&self) -> playbook_domain::drafts::Draft {
        let response = self.trigger("p1", "content_h1").await;
        assert!(response.allowed);
        self.drain().await;
        let draft = self
            .engine
            .get_draft_by_id(OWNER, response.draft_id.as_deref().expect("draft id"))
            .await
            .expect("draft");
        assert_eq!(draft.status, DraftStatus::Ready);
        draft
    }

    async fn apply_as(
        &self,
        user_id: &str,
        draft: &playbook_domain::drafts::Draft,
    ) -> Result<playbook_domain::apply::ApplyRun, DomainError> {
        self.engine
            .apply_draft(
                &ActorIdentity::with_user_id(user_id),
                &ApplyRequest {
                    owner_id: OWNER.to_string(),
                    draft_id: draft.draft_id.clone(),
                    scope_id: draft.scope_id.clone(),
                    rules_hash: draft.rules_hash.clone(),
                },
            )
            .await
    }
}

fn quota_config(tier: PlanTier, resource: QuotaResource, policy: QuotaPolicy) -> QuotaConfig {
    QuotaConfig::new(Duration::from_secs(60 * 60 * 24 * 30)).with_policy(tier, resource, policy)
}

#[tokio::test]
async fn trigger_creates_partial_draft_and_repeat_is_in_flight() {
    let harness = Harness::new();

    let first = harness.trigger("p1", "content_h1").await;
    assert!(first.allowed);
    assert_eq!(first.queued_targets, 3);
    let draft = harness
        .engine
        .get_draft_by_id(OWNER, first.draft_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(draft.status, DraftStatus::Partial);
    assert_eq!(draft.target_ids, vec!["p1", "p2", "p3"]);

    let second = harness.trigger("p1", "content_h1").await;
    assert!(!second.allowed);
    assert_eq!(second.suppressed_reason, Some(SuppressReason::InFlight));
    assert_eq!(harness.stores.jobs.depth().await.unwrap().ready, 1);
}

#[tokio::test]
async fn generation_fills_every_target_and_marks_draft_ready() {
    let harness = Harness::new();
    let response = harness.trigger("p1", "content_h1").await;

    assert_eq!(harness.drain().await, vec!["completed"]);
    assert_eq!(harness.generator.calls(), 3);

    let draft = harness
        .engine
        .get_draft_by_id(OWNER, response.draft_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(draft.status, DraftStatus::Ready);
    let items: Vec<&str> = draft.items.iter().map(|item| item.target_id.as_str()).collect();
    assert_eq!(items, vec!["p1", "p2", "p3"]);

    let repeat = harness.trigger("p1", "content_h1").await;
    assert_eq!(
        repeat.suppressed_reason,
        Some(SuppressReason::IdempotentAlreadyDone)
    );

    let changed = harness.trigger("p1", "content_h2").await;
    assert!(changed.allowed);
    assert_eq!(changed.draft_id, response.draft_id);
    assert_eq!(changed.queued_targets, 1);
}

#[tokio::test]
async fn generation_stops_once_its_trigger_is_reclaimed() {
    let config = EngineConfig {
        triggers: TriggerGateConfig {
            in_flight_ttl: Duration::from_millis(50),
        },
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(config);
    harness.generator.slow_down(Duration::from_millis(120));
    assert!(harness.trigger("p1", "content_h1").await.allowed);

    let (report, retrigger) = tokio::join!(harness.consumer.process_next(), async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        harness.trigger("p1", "content_h1").await
    });
    let report = report.expect("process job").expect("job");
    assert_eq!(report.result, "superseded");
    assert!(retrigger.allowed);
    assert_eq!(harness.generator.calls(), 1);

    let used = harness
        .engine
        .quota()
        .assess(OWNER, PlanTier::Pro, QuotaResource::GenerationCall, 1)
        .await
        .unwrap()
        .used;
    assert_eq!(used, 1);
}

#[tokio::test]
async fn apply_completes_without_generation_calls() {
    let harness = Harness::new();
    let draft = harness.ready_draft().await;
    let generation_calls = harness.generator.calls();

    let run = harness.apply_as("owner-user", &draft).await.unwrap();

    assert_eq!(run.status, ApplyRunStatus::Completed);
    assert_eq!(run.updated, 3);
    assert_eq!(run.unattempted, 0);
    assert_eq!(harness.generator.calls(), generation_calls);
    assert_eq!(harness.platform.applied_targets(), vec!["p1", "p2", "p3"]);

    let draft = harness
        .engine
        .get_draft_by_id(OWNER, &draft.draft_id)
        .await
        .unwrap();
    assert_eq!(draft.status, DraftStatus::Applied);
    assert!(draft.applied_at_ms.is_some());
}

#[tokio::test]
async fn added_target_rejects_apply_with_scope_invalid() {
    let harness = Harness::new();
    let draft = harness.ready_draft().await;

    harness.platform.set_targets(AUTOMATION, &["p1", "p2", "p3", "p4"]);
    let err = harness.apply_as("owner-user", &draft).await.unwrap_err();

    assert!(matches!(err, DomainError::ScopeInvalid));
    assert!(harness.platform.applied_targets().is_empty());
    assert!(
        harness
            .engine
            .list_apply_runs(OWNER, &draft.draft_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn removed_target_rejects_apply_with_scope_invalid() {
    let harness = Harness::new();
    let draft = harness.ready_draft().await;

    harness.platform.set_targets(AUTOMATION, &["p1", "p2"]);
    let err = harness.apply_as("owner-user", &draft).await.unwrap_err();

    assert!(matches!(err, DomainError::ScopeInvalid));
    assert!(harness.platform.applied_targets().is_empty());
}

#[tokio::test]
async fn changed_rules_reject_apply() {
    let harness = Harness::new();
    let draft = harness.ready_draft().await;

    harness.platform.automations.lock().unwrap()[0]
        .rule_config
        .insert("tone".to_string(), json!("formal"));
    let err = harness.apply_as("owner-user", &draft).await.unwrap_err();
    assert!(matches!(err, DomainError::RulesChanged));
}

#[tokio::test]
async fn quota_posture_moves_from_advisory_to_warn() {
    let ledger = Arc::new(InMemoryQuotaLedgerRepository::new());
    let quota = QuotaController::new(
        ledger,
        quota_config(
            PlanTier::Pro,
            QuotaResource::GenerationCall,
            QuotaPolicy::limited(100),
        ),
    );

    quota
        .admit(OWNER, PlanTier::Pro, QuotaResource::GenerationCall, 79, "seed")
        .await
        .unwrap();
    let at_79 = quota
        .assess(OWNER, PlanTier::Pro, QuotaResource::GenerationCall, 1)
        .await
        .unwrap();
    assert_eq!(at_79.posture, QuotaPosture::Predict);
    assert!(at_79.allowed);
    assert!(at_79.advisory.is_some());
    assert!(!at_79.upgrade_nudge);

    quota
        .admit(OWNER, PlanTier::Pro, QuotaResource::GenerationCall, 2, "more")
        .await
        .unwrap();
    let at_81 = quota
        .assess(OWNER, PlanTier::Pro, QuotaResource::GenerationCall, 1)
        .await
        .unwrap();
    assert_eq!(at_81.posture, QuotaPosture::Warn);
    assert!(at_81.allowed);
    assert!(at_81.upgrade_nudge);
}

#[tokio::test]
async fn refunds_and_resets_offset_usage() {
    let ledger = Arc::new(InMemoryQuotaLedgerRepository::new());
    let quota = QuotaController::new(
        ledger,
        quota_config(
            PlanTier::Pro,
            QuotaResource::AppliedChange,
            QuotaPolicy::limited(10),
        ),
    );

    quota
        .admit(OWNER, PlanTier::Pro, QuotaResource::AppliedChange, 6, "batch")
        .await
        .unwrap();
    quota
        .refund(OWNER, QuotaResource::AppliedChange, 2, "batch")
        .await
        .unwrap();
    let after_refund = quota
        .assess(OWNER, PlanTier::Pro, QuotaResource::AppliedChange, 1)
        .await
        .unwrap();
    assert_eq!(after_refund.used, 4);
    assert_eq!(after_refund.remaining, Allowance::Limited(6));

    let offset = quota
        .reset(OWNER, QuotaResource::AppliedChange)
        .await
        .unwrap();
    assert_eq!(offset, 4);
    let after_reset = quota
        .assess(OWNER, PlanTier::Pro, QuotaResource::AppliedChange, 10)
        .await
        .unwrap();
    assert_eq!(after_reset.used, 0);
    assert!(after_reset.allowed);
}

#[tokio::test]
async fn enforce_rejects_whole_request_and_reports_remaining() {
    let ledger = Arc::new(InMemoryQuotaLedgerRepository::new());
    let quota = QuotaController::new(
        ledger,
        quota_config(
            PlanTier::Free,
            QuotaResource::AppliedChange,
            QuotaPolicy::limited(5),
        ),
    );
    quota
        .admit(OWNER, PlanTier::Free, QuotaResource::AppliedChange, 4, "seed")
        .await
        .unwrap();

    let err = quota
        .admit(OWNER, PlanTier::Free, QuotaResource::AppliedChange, 2, "batch")
        .await
        .unwrap_err();
    match err {
        DomainError::QuotaExceeded {
            requested,
            remaining,
            ..
        } => {
            assert_eq!(requested, 2);
            assert_eq!(remaining, Allowance::Limited(1));
        }
        other => panic!("expected quota rejection, got {other:?}"),
    }

    let after = quota
        .assess(OWNER, PlanTier::Free, QuotaResource::AppliedChange, 1)
        .await
        .unwrap();
    assert_eq!(after.used, 4);
}

#[tokio::test]
async fn apply_stops_on_first_failure_and_resumes() {
    let harness = Harness::new();
    let draft = harness.ready_draft().await;
    harness.platform.fail_on("p2");

    let run = harness.apply_as("owner-user", &draft).await.unwrap();
    assert_eq!(run.status, ApplyRunStatus::Stopped);
    assert_eq!(run.stopped_reason, Some(StoppedReason::ItemFailed));
    assert_eq!((run.updated, run.failed, run.unattempted), (1, 1, 1));
    assert_eq!(harness.platform.applied_targets(), vec!["p1"]);

    let used = harness
        .engine
        .quota()
        .assess(OWNER, PlanTier::Pro, QuotaResource::AppliedChange, 1)
        .await
        .unwrap()
        .used;
    assert_eq!(used, 1);

    harness.platform.clear_failures();
    let resumed = harness.apply_as("owner-user", &draft).await.unwrap();
    assert_eq!(resumed.status, ApplyRunStatus::Completed);
    assert_eq!(resumed.updated, 2);
    assert_eq!(resumed.results[0].status, ApplyItemStatus::Skipped);
    assert_eq!(resumed.results[0].skip_reason, Some(SkipReason::AlreadyApplied));
    assert_eq!(harness.platform.applied_targets(), vec!["p1", "p2", "p3"]);

    let runs = harness
        .engine
        .list_apply_runs(OWNER, &draft.draft_id)
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, run.run_id);
}

#[tokio::test]
async fn apply_stops_when_quota_runs_out() {
    let config = EngineConfig {
        quota: quota_config(
            PlanTier::Pro,
            QuotaResource::AppliedChange,
            QuotaPolicy::limited(2),
        ),
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(config);
    let draft = harness.ready_draft().await;

    let run = harness.apply_as("owner-user", &draft).await.unwrap();
    assert_eq!(run.status, ApplyRunStatus::Stopped);
    assert_eq!(run.stopped_reason, Some(StoppedReason::LimitReached));
    assert_eq!((run.updated, run.failed, run.unattempted), (2, 0, 1));
    assert_eq!(harness.platform.applied_targets(), vec!["p1", "p2"]);
}

#[tokio::test]
async fn slow_item_is_failed_refunded_and_stops_the_run() {
    let config = EngineConfig {
        apply: ApplyConfig {
            item_timeout: Duration::from_millis(50),
            ..ApplyConfig::default()
        },
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(config);
    let draft = harness.ready_draft().await;
    harness.platform.delay_on("p2", Duration::from_secs(5));

    let run = harness.apply_as("owner-user", &draft).await.unwrap();
    assert_eq!(run.status, ApplyRunStatus::Stopped);
    assert_eq!(run.stopped_reason, Some(StoppedReason::ItemFailed));
    assert_eq!((run.updated, run.failed, run.unattempted), (1, 1, 1));
    assert!(run.error_message.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(run.results[1].status, ApplyItemStatus::Failed);
    assert_eq!(harness.platform.applied_targets(), vec!["p1"]);

    let used = harness
        .engine
        .quota()
        .assess(OWNER, PlanTier::Pro, QuotaResource::AppliedChange, 1)
        .await
        .unwrap()
        .used;
    assert_eq!(used, 1);
}

#[tokio::test]
async fn dropped_apply_request_still_finishes_the_run() {
    let harness = Harness::new();
    let draft = harness.ready_draft().await;
    harness.platform.delay_on("p2", Duration::from_millis(300));

    let cut_short =
        tokio::time::timeout(Duration::from_millis(100), harness.apply_as("owner-user", &draft))
            .await;
    assert!(cut_short.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let runs = harness
        .engine
        .list_apply_runs(OWNER, &draft.draft_id)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, ApplyRunStatus::Completed);
    assert_eq!(runs[0].updated, 3);
    assert_eq!(harness.platform.applied_targets(), vec!["p1", "p2", "p3"]);
    let stored = harness
        .engine
        .get_draft_by_id(OWNER, &draft.draft_id)
        .await
        .unwrap();
    assert_eq!(stored.status, DraftStatus::Applied);

    let again = harness.apply_as("owner-user", &draft).await.unwrap();
    assert_eq!(again.status, ApplyRunStatus::Completed);
    assert_eq!(again.skipped, 3);
}

#[tokio::test]
async fn running_run_blocks_apply_until_its_lease_lapses() {
    let config = EngineConfig {
        apply: ApplyConfig {
            item_timeout: Duration::from_millis(50),
            run_lease: Duration::from_millis(200),
        },
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(config);
    let draft = harness.ready_draft().await;

    let now = now_ms();
    let mut orphan = ApplyRun {
        run_id: "apply_orphan".to_string(),
        draft_id: draft.draft_id.clone(),
        owner_id: OWNER.to_string(),
        automation_id: AUTOMATION.to_string(),
        requested_by: "owner-user".to_string(),
        status: ApplyRunStatus::Running,
        attempted: 0,
        updated: 0,
        skipped: 0,
        failed: 0,
        unattempted: 0,
        stopped_reason: None,
        error_message: None,
        results: Vec::new(),
        started_at_ms: now,
        heartbeat_at_ms: now,
        finished_at_ms: None,
    };
    harness.stores.apply_runs.create(&orphan).await.unwrap();

    let err = harness.apply_as("owner-user", &draft).await.unwrap_err();
    assert!(matches!(err, DomainError::ApplyInProgress));
    assert!(harness.platform.applied_targets().is_empty());

    orphan.heartbeat_at_ms = now - 10_000;
    harness.stores.apply_runs.update_running(&orphan).await.unwrap();

    let run = harness.apply_as("owner-user", &draft).await.unwrap();
    assert_eq!(run.status, ApplyRunStatus::Completed);
    assert_eq!(run.updated, 3);

    let stopped = harness.engine.get_apply_run(OWNER, "apply_orphan").await.unwrap();
    assert_eq!(stopped.status, ApplyRunStatus::Stopped);
    assert_eq!(stopped.stopped_reason, Some(StoppedReason::Interrupted));
    assert_eq!(stopped.unattempted, 3);
    assert!(stopped.finished_at_ms.is_some());
}

#[tokio::test]
async fn only_appliers_may_apply() {
    let harness = Harness::new();
    let draft = harness.ready_draft().await;

    let err = harness.apply_as("editor-user", &draft).await.unwrap_err();
    assert!(matches!(err, DomainError::PermissionDenied));
    assert!(harness.platform.applied_targets().is_empty());
}

#[tokio::test]
async fn edits_replace_the_applied_value() {
    let harness = Harness::new();
    let draft = harness.ready_draft().await;

    let updated = harness
        .engine
        .edit_draft_item(
            &ActorIdentity::with_user_id("editor-user"),
            OWNER,
            &draft.draft_id,
            1,
            "  Hand written title ".to_string(),
        )
        .await
        .unwrap();
    assert_eq!(updated.item.final_suggestion, "Hand written title");
    assert_eq!(updated.item.edited_by.as_deref(), Some("editor-user"));

    harness.apply_as("owner-user", &draft).await.unwrap();
    let applied = harness.platform.applied.lock().unwrap().clone();
    assert_eq!(applied[1].2, "Hand written title");
    assert_eq!(applied[1].1, "seo_title");

    let err = harness
        .engine
        .edit_draft_item(
            &ActorIdentity::with_user_id("editor-user"),
            OWNER,
            &draft.draft_id,
            0,
            "late".to_string(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::DraftApplied));
}

#[tokio::test]
async fn disabled_or_ineligible_automations_are_suppressed() {
    let harness = Harness::new();
    *harness.platform.tier.lock().unwrap() = PlanTier::Free;
    let response = harness.trigger("p1", "content_h1").await;
    assert_eq!(response.suppressed_reason, Some(SuppressReason::PlanIneligible));

    *harness.platform.tier.lock().unwrap() = PlanTier::Pro;
    harness.platform.automations.lock().unwrap()[0].enabled = false;
    let response = harness.trigger("p1", "content_h1").await;
    assert_eq!(response.suppressed_reason, Some(SuppressReason::SettingDisabled));
    assert_eq!(harness.stores.jobs.depth().await.unwrap().ready, 0);
}

#[tokio::test]
async fn scope_change_expires_the_previous_draft() {
    let harness = Harness::new();
    let draft = harness.ready_draft().await;

    harness.platform.set_targets(AUTOMATION, &["p1", "p2"]);
    let response = harness.trigger("p1", "content_h2").await;
    assert!(response.allowed);
    assert_ne!(response.draft_id.as_deref(), Some(draft.draft_id.as_str()));

    let previous = harness
        .engine
        .get_draft_by_id(OWNER, &draft.draft_id)
        .await
        .unwrap();
    assert_eq!(previous.status, DraftStatus::Expired);
}

#[tokio::test]
async fn estimate_previews_generation_without_writing() {
    let harness = Harness::new();

    let estimate = harness.engine.estimate(OWNER, AUTOMATION).await.unwrap();
    assert_eq!(estimate.eligible_count, 3);
    assert_eq!(estimate.generation_needed, 3);
    assert!(estimate.draft.is_none());
    assert_eq!(
        estimate.scope_id,
        compute_scope_id(&["p3".to_string(), "p1".to_string(), "p2".to_string()]).unwrap()
    );
    let quota = estimate.quota.expect("quota assessment");
    assert_eq!(quota.posture, QuotaPosture::Predict);
    assert_eq!(quota.used, 0);
    assert_eq!(harness.stores.jobs.depth().await.unwrap().ready, 0);
}

#[tokio::test]
async fn expired_drafts_cannot_be_applied() {
    let config = EngineConfig {
        drafts: DraftConfig {
            ttl: Duration::from_millis(300),
            sample_size: 3,
        },
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(config);
    let draft = harness.ready_draft().await;

    tokio::time::sleep(Duration::from_millis(350)).await;
    let err = harness.apply_as("owner-user", &draft).await.unwrap_err();
    assert!(matches!(err, DomainError::DraftExpired));

    let expired = harness
        .engine
        .expire_stale(now_ms())
        .await
        .unwrap();
    assert_eq!(expired, 1);
}

#[tokio::test]
async fn concurrent_creation_yields_one_live_draft() {
    let platform = Arc::new(FakePlatform::new());
    let drafts = DraftService::new(
        Arc::new(InMemoryDraftRepository::new()),
        platform,
        DraftConfig::default(),
    );
    let key = DraftKey::new(OWNER, AUTOMATION, "scope_a", "rules_a");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let drafts = drafts.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            drafts
                .get_or_create_draft(DraftSeed {
                    key,
                    target_field: "seo_title".to_string(),
                    target_ids: vec!["p1".to_string(), "p2".to_string()],
                    sample_target_ids: vec!["p1".to_string()],
                })
                .await
                .map(|draft| draft.draft_id)
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(drafts.list_by_owner(OWNER).await.unwrap().len(), 1);
}

#[tokio::test]
async fn work_queue_omits_automations_without_eligible_targets() {
    let harness = Harness::new();
    harness
        .platform
        .automations
        .lock()
        .unwrap()
        .push(automation("alt-text", true));
    harness.platform.set_targets("alt-text", &[]);
    *harness.platform.issues.lock().unwrap() = vec![
        DetectedIssue {
            issue_id: "i1".to_string(),
            automation_id: AUTOMATION.to_string(),
            action_key: "fix_seo_title".to_string(),
            scope_type: ScopeType::Products,
            detected_count: 3,
            severity: IssueSeverity::Critical,
        },
        DetectedIssue {
            issue_id: "i2".to_string(),
            automation_id: "alt-text".to_string(),
            action_key: "fix_alt_text".to_string(),
            scope_type: ScopeType::Products,
            detected_count: 9,
            severity: IssueSeverity::Critical,
        },
    ];

    let bundles = harness
        .engine
        .get_work_queue(
            OWNER,
            &ActorIdentity::with_user_id("owner-user"),
            &WorkQueueFilters::cleared(),
        )
        .await
        .unwrap();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].automation_id, AUTOMATION);
    assert_eq!(bundles[0].primary_action, Some(BundleAction::GenerateDrafts));

    let viewer = harness
        .engine
        .get_work_queue(
            OWNER,
            &ActorIdentity::with_user_id("viewer-user"),
            &WorkQueueFilters::cleared(),
        )
        .await
        .unwrap();
    assert_eq!(viewer[0].primary_action, None);
}
