//! Applies an accepted draft to the storefront, one item at a time.
//!
//! The executor holds no generation capability. Items are applied
//! sequentially in the draft's enumeration order and the run stops at the
//! first failed item or at the first quota rejection.
//!
//! Once a run is stored it executes on its own task, so a caller that goes
//! away cannot cancel it. Every item result is persisted as it completes and
//! refreshes the run's heartbeat; a `Running` run whose heartbeat is older
//! than the lease is stopped as `interrupted` by the next apply.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::automations::{PlanTier, target_ids};
use crate::drafts::{Draft, DraftService, DraftStatus, MarkApplied};
use crate::error::DomainError;
use crate::fingerprint::compute_scope_id;
use crate::identity::ActorIdentity;
use crate::jobs::now_ms;
use crate::ports::apply_runs::ApplyRunRepository;
use crate::ports::collaborators::{
    AutomationSettingsProvider, CommerceConnector, EligibleTargetProvider, RoleResolver,
};
use crate::quota::{QuotaController, QuotaResource};
use crate::util::{prefixed_id, truncate_message};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyItemStatus {
    Updated,
    Skipped,
    Failed,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoContent,
    AlreadyApplied,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApplyItemResult {
    pub target_id: String,
    pub item_index: usize,
    pub status: ApplyItemStatus,
    pub skip_reason: Option<SkipReason>,
    pub error_message: Option<String>,
    pub completed_at_ms: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoppedReason {
    LimitReached,
    ItemFailed,
    Interrupted,
}

impl StoppedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LimitReached => "limit_reached",
            Self::ItemFailed => "item_failed",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyRunStatus {
    Running,
    Completed,
    Stopped,
}

impl ApplyRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApplyRun {
    pub run_id: String,
    pub draft_id: String,
    pub owner_id: String,
    pub automation_id: String,
    pub requested_by: String,
    pub status: ApplyRunStatus,
    pub attempted: u32,
    pub updated: u32,
    pub skipped: u32,
    pub failed: u32,
    pub unattempted: u32,
    pub stopped_reason: Option<StoppedReason>,
    pub error_message: Option<String>,
    pub results: Vec<ApplyItemResult>,
    pub started_at_ms: i64,
    #[serde(default)]
    pub heartbeat_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

impl ApplyRun {
    fn start(draft: &Draft, actor: &ActorIdentity, now: i64) -> Self {
        Self {
            run_id: prefixed_id("apply"),
            draft_id: draft.draft_id.clone(),
            owner_id: draft.owner_id.clone(),
            automation_id: draft.automation_id.clone(),
            requested_by: actor.user_id.clone(),
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
        }
    }

    fn record(&mut self, result: ApplyItemResult) {
        match result.status {
            ApplyItemStatus::Updated => {
                self.attempted += 1;
                self.updated += 1;
            }
            ApplyItemStatus::Failed => {
                self.attempted += 1;
                self.failed += 1;
            }
            ApplyItemStatus::Skipped => self.skipped += 1,
        }
        self.heartbeat_at_ms = result.completed_at_ms;
        self.results.push(result);
    }

    fn finish(&mut self, item_count: usize, now: i64) {
        self.unattempted = item_count.saturating_sub(self.results.len()) as u32;
        self.status = if self.stopped_reason.is_some() {
            ApplyRunStatus::Stopped
        } else {
            ApplyRunStatus::Completed
        };
        self.heartbeat_at_ms = now;
        self.finished_at_ms = Some(now);
    }

    pub fn updated_target_ids(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|result| result.status == ApplyItemStatus::Updated)
            .map(|result| result.target_id.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ApplyRequest {
    pub owner_id: String,
    pub draft_id: String,
    pub scope_id: String,
    pub rules_hash: String,
}

#[derive(Clone, Debug)]
pub struct ApplyConfig {
    pub item_timeout: Duration,
    /// How long a `Running` run may go without a saved item before another
    /// apply may stop it. Kept above `item_timeout`.
    pub run_lease: Duration,
}

impl ApplyConfig {
    fn lease_ms(&self) -> i64 {
        self.run_lease.max(self.item_timeout * 2).as_millis() as i64
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            item_timeout: Duration::from_secs(10),
            run_lease: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct ApplyExecutor {
    drafts: DraftService,
    runs: Arc<dyn ApplyRunRepository>,
    quota: QuotaController,
    targets: Arc<dyn EligibleTargetProvider>,
    settings: Arc<dyn AutomationSettingsProvider>,
    connector: Arc<dyn CommerceConnector>,
    roles: Arc<dyn RoleResolver>,
    config: ApplyConfig,
}

enum ItemOutcome {
    Done(ApplyItemResult),
    Stop(StoppedReason, Option<ApplyItemResult>, String),
}

impl ApplyExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        drafts: DraftService,
        runs: Arc<dyn ApplyRunRepository>,
        quota: QuotaController,
        targets: Arc<dyn EligibleTargetProvider>,
        settings: Arc<dyn AutomationSettingsProvider>,
        connector: Arc<dyn CommerceConnector>,
        roles: Arc<dyn RoleResolver>,
        config: ApplyConfig,
    ) -> Self {
        Self {
            drafts,
            runs,
            quota,
            targets,
            settings,
            connector,
            roles,
            config,
        }
    }

    pub async fn apply_draft(
        &self,
        actor: &ActorIdentity,
        request: &ApplyRequest,
    ) -> DomainResult<ApplyRun> {
        if !self
            .roles
            .can_apply(&request.owner_id, &actor.user_id)
            .await?
        {
            return Err(DomainError::PermissionDenied);
        }

        let draft = self.drafts.get(&request.draft_id).await?;
        if draft.owner_id != request.owner_id {
            return Err(DomainError::NotFound);
        }
        match draft.status {
            DraftStatus::Expired => return Err(DomainError::DraftExpired),
            DraftStatus::Partial => return Err(DomainError::DraftNotReady),
            DraftStatus::Ready | DraftStatus::Applied => {}
        }
        if draft.is_expired_at(now_ms()) {
            return Err(DomainError::DraftExpired);
        }

        if request.scope_id != draft.scope_id {
            return Err(self.reject(&draft, DomainError::ScopeInvalid));
        }
        if request.rules_hash != draft.rules_hash {
            return Err(self.reject(&draft, DomainError::RulesChanged));
        }
        self.revalidate(&draft).await?;

        let tier = self.settings.plan_tier(&draft.owner_id).await?;
        let run = self.open_run(&draft, actor).await?;
        tracing::info!(
            run_id = %run.run_id,
            draft_id = %draft.draft_id,
            owner_id = %draft.owner_id,
            "apply run started"
        );

        let executor = self.clone();
        let task = tokio::spawn(async move { executor.execute(draft, tier, run).await });
        task.await
            .map_err(|err| DomainError::Storage(format!("apply task ended abnormally: {err}")))?
    }

    async fn execute(&self, draft: Draft, tier: PlanTier, mut run: ApplyRun) -> DomainResult<ApplyRun> {
        let already_updated = self.updated_targets(&draft.draft_id).await?;

        for (item_index, target_id) in draft.target_ids.iter().enumerate() {
            let outcome = self
                .apply_item(&draft, &run.run_id, tier, item_index, target_id, &already_updated)
                .await;
            let stop = match outcome {
                ItemOutcome::Done(result) => {
                    run.record(result);
                    false
                }
                ItemOutcome::Stop(reason, result, message) => {
                    if let Some(result) = result {
                        run.record(result);
                    }
                    run.stopped_reason = Some(reason);
                    run.error_message = Some(truncate_message(&message));
                    true
                }
            };
            if stop {
                break;
            }
            run = self.save_progress(&run).await?;
        }

        run.finish(draft.target_ids.len(), now_ms());
        let run = self.save_progress(&run).await?;

        if run.updated > 0 || run.stopped_reason.is_none() {
            match self.drafts.mark_applied(&draft.draft_id).await {
                Ok(MarkApplied::Applied(_)) | Ok(MarkApplied::AlreadyApplied(_)) => {}
                Err(err) => tracing::warn!(
                    draft_id = %draft.draft_id,
                    error = %err,
                    "failed to mark draft applied"
                ),
            }
        }

        tracing::info!(
            run_id = %run.run_id,
            draft_id = %run.draft_id,
            status = run.status.as_str(),
            updated = run.updated,
            skipped = run.skipped,
            failed = run.failed,
            unattempted = run.unattempted,
            "apply run finished"
        );
        Ok(run)
    }

    /// A conflict here means the run was stopped from outside after its
    /// lease ran out; this task must not touch the draft any further.
    async fn save_progress(&self, run: &ApplyRun) -> DomainResult<ApplyRun> {
        match self.runs.update_running(run).await {
            Err(DomainError::Conflict) => {
                tracing::warn!(run_id = %run.run_id, "apply run was reclaimed while executing");
                Err(DomainError::ApplyInProgress)
            }
            other => other,
        }
    }

    async fn open_run(&self, draft: &Draft, actor: &ActorIdentity) -> DomainResult<ApplyRun> {
        let run = ApplyRun::start(draft, actor, now_ms());
        match self.runs.create(&run).await {
            Err(DomainError::Conflict) => {}
            other => return other,
        }
        if !self.reclaim_expired_run(draft).await? {
            return Err(DomainError::ApplyInProgress);
        }
        match self.runs.create(&run).await {
            Err(DomainError::Conflict) => Err(DomainError::ApplyInProgress),
            other => other,
        }
    }

    /// Stops the draft's running run when its lease has lapsed. Returns
    /// whether the draft is free for a new run.
    async fn reclaim_expired_run(&self, draft: &Draft) -> DomainResult<bool> {
        let now = now_ms();
        let lease_ms = self.config.lease_ms();
        let running = self
            .runs
            .list_by_draft(&draft.draft_id)
            .await?
            .into_iter()
            .find(|run| run.status == ApplyRunStatus::Running);
        let Some(mut stale) = running else {
            return Ok(true);
        };
        if now.saturating_sub(stale.heartbeat_at_ms) < lease_ms {
            return Ok(false);
        }

        stale.stopped_reason = Some(StoppedReason::Interrupted);
        stale.error_message = Some(format!("no progress saved for {lease_ms}ms"));
        stale.finish(draft.target_ids.len(), now);
        match self.runs.update_running(&stale).await {
            Ok(_) | Err(DomainError::Conflict) => {}
            Err(err) => return Err(err),
        }
        tracing::warn!(
            run_id = %stale.run_id,
            draft_id = %draft.draft_id,
            updated = stale.updated,
            "stale apply run stopped"
        );
        Ok(true)
    }

    pub async fn get_run(&self, run_id: &str) -> DomainResult<ApplyRun> {
        self.runs.get(run_id).await?.ok_or(DomainError::NotFound)
    }

    pub async fn list_runs(&self, draft_id: &str) -> DomainResult<Vec<ApplyRun>> {
        self.runs.list_by_draft(draft_id).await
    }

    pub async fn list_runs_by_owner(&self, owner_id: &str) -> DomainResult<Vec<ApplyRun>> {
        self.runs.list_by_owner(owner_id).await
    }

    /// Recomputes the fingerprints from current state; any drift rejects the
    /// whole apply before a run exists.
    async fn revalidate(&self, draft: &Draft) -> DomainResult<()> {
        let targets = self
            .targets
            .list_eligible_targets(&draft.owner_id, &draft.automation_id)
            .await?;
        let current_scope = compute_scope_id(&target_ids(&targets))?;
        if current_scope != draft.scope_id {
            return Err(self.reject(draft, DomainError::ScopeInvalid));
        }

        let automation = self
            .settings
            .get_automation(&draft.owner_id, &draft.automation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if automation.rules_hash()? != draft.rules_hash {
            return Err(self.reject(draft, DomainError::RulesChanged));
        }
        Ok(())
    }

    async fn updated_targets(&self, draft_id: &str) -> DomainResult<HashSet<String>> {
        let runs = self.runs.list_by_draft(draft_id).await?;
        Ok(runs
            .iter()
            .flat_map(|run| run.updated_target_ids())
            .map(str::to_string)
            .collect())
    }

    async fn apply_item(
        &self,
        draft: &Draft,
        run_id: &str,
        tier: PlanTier,
        item_index: usize,
        target_id: &str,
        already_updated: &HashSet<String>,
    ) -> ItemOutcome {
        let skipped = |reason| {
            ItemOutcome::Done(ApplyItemResult {
                target_id: target_id.to_string(),
                item_index,
                status: ApplyItemStatus::Skipped,
                skip_reason: Some(reason),
                error_message: None,
                completed_at_ms: now_ms(),
            })
        };

        if already_updated.contains(target_id) {
            return skipped(SkipReason::AlreadyApplied);
        }
        let Some(value) = draft
            .item_for(target_id)
            .and_then(|item| item.usable_suggestion())
        else {
            return skipped(SkipReason::NoContent);
        };

        let reference = format!("{run_id}:{target_id}");
        match self
            .quota
            .admit(&draft.owner_id, tier, QuotaResource::AppliedChange, 1, &reference)
            .await
        {
            Ok(_) => {}
            Err(err @ DomainError::QuotaExceeded { .. }) => {
                tracing::info!(run_id, target_id, "apply run stopped at quota limit");
                return ItemOutcome::Stop(StoppedReason::LimitReached, None, err.to_string());
            }
            Err(err) => {
                let message = err.to_string();
                return ItemOutcome::Stop(
                    StoppedReason::ItemFailed,
                    Some(failed(target_id, item_index, &message)),
                    message,
                );
            }
        }

        let call = self
            .connector
            .apply_change(target_id, &draft.target_field, value);
        let error = match tokio::time::timeout(self.config.item_timeout, call).await {
            Ok(Ok(())) => {
                return ItemOutcome::Done(ApplyItemResult {
                    target_id: target_id.to_string(),
                    item_index,
                    status: ApplyItemStatus::Updated,
                    skip_reason: None,
                    error_message: None,
                    completed_at_ms: now_ms(),
                });
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!(
                "apply timed out after {}ms",
                self.config.item_timeout.as_millis()
            ),
        };

        tracing::warn!(run_id, target_id, error = %error, "apply item failed");
        if let Err(err) = self
            .quota
            .refund(&draft.owner_id, QuotaResource::AppliedChange, 1, &reference)
            .await
        {
            tracing::warn!(run_id, target_id, error = %err, "quota refund failed");
        }
        ItemOutcome::Stop(
            StoppedReason::ItemFailed,
            Some(failed(target_id, item_index, &error)),
            error,
        )
    }

    fn reject(&self, draft: &Draft, err: DomainError) -> DomainError {
        tracing::info!(
            draft_id = %draft.draft_id,
            owner_id = %draft.owner_id,
            code = err.code(),
            "apply rejected on drift"
        );
        err
    }
}

fn failed(target_id: &str, item_index: usize, message: &str) -> ApplyItemResult {
    ApplyItemResult {
        target_id: target_id.to_string(),
        item_index,
        status: ApplyItemStatus::Failed,
        skip_reason: None,
        error_message: Some(truncate_message(message)),
        completed_at_ms: now_ms(),
    }
}
