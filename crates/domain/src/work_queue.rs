//! Read-time derivation of the owner's work queue.
//!
//! Bundles are composed from detected issues, live drafts, apply runs and
//! eligible targets on every call. Nothing here writes, and nothing here can
//! reach the trigger gate.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::apply::{ApplyRun, ApplyRunStatus};
use crate::automations::{
    AutomationDefinition, DetectedIssue, IssueSeverity, PendingApproval, ScopeType, target_ids,
};
use crate::drafts::{Draft, DraftKey, DraftService, DraftStatus};
use crate::fingerprint::compute_scope_id;
use crate::identity::ActorIdentity;
use crate::ports::apply_runs::ApplyRunRepository;
use crate::ports::collaborators::{
    ApprovalProvider, AutomationSettingsProvider, EligibleTargetProvider, IssueProvider,
    RoleResolver,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BundleHealth {
    Critical,
    NeedsAttention,
    PendingApproval,
    DraftsReady,
    Applied,
}

impl BundleHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::NeedsAttention => "needs_attention",
            Self::PendingApproval => "pending_approval",
            Self::DraftsReady => "drafts_ready",
            Self::Applied => "applied",
        }
    }

    fn priority(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::NeedsAttention => 1,
            Self::PendingApproval => 2,
            Self::DraftsReady => 3,
            Self::Applied => 4,
        }
    }
}

impl FromStr for BundleHealth {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "critical" => Ok(Self::Critical),
            "needs_attention" => Ok(Self::NeedsAttention),
            "pending_approval" => Ok(Self::PendingApproval),
            "drafts_ready" => Ok(Self::DraftsReady),
            "applied" => Ok(Self::Applied),
            _ => Err("unknown bundle health"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BundleAction {
    GenerateDrafts,
    ReviewDrafts,
    EditDrafts,
    RequestApproval,
    ApplyDrafts,
    ResumeApply,
}

/// Query filters. Clearing is dropping them; there is no other state.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkQueueFilters {
    pub scope_type: Option<ScopeType>,
    pub action_key: Option<String>,
    pub health: Option<BundleHealth>,
}

impl WorkQueueFilters {
    pub fn cleared() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.scope_type.is_none() && self.action_key.is_none() && self.health.is_none()
    }

    fn admits_issue(&self, issue: &DetectedIssue) -> bool {
        self.scope_type.is_none_or(|scope| scope == issue.scope_type)
            && self
                .action_key
                .as_deref()
                .is_none_or(|key| key == issue.action_key)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Bundle {
    pub bundle_id: String,
    pub automation_id: String,
    pub automation_name: String,
    pub action_key: String,
    pub scope_type: ScopeType,
    pub scope_description: String,
    pub health: BundleHealth,
    pub actionable_count: u64,
    pub detected_count: u64,
    pub draft_id: Option<String>,
    pub draft_status: Option<DraftStatus>,
    pub last_run_id: Option<String>,
    pub allowed_actions: Vec<BundleAction>,
    pub primary_action: Option<BundleAction>,
}

#[derive(Clone, Copy, Debug)]
struct Permissions {
    can_edit: bool,
    can_apply: bool,
}

/// Issues collapsed per automation and scope type.
#[derive(Clone, Debug)]
struct IssueGroup {
    automation_id: String,
    action_key: String,
    scope_type: ScopeType,
    detected_count: u64,
    critical: bool,
}

#[derive(Clone)]
pub struct WorkQueueDeriver {
    issues: Arc<dyn IssueProvider>,
    approvals: Arc<dyn ApprovalProvider>,
    settings: Arc<dyn AutomationSettingsProvider>,
    targets: Arc<dyn EligibleTargetProvider>,
    drafts: DraftService,
    runs: Arc<dyn ApplyRunRepository>,
    roles: Arc<dyn RoleResolver>,
}

impl WorkQueueDeriver {
    pub fn new(
        issues: Arc<dyn IssueProvider>,
        approvals: Arc<dyn ApprovalProvider>,
        settings: Arc<dyn AutomationSettingsProvider>,
        targets: Arc<dyn EligibleTargetProvider>,
        drafts: DraftService,
        runs: Arc<dyn ApplyRunRepository>,
        roles: Arc<dyn RoleResolver>,
    ) -> Self {
        Self {
            issues,
            approvals,
            settings,
            targets,
            drafts,
            runs,
            roles,
        }
    }

    pub async fn derive_bundles(
        &self,
        owner_id: &str,
        actor: &ActorIdentity,
        filters: &WorkQueueFilters,
    ) -> DomainResult<Vec<Bundle>> {
        let permissions = Permissions {
            can_edit: self.roles.can_edit(owner_id, &actor.user_id).await?,
            can_apply: self.roles.can_apply(owner_id, &actor.user_id).await?,
        };

        let issues = self.issues.list_detected_issues(owner_id).await?;
        let groups = group_issues(
            issues
                .into_iter()
                .filter(|issue| filters.admits_issue(issue)),
        );
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let automations: HashMap<String, AutomationDefinition> = self
            .settings
            .list_automations(owner_id)
            .await?
            .into_iter()
            .map(|automation| (automation.automation_id.clone(), automation))
            .collect();
        let approvals = self.approvals.list_pending_approvals(owner_id).await?;

        let mut bundles = Vec::with_capacity(groups.len());
        for group in groups {
            let Some(automation) = automations.get(&group.automation_id) else {
                continue;
            };
            if !automation.enabled {
                continue;
            }
            if let Some(bundle) = self
                .build_bundle(owner_id, automation, &group, &approvals, permissions)
                .await?
            {
                bundles.push(bundle);
            }
        }

        if let Some(health) = filters.health {
            bundles.retain(|bundle| bundle.health == health);
        }
        bundles.sort_by(compare_bundles);
        Ok(bundles)
    }

    async fn build_bundle(
        &self,
        owner_id: &str,
        automation: &AutomationDefinition,
        group: &IssueGroup,
        approvals: &[PendingApproval],
        permissions: Permissions,
    ) -> DomainResult<Option<Bundle>> {
        let targets = self
            .targets
            .list_eligible_targets(owner_id, &automation.automation_id)
            .await?;
        if targets.is_empty() {
            return Ok(None);
        }
        let ids = target_ids(&targets);
        let key = DraftKey::new(
            owner_id,
            automation.automation_id.clone(),
            compute_scope_id(&ids)?,
            automation.rules_hash()?,
        );
        let draft = self.drafts.get_by_key(&key).await?;
        let runs = match &draft {
            Some(draft) => self.runs.list_by_draft(&draft.draft_id).await?,
            None => Vec::new(),
        };
        let last_run = runs.iter().max_by_key(|run| run.started_at_ms);
        let pending_approval = draft.as_ref().is_some_and(|draft| {
            approvals.iter().any(|approval| {
                approval.automation_id == automation.automation_id
                    && approval
                        .draft_id
                        .as_deref()
                        .is_none_or(|draft_id| draft_id == draft.draft_id)
            })
        });

        let health = derive_health(draft.as_ref(), last_run, pending_approval, group.critical);
        let allowed_actions =
            allowed_actions(draft.as_ref(), last_run, pending_approval, permissions);
        let primary_action = if permissions.can_edit {
            primary_action(health, &allowed_actions)
        } else {
            None
        };

        let updated: std::collections::HashSet<&str> =
            runs.iter().flat_map(|run| run.updated_target_ids()).collect();
        let actionable_count = ids
            .iter()
            .filter(|id| !updated.contains(id.as_str()))
            .count() as u64;

        Ok(Some(Bundle {
            bundle_id: format!("{}:{}", automation.automation_id, group.scope_type.as_str()),
            automation_id: automation.automation_id.clone(),
            automation_name: automation.name.clone(),
            action_key: group.action_key.clone(),
            scope_type: group.scope_type,
            scope_description: format!("{} {}", ids.len(), group.scope_type.as_str()),
            health,
            actionable_count,
            detected_count: group.detected_count,
            draft_id: draft.as_ref().map(|draft| draft.draft_id.clone()),
            draft_status: draft.as_ref().map(|draft| draft.status),
            last_run_id: last_run.map(|run| run.run_id.clone()),
            allowed_actions,
            primary_action,
        }))
    }
}

fn group_issues(issues: impl Iterator<Item = DetectedIssue>) -> Vec<IssueGroup> {
    let mut order: Vec<(String, ScopeType)> = Vec::new();
    let mut groups: HashMap<(String, ScopeType), IssueGroup> = HashMap::new();
    for issue in issues {
        let key = (issue.automation_id.clone(), issue.scope_type);
        let critical = issue.severity == IssueSeverity::Critical;
        match groups.get_mut(&key) {
            Some(group) => {
                group.detected_count = group.detected_count.saturating_add(issue.detected_count);
                group.critical |= critical;
            }
            None => {
                order.push(key.clone());
                groups.insert(
                    key,
                    IssueGroup {
                        automation_id: issue.automation_id,
                        action_key: issue.action_key,
                        scope_type: issue.scope_type,
                        detected_count: issue.detected_count,
                        critical,
                    },
                );
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

fn is_stopped(run: Option<&ApplyRun>) -> bool {
    run.is_some_and(|run| run.status == ApplyRunStatus::Stopped)
}

fn derive_health(
    draft: Option<&Draft>,
    last_run: Option<&ApplyRun>,
    pending_approval: bool,
    critical: bool,
) -> BundleHealth {
    let stopped = is_stopped(last_run);
    match draft.map(|draft| draft.status) {
        Some(DraftStatus::Applied) if stopped => BundleHealth::NeedsAttention,
        Some(DraftStatus::Applied) => BundleHealth::Applied,
        Some(DraftStatus::Ready) if stopped => BundleHealth::NeedsAttention,
        Some(DraftStatus::Ready) if pending_approval => BundleHealth::PendingApproval,
        Some(DraftStatus::Ready) => BundleHealth::DraftsReady,
        _ if critical => BundleHealth::Critical,
        _ => BundleHealth::NeedsAttention,
    }
}

fn allowed_actions(
    draft: Option<&Draft>,
    last_run: Option<&ApplyRun>,
    pending_approval: bool,
    permissions: Permissions,
) -> Vec<BundleAction> {
    let status = draft.map(|draft| draft.status);
    let ready = status == Some(DraftStatus::Ready);
    let stopped = is_stopped(last_run);
    let mut actions = Vec::new();

    if permissions.can_edit
        && !matches!(status, Some(DraftStatus::Ready | DraftStatus::Applied))
    {
        actions.push(BundleAction::GenerateDrafts);
    }
    if draft.is_some() {
        actions.push(BundleAction::ReviewDrafts);
    }
    if permissions.can_edit && matches!(status, Some(DraftStatus::Partial | DraftStatus::Ready)) {
        actions.push(BundleAction::EditDrafts);
    }
    if permissions.can_edit && !permissions.can_apply && ready && !pending_approval {
        actions.push(BundleAction::RequestApproval);
    }
    if permissions.can_apply && ready && !stopped {
        actions.push(BundleAction::ApplyDrafts);
    }
    if permissions.can_apply
        && stopped
        && matches!(status, Some(DraftStatus::Ready | DraftStatus::Applied))
    {
        actions.push(BundleAction::ResumeApply);
    }
    actions
}

fn primary_action(health: BundleHealth, allowed: &[BundleAction]) -> Option<BundleAction> {
    use BundleAction::*;
    let priority: &[BundleAction] = match health {
        BundleHealth::Critical | BundleHealth::NeedsAttention => {
            &[ResumeApply, GenerateDrafts, ApplyDrafts, ReviewDrafts]
        }
        BundleHealth::PendingApproval => &[ApplyDrafts, ReviewDrafts],
        BundleHealth::DraftsReady => &[ApplyDrafts, RequestApproval, ReviewDrafts],
        BundleHealth::Applied => &[ReviewDrafts],
    };
    priority
        .iter()
        .copied()
        .find(|action| allowed.contains(action))
}

fn compare_bundles(left: &Bundle, right: &Bundle) -> Ordering {
    left.health
        .priority()
        .cmp(&right.health.priority())
        .then_with(|| right.detected_count.cmp(&left.detected_count))
        .then_with(|| left.automation_id.cmp(&right.automation_id))
}
