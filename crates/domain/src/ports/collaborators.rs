use thiserror::Error;

use super::BoxFuture;
use crate::automations::{
    AutomationDefinition, DetectedIssue, PendingApproval, PlanTier, RuleConfig, TargetDescriptor,
};
use crate::error::DomainError;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator timed out")]
    Timeout,
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
    #[error("collaborator response invalid: {0}")]
    InvalidResponse(String),
}

impl From<CollaboratorError> for DomainError {
    fn from(err: CollaboratorError) -> Self {
        DomainError::Collaborator(err.to_string())
    }
}

/// Source of the targets an automation may currently change, in enumeration
/// order.
pub trait EligibleTargetProvider: Send + Sync {
    fn list_eligible_targets(
        &self,
        owner_id: &str,
        automation_id: &str,
    ) -> BoxFuture<'_, Result<Vec<TargetDescriptor>, CollaboratorError>>;
}

/// Opaque content generation. Only draft generation may hold one of these.
pub trait GenerationCapability: Send + Sync {
    fn generate(
        &self,
        target: &TargetDescriptor,
        rules: &RuleConfig,
    ) -> BoxFuture<'_, Result<String, CollaboratorError>>;
}

/// Storefront write path. Only the apply executor may hold one of these.
pub trait CommerceConnector: Send + Sync {
    fn apply_change(
        &self,
        target_id: &str,
        field: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<(), CollaboratorError>>;
}

pub trait RoleResolver: Send + Sync {
    fn can_edit(
        &self,
        owner_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>>;

    fn can_apply(
        &self,
        owner_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>>;
}

/// Automation configuration and plan entitlement of an owner.
pub trait AutomationSettingsProvider: Send + Sync {
    fn get_automation(
        &self,
        owner_id: &str,
        automation_id: &str,
    ) -> BoxFuture<'_, Result<Option<AutomationDefinition>, CollaboratorError>>;

    fn list_automations(
        &self,
        owner_id: &str,
    ) -> BoxFuture<'_, Result<Vec<AutomationDefinition>, CollaboratorError>>;

    fn plan_tier(&self, owner_id: &str) -> BoxFuture<'_, Result<PlanTier, CollaboratorError>>;
}

pub trait IssueProvider: Send + Sync {
    fn list_detected_issues(
        &self,
        owner_id: &str,
    ) -> BoxFuture<'_, Result<Vec<DetectedIssue>, CollaboratorError>>;
}

pub trait ApprovalProvider: Send + Sync {
    fn list_pending_approvals(
        &self,
        owner_id: &str,
    ) -> BoxFuture<'_, Result<Vec<PendingApproval>, CollaboratorError>>;
}
