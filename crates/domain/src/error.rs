use thiserror::Error;

use crate::quota::{Allowance, QuotaResource};

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("permission denied")]
    PermissionDenied,
    #[error("draft is already applied")]
    DraftApplied,
    #[error("draft is expired")]
    DraftExpired,
    #[error("draft is not ready to apply")]
    DraftNotReady,
    #[error("draft scope no longer matches the eligible targets")]
    ScopeInvalid,
    #[error("draft rules no longer match the automation configuration")]
    RulesChanged,
    #[error("quota exceeded for {resource}: requested {requested}, remaining {remaining}")]
    QuotaExceeded {
        resource: QuotaResource,
        requested: u64,
        remaining: Allowance,
    },
    #[error("an apply run is already in progress for this draft")]
    ApplyInProgress,
    #[error("storage unavailable: {0}")]
    Storage(String),
    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

impl DomainError {
    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::PermissionDenied => "permission_denied",
            Self::DraftApplied => "DRAFT_APPLIED",
            Self::DraftExpired => "DRAFT_EXPIRED",
            Self::DraftNotReady => "DRAFT_NOT_READY",
            Self::ScopeInvalid => "PLAYBOOK_SCOPE_INVALID",
            Self::RulesChanged => "PLAYBOOK_RULES_CHANGED",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::ApplyInProgress => "APPLY_IN_PROGRESS",
            Self::Storage(_) => "storage_unavailable",
            Self::Collaborator(_) => "collaborator_error",
        }
    }

    pub fn is_drift(&self) -> bool {
        matches!(self, Self::ScopeInvalid | Self::RulesChanged)
    }
}
