use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::DomainResult;
use crate::fingerprint;

/// Normalizable configuration controlling how content is generated.
pub type RuleConfig = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Products,
    Collections,
    Pages,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::Collections => "collections",
            Self::Pages => "pages",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }
}

impl FromStr for ScopeType {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "products" => Ok(Self::Products),
            "collections" => Ok(Self::Collections),
            "pages" => Ok(Self::Pages),
            _ => Err("unknown scope type"),
        }
    }
}

/// Subscription tier; ordering follows entitlement.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Pro,
    Business,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Business => "business",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }

    pub fn permits(&self, required: PlanTier) -> bool {
        *self >= required
    }
}

impl FromStr for PlanTier {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" | "starter" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "business" | "enterprise" => Ok(Self::Business),
            _ => Err("unknown plan tier"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutomationDefinition {
    pub automation_id: String,
    pub owner_id: String,
    pub name: String,
    pub action_key: String,
    pub scope_type: ScopeType,
    pub target_field: String,
    pub enabled: bool,
    pub min_plan: PlanTier,
    #[serde(default)]
    pub rule_config: RuleConfig,
}

impl AutomationDefinition {
    pub fn rules_hash(&self) -> DomainResult<String> {
        fingerprint::compute_rules_hash(&self.rule_config)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TargetDescriptor {
    pub target_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub current_value: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl TargetDescriptor {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            title: None,
            current_value: None,
            fields: serde_json::Map::new(),
        }
    }

    /// Hash over the mutable content a change to this target would touch.
    pub fn content_hash(&self) -> DomainResult<String> {
        let content = serde_json::json!({
            "title": self.title,
            "current_value": self.current_value,
            "fields": self.fields,
        });
        fingerprint::compute_content_hash(&content)
    }
}

pub fn target_ids(targets: &[TargetDescriptor]) -> Vec<String> {
    targets.iter().map(|target| target.target_id.clone()).collect()
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Warning,
    Info,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectedIssue {
    pub issue_id: String,
    pub automation_id: String,
    pub action_key: String,
    pub scope_type: ScopeType,
    pub detected_count: u64,
    pub severity: IssueSeverity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingApproval {
    pub approval_id: String,
    pub automation_id: String,
    #[serde(default)]
    pub draft_id: Option<String>,
    pub requested_by: String,
    pub requested_at_ms: i64,
}
