//! Quota admission: Predict, Warn and Enforce postures over an append-only
//! usage ledger.
//!
//! Usage within a fixed window is the sum of consumption entries minus the
//! sum of offset entries (refunds and administrative resets), floored at
//! zero. History is never rewritten.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::DomainResult;
use crate::automations::PlanTier;
use crate::error::DomainError;
use crate::jobs::now_ms;
use crate::ports::quota::{AppendOutcome, QuotaLedgerRepository};
use crate::util::prefixed_id;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    GenerationCall,
    AppliedChange,
}

impl QuotaResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerationCall => "generation_call",
            Self::AppliedChange => "applied_change",
        }
    }
}

impl fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaResource {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "generation_call" => Ok(Self::GenerationCall),
            "applied_change" => Ok(Self::AppliedChange),
            _ => Err("unknown quota resource"),
        }
    }
}

/// A limit or remaining amount. `Unlimited` is its own value and is never
/// approximated by a large number. Serialized as a count or `"unlimited"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Allowance {
    Unlimited,
    Limited(u64),
}

impl Allowance {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("unlimited") {
            return Some(Self::Unlimited);
        }
        value.parse().ok().map(Self::Limited)
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    fn remaining_after(&self, used: u64) -> Self {
        match self {
            Self::Unlimited => Self::Unlimited,
            Self::Limited(limit) => Self::Limited(limit.saturating_sub(used)),
        }
    }
}

impl fmt::Display for Allowance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Limited(value) => write!(f, "{value}"),
        }
    }
}

impl Serialize for Allowance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unlimited => serializer.serialize_str("unlimited"),
            Self::Limited(value) => serializer.serialize_u64(*value),
        }
    }
}

impl<'de> Deserialize<'de> for Allowance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(value) => Ok(Self::Limited(value)),
            Raw::Text(text) => Self::parse(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid allowance '{text}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub limit: Allowance,
    pub soft_threshold_pct: u8,
    pub enforce: bool,
}

impl QuotaPolicy {
    pub fn limited(limit: u64) -> Self {
        Self {
            limit: Allowance::Limited(limit),
            soft_threshold_pct: 80,
            enforce: true,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limit: Allowance::Unlimited,
            soft_threshold_pct: 80,
            enforce: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QuotaConfig {
    pub window: Duration,
    policies: BTreeMap<(PlanTier, QuotaResource), QuotaPolicy>,
}

impl QuotaConfig {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            policies: BTreeMap::new(),
        }
    }

    pub fn with_policy(
        mut self,
        tier: PlanTier,
        resource: QuotaResource,
        policy: QuotaPolicy,
    ) -> Self {
        self.policies.insert((tier, resource), policy);
        self
    }

    /// Tiers without a configured policy are unlimited.
    pub fn policy(&self, tier: PlanTier, resource: QuotaResource) -> QuotaPolicy {
        self.policies
            .get(&(tier, resource))
            .copied()
            .unwrap_or_else(QuotaPolicy::unlimited)
    }

    pub fn window_start(&self, now_ms: i64) -> i64 {
        let window_ms = self.window.as_millis() as i64;
        if window_ms <= 0 {
            return now_ms;
        }
        now_ms - now_ms.rem_euclid(window_ms)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(60 * 60 * 24 * 30))
            .with_policy(PlanTier::Free, QuotaResource::GenerationCall, QuotaPolicy::limited(50))
            .with_policy(PlanTier::Free, QuotaResource::AppliedChange, QuotaPolicy::limited(25))
            .with_policy(PlanTier::Pro, QuotaResource::GenerationCall, QuotaPolicy::limited(1_000))
            .with_policy(PlanTier::Pro, QuotaResource::AppliedChange, QuotaPolicy::limited(500))
            .with_policy(PlanTier::Business, QuotaResource::GenerationCall, QuotaPolicy::unlimited())
            .with_policy(PlanTier::Business, QuotaResource::AppliedChange, QuotaPolicy::unlimited())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPosture {
    Predict,
    Warn,
    Enforce,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QuotaAssessment {
    pub resource: QuotaResource,
    pub posture: QuotaPosture,
    pub allowed: bool,
    pub used: u64,
    pub requested: u64,
    pub limit: Allowance,
    pub remaining: Allowance,
    pub utilization_pct: f64,
    pub advisory: Option<String>,
    pub upgrade_nudge: bool,
    pub window_start_ms: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Consumption,
    Offset,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QuotaLedgerEntry {
    pub entry_id: String,
    pub owner_id: String,
    pub resource: QuotaResource,
    pub kind: LedgerEntryKind,
    pub units: u64,
    pub window_start_ms: i64,
    pub reference: String,
    pub created_at_ms: i64,
}

/// Net usage of one resource across ledger entries, floored at zero.
pub fn net_usage<'a>(
    entries: impl IntoIterator<Item = &'a QuotaLedgerEntry>,
    resource: QuotaResource,
) -> u64 {
    let (consumed, offset) = entries
        .into_iter()
        .filter(|entry| entry.resource == resource)
        .fold((0u64, 0u64), |(consumed, offset), entry| match entry.kind {
            LedgerEntryKind::Consumption => (consumed.saturating_add(entry.units), offset),
            LedgerEntryKind::Offset => (consumed, offset.saturating_add(entry.units)),
        });
    consumed.saturating_sub(offset)
}

/// Pure posture evaluation for `requested` more units on top of `used`.
pub fn evaluate(
    resource: QuotaResource,
    policy: &QuotaPolicy,
    used: u64,
    requested: u64,
    window_start_ms: i64,
) -> QuotaAssessment {
    let mut assessment = QuotaAssessment {
        resource,
        posture: QuotaPosture::Predict,
        allowed: true,
        used,
        requested,
        limit: policy.limit,
        remaining: policy.limit.remaining_after(used),
        utilization_pct: 0.0,
        advisory: None,
        upgrade_nudge: false,
        window_start_ms,
    };

    let Allowance::Limited(limit) = policy.limit else {
        return assessment;
    };

    let projected = used.saturating_add(requested);
    let threshold = f64::from(policy.soft_threshold_pct);
    assessment.utilization_pct = percent(used, limit);
    let projected_pct = percent(projected, limit);

    if policy.enforce && projected > limit {
        assessment.posture = QuotaPosture::Enforce;
        assessment.allowed = false;
        assessment.upgrade_nudge = true;
        return assessment;
    }

    if assessment.utilization_pct >= threshold {
        assessment.posture = QuotaPosture::Warn;
        assessment.upgrade_nudge = true;
        assessment.advisory = Some(format!(
            "{resource} usage is at {:.0}% of the plan limit",
            assessment.utilization_pct
        ));
    } else if projected_pct >= threshold {
        assessment.advisory = Some(format!(
            "this action would bring {resource} usage to {projected_pct:.0}% of the plan limit"
        ));
    }
    assessment
}

fn percent(value: u64, limit: u64) -> f64 {
    if limit == 0 {
        return if value == 0 { 0.0 } else { 100.0 };
    }
    value as f64 * 100.0 / limit as f64
}

#[derive(Clone)]
pub struct QuotaController {
    ledger: Arc<dyn QuotaLedgerRepository>,
    config: QuotaConfig,
}

impl QuotaController {
    pub fn new(ledger: Arc<dyn QuotaLedgerRepository>, config: QuotaConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Read-only evaluation; never appends.
    pub async fn assess(
        &self,
        owner_id: &str,
        tier: PlanTier,
        resource: QuotaResource,
        units: u64,
    ) -> DomainResult<QuotaAssessment> {
        ensure_units(units)?;
        let policy = self.config.policy(tier, resource);
        let window_start = self.config.window_start(now_ms());
        let used = self
            .ledger
            .used_in_window(owner_id, resource, window_start)
            .await?;
        Ok(evaluate(resource, &policy, used, units, window_start))
    }

    /// Evaluates and consumes `units` in one step. Enforced rejections
    /// consume nothing.
    pub async fn admit(
        &self,
        owner_id: &str,
        tier: PlanTier,
        resource: QuotaResource,
        units: u64,
        reference: &str,
    ) -> DomainResult<QuotaAssessment> {
        ensure_units(units)?;
        let policy = self.config.policy(tier, resource);
        let now = now_ms();
        let window_start = self.config.window_start(now);
        let entry = ledger_entry(
            owner_id,
            resource,
            LedgerEntryKind::Consumption,
            units,
            window_start,
            reference,
            now,
        );

        let used = match (policy.limit, policy.enforce) {
            (Allowance::Limited(limit), true) => {
                match self.ledger.append_within_limit(&entry, limit).await? {
                    AppendOutcome::Appended { used_after } => used_after.saturating_sub(units),
                    AppendOutcome::Rejected { used } => {
                        let remaining = policy.limit.remaining_after(used);
                        tracing::info!(
                            owner_id,
                            resource = resource.as_str(),
                            requested = units,
                            remaining = %remaining,
                            "quota admission rejected"
                        );
                        return Err(DomainError::QuotaExceeded {
                            resource,
                            requested: units,
                            remaining,
                        });
                    }
                }
            }
            _ => {
                let used = self
                    .ledger
                    .used_in_window(owner_id, resource, window_start)
                    .await?;
                self.ledger.append(&entry).await?;
                used
            }
        };

        let assessment = evaluate(resource, &policy, used, units, window_start);
        if assessment.posture == QuotaPosture::Warn {
            tracing::info!(
                owner_id,
                resource = resource.as_str(),
                utilization_pct = assessment.utilization_pct,
                "quota soft threshold reached"
            );
        }
        Ok(assessment)
    }

    /// Offsets consumption whose action did not happen.
    pub async fn refund(
        &self,
        owner_id: &str,
        resource: QuotaResource,
        units: u64,
        reference: &str,
    ) -> DomainResult<()> {
        ensure_units(units)?;
        let now = now_ms();
        let entry = ledger_entry(
            owner_id,
            resource,
            LedgerEntryKind::Offset,
            units,
            self.config.window_start(now),
            reference,
            now,
        );
        self.ledger.append(&entry).await
    }

    /// Administrative reset of the current window. Returns the offset units.
    pub async fn reset(&self, owner_id: &str, resource: QuotaResource) -> DomainResult<u64> {
        let now = now_ms();
        let window_start = self.config.window_start(now);
        let used = self
            .ledger
            .used_in_window(owner_id, resource, window_start)
            .await?;
        if used == 0 {
            return Ok(0);
        }
        let entry = ledger_entry(
            owner_id,
            resource,
            LedgerEntryKind::Offset,
            used,
            window_start,
            "admin_reset",
            now,
        );
        self.ledger.append(&entry).await?;
        tracing::info!(owner_id, resource = resource.as_str(), used, "quota window reset");
        Ok(used)
    }
}

fn ensure_units(units: u64) -> DomainResult<()> {
    if units == 0 {
        return Err(DomainError::InvalidInput(
            "quota units must be greater than zero".into(),
        ));
    }
    Ok(())
}

fn ledger_entry(
    owner_id: &str,
    resource: QuotaResource,
    kind: LedgerEntryKind,
    units: u64,
    window_start_ms: i64,
    reference: &str,
    now: i64,
) -> QuotaLedgerEntry {
    QuotaLedgerEntry {
        entry_id: prefixed_id("qle"),
        owner_id: owner_id.to_string(),
        resource,
        kind,
        units,
        window_start_ms,
        reference: reference.to_string(),
        created_at_ms: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(limit: u64) -> QuotaPolicy {
        QuotaPolicy::limited(limit)
    }

    #[test]
    fn predict_advises_when_projection_reaches_threshold() {
        let assessment = evaluate(QuotaResource::GenerationCall, &policy(100), 79, 1, 0);
        assert_eq!(assessment.posture, QuotaPosture::Predict);
        assert!(assessment.allowed);
        assert!(assessment.advisory.is_some());
        assert!(!assessment.upgrade_nudge);
    }

    #[test]
    fn predict_is_silent_below_threshold() {
        let assessment = evaluate(QuotaResource::GenerationCall, &policy(100), 10, 1, 0);
        assert_eq!(assessment.posture, QuotaPosture::Predict);
        assert_eq!(assessment.advisory, None);
    }

    #[test]
    fn warn_sets_upgrade_nudge_but_allows() {
        let assessment = evaluate(QuotaResource::GenerationCall, &policy(100), 81, 1, 0);
        assert_eq!(assessment.posture, QuotaPosture::Warn);
        assert!(assessment.allowed);
        assert!(assessment.upgrade_nudge);
    }

    #[test]
    fn enforce_rejects_whole_request_and_reports_remaining() {
        let assessment = evaluate(QuotaResource::AppliedChange, &policy(10), 9, 2, 0);
        assert_eq!(assessment.posture, QuotaPosture::Enforce);
        assert!(!assessment.allowed);
        assert_eq!(assessment.remaining, Allowance::Limited(1));
    }

    #[test]
    fn unenforced_policy_only_warns_past_limit() {
        let mut relaxed = policy(10);
        relaxed.enforce = false;
        let assessment = evaluate(QuotaResource::AppliedChange, &relaxed, 12, 1, 0);
        assert_eq!(assessment.posture, QuotaPosture::Warn);
        assert!(assessment.allowed);
        assert_eq!(assessment.remaining, Allowance::Limited(0));
    }

    #[test]
    fn unlimited_is_a_distinct_sentinel() {
        let assessment = evaluate(
            QuotaResource::GenerationCall,
            &QuotaPolicy::unlimited(),
            1_000_000,
            5,
            0,
        );
        assert!(assessment.allowed);
        assert_eq!(assessment.remaining, Allowance::Unlimited);
        assert_eq!(
            serde_json::to_value(assessment.remaining).expect("json"),
            serde_json::json!("unlimited")
        );
        assert_eq!(
            serde_json::to_value(Allowance::Limited(3)).expect("json"),
            serde_json::json!(3)
        );
    }

    #[test]
    fn allowance_parses_count_or_unlimited() {
        assert_eq!(Allowance::parse("unlimited"), Some(Allowance::Unlimited));
        assert_eq!(Allowance::parse(" 25 "), Some(Allowance::Limited(25)));
        assert_eq!(Allowance::parse("lots"), None);
        let parsed: Allowance = serde_json::from_str("\"UNLIMITED\"").expect("allowance");
        assert_eq!(parsed, Allowance::Unlimited);
    }

    #[test]
    fn net_usage_subtracts_offsets_and_floors_at_zero() {
        let entry = |kind, units| QuotaLedgerEntry {
            entry_id: "e".to_string(),
            owner_id: "o".to_string(),
            resource: QuotaResource::GenerationCall,
            kind,
            units,
            window_start_ms: 0,
            reference: "r".to_string(),
            created_at_ms: 0,
        };
        let entries = vec![
            entry(LedgerEntryKind::Consumption, 5),
            entry(LedgerEntryKind::Offset, 2),
        ];
        assert_eq!(net_usage(&entries, QuotaResource::GenerationCall), 3);
        assert_eq!(net_usage(&entries, QuotaResource::AppliedChange), 0);

        let over = vec![entry(LedgerEntryKind::Offset, 4)];
        assert_eq!(net_usage(&over, QuotaResource::GenerationCall), 0);
    }

    #[test]
    fn window_start_is_aligned_to_window() {
        let config = QuotaConfig::new(Duration::from_millis(1_000));
        assert_eq!(config.window_start(12_345), 12_000);
    }

    #[test]
    fn missing_policy_defaults_to_unlimited() {
        let config = QuotaConfig::new(Duration::from_secs(60));
        assert_eq!(
            config.policy(PlanTier::Free, QuotaResource::GenerationCall).limit,
            Allowance::Unlimited
        );
    }
}
