//! HTTP clients for the merchant platform and the generation service.

use std::time::Duration;

use playbook_domain::auth::Role;
use playbook_domain::automations::{
    AutomationDefinition, DetectedIssue, PendingApproval, PlanTier, RuleConfig, TargetDescriptor,
};
use playbook_domain::ports::BoxFuture;
use playbook_domain::ports::collaborators::{
    ApprovalProvider, AutomationSettingsProvider, CollaboratorError, CommerceConnector,
    EligibleTargetProvider, GenerationCapability, IssueProvider, RoleResolver,
};
use metrics::counter;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use url::Url;

use crate::config::AppConfig;

const PLATFORM_TOKEN_HEADER: &str = "X-Platform-Token";
const COLLABORATOR_CALLS_TOTAL: &str = "playbook_collaborator_calls_total";

#[derive(Debug, Deserialize)]
struct TargetsResponse {
    targets: Vec<TargetDescriptor>,
}

#[derive(Debug, Deserialize)]
struct AutomationsResponse {
    automations: Vec<AutomationDefinition>,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    tier: String,
}

#[derive(Debug, Deserialize)]
struct MemberResponse {
    role: String,
}

#[derive(Debug, Deserialize)]
struct IssuesResponse {
    issues: Vec<DetectedIssue>,
}

#[derive(Debug, Deserialize)]
struct ApprovalsResponse {
    approvals: Vec<PendingApproval>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    suggestion: String,
}

/// Merchant platform API: catalog reads and writes, automation settings,
/// plan, membership, detected issues and approvals.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl PlatformClient {
    pub fn from_config(config: &AppConfig) -> Result<Self, CollaboratorError> {
        let token = config.platform_token.trim();
        Self::new(
            &config.platform_base_url,
            (!token.is_empty()).then(|| token.to_string()),
            Duration::from_millis(config.platform_timeout_ms.max(1)),
        )
    }

    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http: build_http(timeout)?,
            base_url: parse_base_url(base_url)?,
            token,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Option<T>, CollaboratorError> {
        observe("platform_read", self.fetch_json(segments, query).await)
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Option<T>, CollaboratorError> {
        let url = endpoint(&self.base_url, segments)?;
        let mut request = self
            .http
            .get(url)
            .header("accept", "application/json")
            .query(query);
        if let Some(token) = &self.token {
            request = request.header(PLATFORM_TOKEN_HEADER, token);
        }
        let response = request.send().await.map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let body = response
            .json::<T>()
            .await
            .map_err(|err| CollaboratorError::InvalidResponse(err.to_string()))?;
        Ok(Some(body))
    }

    async fn member_role(&self, owner_id: &str, user_id: &str) -> Result<Option<Role>, CollaboratorError> {
        let member: Option<MemberResponse> = self
            .get_json(&["v1", "owners", owner_id, "members", user_id], &[])
            .await?;
        Ok(member.and_then(|member| Role::parse(&member.role)))
    }

    async fn put_field(&self, target_id: &str, field: &str, body: &Value) -> Result<(), CollaboratorError> {
        let url = endpoint(&self.base_url, &["v1", "targets", target_id, "fields", field])?;
        let mut request = self.http.put(url).json(body);
        if let Some(token) = &self.token {
            request = request.header(PLATFORM_TOKEN_HEADER, token);
        }
        let response = request.send().await.map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }
}

impl EligibleTargetProvider for PlatformClient {
    fn list_eligible_targets(
        &self,
        owner_id: &str,
        automation_id: &str,
    ) -> BoxFuture<'_, Result<Vec<TargetDescriptor>, CollaboratorError>> {
        let owner_id = owner_id.to_string();
        let automation_id = automation_id.to_string();
        Box::pin(async move {
            let response: Option<TargetsResponse> = self
                .get_json(
                    &["v1", "owners", &owner_id, "automations", &automation_id, "targets"],
                    &[("eligible", "true")],
                )
                .await?;
            Ok(response.map(|body| body.targets).unwrap_or_default())
        })
    }
}

impl AutomationSettingsProvider for PlatformClient {
    fn get_automation(
        &self,
        owner_id: &str,
        automation_id: &str,
    ) -> BoxFuture<'_, Result<Option<AutomationDefinition>, CollaboratorError>> {
        let owner_id = owner_id.to_string();
        let automation_id = automation_id.to_string();
        Box::pin(async move {
            self.get_json(&["v1", "owners", &owner_id, "automations", &automation_id], &[])
                .await
        })
    }

    fn list_automations(
        &self,
        owner_id: &str,
    ) -> BoxFuture<'_, Result<Vec<AutomationDefinition>, CollaboratorError>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let response: Option<AutomationsResponse> = self
                .get_json(&["v1", "owners", &owner_id, "automations"], &[])
                .await?;
            Ok(response.map(|body| body.automations).unwrap_or_default())
        })
    }

    fn plan_tier(&self, owner_id: &str) -> BoxFuture<'_, Result<PlanTier, CollaboratorError>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let response: Option<PlanResponse> =
                self.get_json(&["v1", "owners", &owner_id, "plan"], &[]).await?;
            let Some(plan) = response else {
                return Ok(PlanTier::Free);
            };
            PlanTier::parse(&plan.tier).ok_or_else(|| {
                CollaboratorError::InvalidResponse(format!("unknown plan tier '{}'", plan.tier))
            })
        })
    }
}

impl RoleResolver for PlatformClient {
    fn can_edit(
        &self,
        owner_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>> {
        let owner_id = owner_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move {
            Ok(self
                .member_role(&owner_id, &user_id)
                .await?
                .is_some_and(|role| role.can_edit()))
        })
    }

    fn can_apply(
        &self,
        owner_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>> {
        let owner_id = owner_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move {
            Ok(self
                .member_role(&owner_id, &user_id)
                .await?
                .is_some_and(|role| role.can_apply()))
        })
    }
}

impl IssueProvider for PlatformClient {
    fn list_detected_issues(
        &self,
        owner_id: &str,
    ) -> BoxFuture<'_, Result<Vec<DetectedIssue>, CollaboratorError>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let response: Option<IssuesResponse> = self
                .get_json(&["v1", "owners", &owner_id, "issues"], &[("status", "open")])
                .await?;
            Ok(response.map(|body| body.issues).unwrap_or_default())
        })
    }
}

impl ApprovalProvider for PlatformClient {
    fn list_pending_approvals(
        &self,
        owner_id: &str,
    ) -> BoxFuture<'_, Result<Vec<PendingApproval>, CollaboratorError>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let response: Option<ApprovalsResponse> = self
                .get_json(
                    &["v1", "owners", &owner_id, "approvals"],
                    &[("status", "pending")],
                )
                .await?;
            Ok(response.map(|body| body.approvals).unwrap_or_default())
        })
    }
}

impl CommerceConnector for PlatformClient {
    fn apply_change(
        &self,
        target_id: &str,
        field: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        let target_id = target_id.to_string();
        let field = field.to_string();
        let body = json!({ "value": value });
        Box::pin(async move {
            observe(
                "platform_write",
                self.put_field(&target_id, &field, &body).await,
            )
        })
    }
}

/// Opaque text generation service.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    http: reqwest::Client,
    base_url: Url,
}

impl GenerationClient {
    pub fn from_config(config: &AppConfig) -> Result<Self, CollaboratorError> {
        Self::new(
            &config.generation_base_url,
            Duration::from_millis(config.generation_timeout_ms.max(1)),
        )
    }

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http: build_http(timeout)?,
            base_url: parse_base_url(base_url)?,
        })
    }

    async fn request_suggestion(&self, body: &Value) -> Result<String, CollaboratorError> {
        let url = endpoint(&self.base_url, &["v1", "generate"])?;
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let body = response
            .json::<GenerateResponse>()
            .await
            .map_err(|err| CollaboratorError::InvalidResponse(err.to_string()))?;
        Ok(body.suggestion)
    }
}

impl GenerationCapability for GenerationClient {
    fn generate(
        &self,
        target: &TargetDescriptor,
        rules: &RuleConfig,
    ) -> BoxFuture<'_, Result<String, CollaboratorError>> {
        let body = json!({ "target": target, "rules": Value::Object(rules.clone()) });
        Box::pin(async move { observe("generation", self.request_suggestion(&body).await) })
    }
}

fn observe<T>(
    service: &'static str,
    result: Result<T, CollaboratorError>,
) -> Result<T, CollaboratorError> {
    let outcome = match &result {
        Ok(_) => "ok",
        Err(CollaboratorError::Timeout) => "timeout",
        Err(CollaboratorError::Unavailable(_)) => "unavailable",
        Err(CollaboratorError::Rejected(_)) => "rejected",
        Err(CollaboratorError::InvalidResponse(_)) => "invalid_response",
    };
    counter!(COLLABORATOR_CALLS_TOTAL, "service" => service, "outcome" => outcome).increment(1);
    result
}

fn build_http(timeout: Duration) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| CollaboratorError::Unavailable(err.to_string()))
}

fn parse_base_url(base_url: &str) -> Result<Url, CollaboratorError> {
    let url = Url::parse(base_url.trim())
        .map_err(|err| CollaboratorError::Unavailable(format!("invalid base url '{base_url}': {err}")))?;
    if url.cannot_be_a_base() {
        return Err(CollaboratorError::Unavailable(format!(
            "base url '{base_url}' cannot carry a path"
        )));
    }
    Ok(url)
}

/// Appends percent-encoded path segments to the base url.
fn endpoint(base_url: &Url, segments: &[&str]) -> Result<Url, CollaboratorError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| CollaboratorError::Unavailable("base url cannot carry a path".into()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn transport_error(err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::Timeout
    } else {
        CollaboratorError::Unavailable(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    let detail = format!("status {}: {}", status.as_u16(), message.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(CollaboratorError::Unavailable(detail))
    } else {
        Err(CollaboratorError::Rejected(detail))
    }
}
