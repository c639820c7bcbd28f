use axum::extract::{Extension, Path, Query, State};
use axum::{
    Json, Router,
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use playbook_domain::{
    apply::{ApplyRequest, ApplyRun},
    automations::ScopeType,
    drafts::{Draft, UpdatedItem},
    engine::{AutomationEstimate, TriggerEvent},
    identity::ActorIdentity,
    triggers::TriggerType,
    work_queue::{Bundle, BundleHealth, WorkQueueFilters},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::middleware::{AuthContext, CallContext};
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/v1/automations/:automation_id/triggers",
            post(trigger_automation),
        )
        .route(
            "/v1/automations/:automation_id/estimate",
            get(estimate_automation),
        )
        .route("/v1/automations/:automation_id/draft", get(get_draft))
        .route("/v1/drafts/:draft_id", get(get_draft_by_id))
        .route(
            "/v1/drafts/:draft_id/items/:item_index",
            patch(edit_draft_item),
        )
        .route("/v1/drafts/:draft_id/apply", post(apply_draft))
        .route("/v1/drafts/:draft_id/runs", get(list_apply_runs))
        .route("/v1/apply-runs/:run_id", get(get_apply_run))
        .route("/v1/work-queue", get(get_work_queue))
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .route_layer(middleware::from_fn(app_middleware::metrics_middleware))
        .layer(app_middleware::timeout_layer(&state.config))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(app_middleware::call_context_middleware))
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(app_middleware::set_request_id_layer());

    if !state.config.is_test() {
        app = app.layer(app_middleware::rate_limit_layer(&state.config));
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    storage: &'static str,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let storage = match &state.db {
        None => "memory",
        Some(db) => match db.health_check().await {
            Ok(()) => db.name(),
            Err(err) => {
                tracing::warn!(error = %err, adapter = db.name(), "storage health check failed");
                "unavailable"
            }
        },
    };
    let (code, status) = if storage == "unavailable" {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            environment: state.config.app_env.clone(),
            storage,
        }),
    )
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct TriggerRequest {
    #[validate(length(min = 1, max = 32))]
    trigger_type: String,
    #[validate(length(min = 1, max = 128))]
    target_id: String,
    #[validate(length(min = 1, max = 128))]
    content_hash: Option<String>,
    content: Option<Value>,
}

async fn trigger_automation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(call): Extension<CallContext>,
    Path(automation_id): Path<String>,
    Json(payload): Json<TriggerRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let automation_id = validation::path_id("automation_id", &automation_id)?;
    let (owner_id, _) = caller(&auth)?;
    let trigger_type: TriggerType = payload
        .trigger_type
        .parse()
        .map_err(|err: &str| ApiError::Validation(err.to_string()))?;

    let event = TriggerEvent {
        trigger_type,
        owner_id,
        automation_id: automation_id.to_string(),
        target_id: payload.target_id.trim().to_string(),
        content_hash: payload.content_hash,
        content: payload.content,
    };
    let response = state
        .engine
        .trigger_automation(event, call.to_request_context())
        .await?;
    observability::register_trigger_decision(&response);
    let status = if response.allowed {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)).into_response())
}

async fn estimate_automation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(automation_id): Path<String>,
) -> Result<Json<AutomationEstimate>, ApiError> {
    let automation_id = validation::path_id("automation_id", &automation_id)?;
    let (owner_id, _) = caller(&auth)?;
    let estimate = state.engine.estimate(&owner_id, automation_id).await?;
    Ok(Json(estimate))
}

#[derive(Debug, Deserialize, Validate)]
struct DraftQuery {
    #[validate(length(min = 1, max = 128))]
    scope_id: String,
    #[validate(length(min = 1, max = 128))]
    rules_hash: String,
}

async fn get_draft(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(automation_id): Path<String>,
    Query(query): Query<DraftQuery>,
) -> Result<Json<Draft>, ApiError> {
    validation::validate(&query)?;
    let automation_id = validation::path_id("automation_id", &automation_id)?;
    let (owner_id, _) = caller(&auth)?;
    let draft = state
        .engine
        .get_draft(&owner_id, automation_id, &query.scope_id, &query.rules_hash)
        .await?;
    Ok(Json(draft))
}

async fn get_draft_by_id(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(draft_id): Path<String>,
) -> Result<Json<Draft>, ApiError> {
    let draft_id = validation::path_id("draft_id", &draft_id)?;
    let (owner_id, _) = caller(&auth)?;
    let draft = state.engine.get_draft_by_id(&owner_id, draft_id).await?;
    Ok(Json(draft))
}

#[derive(Debug, Deserialize, Validate)]
struct EditItemRequest {
    #[validate(length(min = 1, max = 5000))]
    value: String,
}

async fn edit_draft_item(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((draft_id, item_index)): Path<(String, usize)>,
    Json(payload): Json<EditItemRequest>,
) -> Result<Json<UpdatedItem>, ApiError> {
    validation::validate(&payload)?;
    let draft_id = validation::path_id("draft_id", &draft_id)?;
    let (owner_id, actor) = caller(&auth)?;
    let updated = state
        .engine
        .edit_draft_item(&actor, &owner_id, draft_id, item_index, payload.value)
        .await?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize, Validate)]
struct ApplyDraftRequest {
    #[validate(length(min = 1, max = 128))]
    scope_id: String,
    #[validate(length(min = 1, max = 128))]
    rules_hash: String,
}

async fn apply_draft(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(draft_id): Path<String>,
    Json(payload): Json<ApplyDraftRequest>,
) -> Result<Json<ApplyRun>, ApiError> {
    validation::validate(&payload)?;
    let draft_id = validation::path_id("draft_id", &draft_id)?;
    let (owner_id, actor) = caller(&auth)?;
    let request = ApplyRequest {
        owner_id,
        draft_id: draft_id.to_string(),
        scope_id: payload.scope_id,
        rules_hash: payload.rules_hash,
    };
    let run = state.engine.apply_draft(&actor, &request).await?;
    observability::register_apply_run(&run);
    Ok(Json(run))
}

async fn list_apply_runs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(draft_id): Path<String>,
) -> Result<Json<Vec<ApplyRun>>, ApiError> {
    let draft_id = validation::path_id("draft_id", &draft_id)?;
    let (owner_id, _) = caller(&auth)?;
    let runs = state.engine.list_apply_runs(&owner_id, draft_id).await?;
    Ok(Json(runs))
}

async fn get_apply_run(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(run_id): Path<String>,
) -> Result<Json<ApplyRun>, ApiError> {
    let run_id = validation::path_id("run_id", &run_id)?;
    let (owner_id, _) = caller(&auth)?;
    let run = state.engine.get_apply_run(&owner_id, run_id).await?;
    Ok(Json(run))
}

#[derive(Debug, Default, Deserialize)]
struct WorkQueueQuery {
    scope_type: Option<String>,
    action_key: Option<String>,
    health: Option<String>,
}

impl WorkQueueQuery {
    fn into_filters(self) -> Result<WorkQueueFilters, ApiError> {
        let scope_type = self
            .scope_type
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.trim().parse::<ScopeType>())
            .transpose()
            .map_err(|err| ApiError::Validation(err.to_string()))?;
        let health = self
            .health
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.trim().parse::<BundleHealth>())
            .transpose()
            .map_err(|err| ApiError::Validation(err.to_string()))?;
        let action_key = self
            .action_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(WorkQueueFilters {
            scope_type,
            action_key,
            health,
        })
    }
}

async fn get_work_queue(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<WorkQueueQuery>,
) -> Result<Json<Vec<Bundle>>, ApiError> {
    let filters = query.into_filters()?;
    let (owner_id, actor) = caller(&auth)?;
    let bundles = state
        .engine
        .get_work_queue(&owner_id, &actor, &filters)
        .await?;
    Ok(Json(bundles))
}

fn caller(auth: &AuthContext) -> Result<(String, ActorIdentity), ApiError> {
    let user_id = auth
        .user_id
        .as_deref()
        .filter(|user_id| !user_id.trim().is_empty())
        .ok_or(ApiError::Unauthorized)?;
    let owner_id = auth
        .owner_id
        .as_deref()
        .filter(|owner_id| !owner_id.trim().is_empty())
        .ok_or(ApiError::Unauthorized)?;
    Ok((owner_id.to_string(), ActorIdentity::with_user_id(user_id)))
}
