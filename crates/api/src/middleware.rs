use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::middleware::NoOpMiddleware;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use playbook_domain::engine::RequestContext;
use playbook_infra::config::AppConfig;
use serde::Deserialize;
use tower_governor::GovernorLayer;
use tower_governor::governor::{GovernorConfig, GovernorConfigBuilder};
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{Span, info_span};
use uuid::Uuid;

use crate::error::ApiError;
use crate::observability;
use crate::state::AppState;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
const SESSION_COOKIE: &str = "playbook_session";
const MAX_CORRELATION_ID_LEN: usize = 128;

/// Ids that follow a request into queued work.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub request_id: Option<String>,
    pub correlation_id: String,
}

impl CallContext {
    pub fn to_request_context(&self) -> RequestContext {
        RequestContext {
            request_id: self.request_id.clone(),
            correlation_id: Some(self.correlation_id.clone()),
        }
    }
}

/// Caller decoded from the bearer token. The token names the user and the
/// store they act for; what they may do is decided by the role resolver.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub owner_id: Option<String>,
}

impl AuthContext {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some() && self.owner_id.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    owner_id: String,
}

impl Claims {
    fn into_auth_context(self) -> Option<AuthContext> {
        let user_id = self.sub.trim();
        let owner_id = self.owner_id.trim();
        if user_id.is_empty() || owner_id.is_empty() {
            return None;
        }
        Some(AuthContext {
            user_id: Some(user_id.to_string()),
            owner_id: Some(owner_id.to_string()),
        })
    }
}

#[derive(Clone)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::now_v7().to_string())
            .ok()
            .map(RequestId::new)
    }
}

pub fn set_request_id_layer() -> SetRequestIdLayer<UuidRequestId> {
    SetRequestIdLayer::x_request_id(UuidRequestId)
}

pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RequestSpan> {
    TraceLayer::new_for_http().make_span_with(RequestSpan)
}

#[derive(Clone, Default)]
pub(crate) struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, req: &Request<B>) -> Span {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        info_span!(
            "http_request",
            method = %req.method(),
            uri = %req.uri(),
            request_id = %header(REQUEST_ID_HEADER),
            correlation_id = %header(CORRELATION_ID_HEADER)
        )
    }
}

pub fn timeout_layer(config: &AppConfig) -> TimeoutLayer {
    TimeoutLayer::new(Duration::from_millis(config.api_request_timeout_ms.max(1)))
}

pub type RateLimitLayer = GovernorLayer<PeerIpKeyExtractor, NoOpMiddleware>;

pub fn rate_limit_layer(config: &AppConfig) -> RateLimitLayer {
    let governor = GovernorConfigBuilder::default()
        .per_second(config.api_rate_limit_per_second.max(1))
        .burst_size(config.api_rate_limit_burst.max(1))
        .finish()
        .unwrap_or_else(|| {
            tracing::error!("invalid rate limit settings; using governor defaults");
            GovernorConfig::default()
        });
    GovernorLayer {
        config: Arc::new(governor),
    }
}

/// Resolves the correlation id (caller supplied or fresh), echoes it on the
/// response and exposes both ids to handlers.
pub async fn call_context_middleware(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(CORRELATION_ID_HEADER);
    let correlation_id = match req.headers().get(&header_name) {
        None => Uuid::now_v7().to_string(),
        Some(value) => match value.to_str() {
            Ok(value) if !value.trim().is_empty() && value.len() <= MAX_CORRELATION_ID_LEN => {
                value.trim().to_string()
            }
            _ => return ApiError::Validation("invalid correlation id".into()).into_response(),
        },
    };
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let echoed = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = &echoed {
        req.headers_mut().insert(header_name.clone(), value.clone());
    }
    req.extensions_mut().insert(CallContext {
        request_id,
        correlation_id,
    });

    let mut response = next.run(req).await;
    if let Some(value) = echoed {
        response.headers_mut().insert(header_name, value);
    }
    response
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let context = match auth_token(req.headers()) {
        None => AuthContext::default(),
        Some(token) => decode_token(token, &state.config.jwt_secret).unwrap_or_default(),
    };
    req.extensions_mut().insert(context);
    next.run(req).await
}

fn decode_token(token: &str, secret: &str) -> Option<AuthContext> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.set_required_spec_claims(&["exp", "sub"]);

    match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
        Ok(data) => {
            let context = data.claims.into_auth_context();
            if context.is_none() {
                tracing::warn!("auth token has an empty subject or owner");
            }
            context
        }
        Err(err) => {
            tracing::warn!(error = %err, "invalid auth token");
            None
        }
    }
}

pub async fn require_auth_middleware(req: Request<Body>, next: Next) -> Response {
    let authenticated = req
        .extensions()
        .get::<AuthContext>()
        .is_some_and(AuthContext::is_authenticated);
    if !authenticated {
        return ApiError::Unauthorized.into_response();
    }
    next.run(req).await
}

pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let route = match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_string(),
        None => "unmatched".to_string(),
    };
    let response = next.run(req).await;
    observability::register_http_request(&method, &route, response.status(), started.elapsed());
    response
}

fn auth_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        });
    bearer.or_else(|| {
        let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
        cookies.split(';').find_map(|part| {
            let (name, token) = part.trim().split_once('=')?;
            (name.trim() == SESSION_COOKIE).then(|| token.trim())
        })
    })
}
