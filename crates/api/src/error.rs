use axum::{Json, http::StatusCode, response::IntoResponse};
use playbook_domain::error::DomainError;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("permission denied")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("{message}")]
    Conflict { code: &'static str, message: String },
    #[error("{message}")]
    QuotaExceeded { message: String, details: Value },
    #[error("upstream service failed: {0}")]
    Upstream(String),
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "permission_denied",
            ApiError::NotFound => "not_found",
            ApiError::Conflict { code, .. } => code,
            ApiError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ApiError::Upstream(_) => "collaborator_error",
            ApiError::Internal => "internal_error",
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            ApiError::QuotaExceeded { details, .. } => Some(details.clone()),
            _ => None,
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(message) | DomainError::InvalidInput(message) => {
                ApiError::Validation(message)
            }
            DomainError::NotFound => ApiError::NotFound,
            DomainError::PermissionDenied => ApiError::Forbidden,
            DomainError::Conflict
            | DomainError::DraftApplied
            | DomainError::DraftExpired
            | DomainError::DraftNotReady
            | DomainError::ScopeInvalid
            | DomainError::RulesChanged
            | DomainError::ApplyInProgress => ApiError::Conflict {
                code: err.code(),
                message: err.to_string(),
            },
            DomainError::QuotaExceeded {
                resource,
                requested,
                remaining,
            } => ApiError::QuotaExceeded {
                message: err.to_string(),
                details: json!({
                    "resource": resource,
                    "requested": requested,
                    "remaining": remaining,
                }),
            },
            DomainError::Collaborator(message) => {
                tracing::warn!(error = %message, "collaborator call failed");
                ApiError::Upstream(message)
            }
            DomainError::Storage(message) => {
                tracing::error!(error = %message, "storage failure");
                ApiError::Internal
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}
