use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use alyx_store::StoreError;

/// Fatal startup/configuration errors. Request-path errors are
/// [`ApiError`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("startup error: {0}")]
    Startup(String),
}

/// The wire error taxonomy. Every response body is
/// `{code, message, details?, request_id, timestamp}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub request_id: String,
}

/// Exhaustive error codes, each with its canonical HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    ValidationFailed,
    BadRequest,
    Unauthenticated,
    AccessDenied,
    NotFound,
    Conflict,
    RateLimited,
    SchemaDrift,
    InvalidRuleExpression,
    ForeignKeyRestrict,
    PoolExhausted,
    TimedOut,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::BadRequest => "bad_request",
            Self::Unauthenticated => "unauthenticated",
            Self::AccessDenied => "access_denied",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::RateLimited => "rate_limited",
            Self::SchemaDrift => "schema_drift",
            Self::InvalidRuleExpression => "invalid_rule_expression",
            Self::ForeignKeyRestrict => "foreign_key_restrict",
            Self::PoolExhausted => "pool_exhausted",
            Self::TimedOut => "timed_out",
            Self::Internal => "internal",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed | Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict | Self::SchemaDrift | Self::ForeignKeyRestrict => {
                StatusCode::CONFLICT
            }
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidRuleExpression | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Self::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            request_id: request_id.to_string(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Classifies a store error. Validation and policy errors pass
    /// through unchanged; unclassified errors collapse to `internal`
    /// and the original is logged by the caller.
    pub fn from_store(err: StoreError, request_id: &str) -> Self {
        let code = match &err {
            StoreError::NotFound { .. }
            | StoreError::UnknownCollection { .. }
            | StoreError::UnknownDeployment { .. } => ErrorCode::NotFound,
            StoreError::ValidationFailed { fields } => {
                let details: BTreeMap<&str, &str> = fields
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                return Self::new(ErrorCode::ValidationFailed, err.to_string(), request_id)
                    .with_details(serde_json::json!(details));
            }
            StoreError::UniqueViolation { .. } | StoreError::UnsafeChanges { .. } => {
                ErrorCode::Conflict
            }
            StoreError::ForeignKeyRestrict { .. } => ErrorCode::ForeignKeyRestrict,
            StoreError::AccessDenied { .. } => ErrorCode::AccessDenied,
            StoreError::Unauthenticated => ErrorCode::Unauthenticated,
            StoreError::SchemaDrift { .. } => ErrorCode::SchemaDrift,
            StoreError::RuleCompile { .. } => ErrorCode::InvalidRuleExpression,
            StoreError::Schema(_) => ErrorCode::BadRequest,
            StoreError::ChecksumMismatch { .. } | StoreError::Internal { .. } => {
                ErrorCode::Internal
            }
            _ => ErrorCode::Internal,
        };
        Self::new(code, err.to_string(), request_id)
    }

    /// The response body (also used by the WebSocket error envelope).
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
            "request_id": self.request_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(details) = &self.details {
            body["details"] = details.clone();
        }
        body
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.code == ErrorCode::Internal {
            tracing::error!(request_id = %self.request_id, message = %self.message, "internal error");
        }
        (self.code.status(), axum::Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn codes_and_statuses() {
        assert_eq!(ErrorCode::ValidationFailed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::AccessDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::SchemaDrift.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::PoolExhausted.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::TimedOut.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorCode::ForeignKeyRestrict.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn response_body_shape() {
        let err = ApiError::new(ErrorCode::NotFound, "'x' not found in 'tasks'", "req-1");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["request_id"], "req-1");
        assert!(json["timestamp"].is_string());
        assert!(json.get("details").is_none());
    }

    #[test]
    fn store_validation_carries_field_map() {
        let err = StoreError::ValidationFailed {
            fields: BTreeMap::from([("title".to_string(), "minLength:1".to_string())]),
        };
        let api = ApiError::from_store(err, "req-2");
        assert_eq!(api.code, ErrorCode::ValidationFailed);
        assert_eq!(api.details.unwrap()["title"], "minLength:1");
    }

    #[test]
    fn store_unique_violation_is_conflict() {
        let err = StoreError::UniqueViolation {
            collection: "users".into(),
            detail: "email".into(),
        };
        assert_eq!(ApiError::from_store(err, "r").code, ErrorCode::Conflict);
    }
}
