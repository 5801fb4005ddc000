use axum::extract::{Path, State};
use axum::Json;

use alyx_store::executions::ExecutionStatus;

use crate::auth::OptionalAuth;
use crate::error::{ApiError, ErrorCode};
use crate::functions::InvokeError;
use crate::middleware::RequestMeta;
use crate::state::AppState;

/// `POST /api/functions/{name}`: invoke with the JSON body as input.
///
/// Success and uncaught function errors both answer 200 with
/// `{success, output?, error?, logs, duration_ms}`; a deadline kill is
/// `timed_out` (504), an unavailable pool `pool_exhausted` (503).
pub async fn invoke(
    State(state): State<AppState>,
    Path(name): Path<String>,
    OptionalAuth(auth): OptionalAuth,
    meta: RequestMeta,
    body: Result<Json<serde_json::Value>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = meta.request_id.clone();
    if !state.config.functions.enabled {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            "functions are disabled",
            &request_id,
        ));
    }

    let input = body.map(|Json(v)| v).unwrap_or(serde_json::Value::Null);
    let auth_json = auth.map(|claims| claims.to_auth_json());

    let outcome = state
        .executor
        .invoke(
            &name,
            input,
            auth_json,
            "http",
            None,
            Some(&request_id),
            None,
        )
        .await
        .map_err(|err| match err {
            InvokeError::UnknownFunction(_) => {
                ApiError::new(ErrorCode::NotFound, err.to_string(), &request_id)
            }
            InvokeError::PoolExhausted => {
                ApiError::new(ErrorCode::PoolExhausted, err.to_string(), &request_id)
            }
            InvokeError::Internal(message) => {
                ApiError::new(ErrorCode::Internal, message, &request_id)
            }
        })?;

    match outcome.status {
        ExecutionStatus::TimedOut => Err(ApiError::new(
            ErrorCode::TimedOut,
            format!("function '{name}' exceeded its deadline"),
            &request_id,
        )
        .with_details(serde_json::json!({
            "execution_id": outcome.execution_id,
            "duration_ms": outcome.duration_ms,
            "logs": outcome.logs,
        }))),
        status => {
            let mut body = serde_json::json!({
                "success": status == ExecutionStatus::Success,
                "logs": outcome.logs,
                "duration_ms": outcome.duration_ms,
            });
            if let Some(output) = outcome.output {
                body["output"] = output;
            }
            if let Some(message) = outcome.error {
                body["error"] = serde_json::json!({
                    "code": status.as_str(),
                    "message": message,
                });
            }
            Ok(Json(body))
        }
    }
}
