use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use chrono::Duration;
use serde::Deserialize;

use alyx_store::users::UserRecord;

use crate::auth::{jwt, password, OptionalAuth};
use crate::error::{ApiError, ErrorCode};
use crate::middleware::RequestMeta;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutBody {
    pub refresh_token: String,
}

/// `POST /api/auth/register`.
pub async fn register(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(body): Json<RegisterBody>,
) -> Result<Response, ApiError> {
    let request_id = meta.request_id.clone();
    check_rate(&state, "register", &meta, &request_id)?;

    if !body.email.contains('@') {
        return Err(ApiError::new(
            ErrorCode::ValidationFailed,
            "validation failed",
            &request_id,
        )
        .with_details(serde_json::json!({"email": "format:email"})));
    }
    if let Err(requirement) = password::check_policy(&body.password, &state.config.auth.password) {
        return Err(ApiError::new(
            ErrorCode::ValidationFailed,
            "validation failed",
            &request_id,
        )
        .with_details(serde_json::json!({ "password": requirement })));
    }

    // The sync signup hook may veto before any row exists.
    if let Err(reason) = state.signup_gate.allow_signup(&body.email) {
        return Err(ApiError::new(ErrorCode::AccessDenied, reason, &request_id));
    }

    let hash = password::hash(&body.password)
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string(), &request_id))?;

    let user = {
        let users = state.users.clone();
        let email = body.email.clone();
        tokio::task::spawn_blocking(move || users.create(&email, &hash, "user"))
            .await
            .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string(), &request_id))?
            .map_err(|e| ApiError::from_store(e, &request_id))?
    };

    let tokens = issue_tokens(&state, &user, &request_id)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"user": public_user(&user), "tokens": tokens})),
    )
        .into_response())
}

/// `POST /api/auth/login`.
pub async fn login(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(body): Json<LoginBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = meta.request_id.clone();
    check_rate(&state, "login", &meta, &request_id)?;

    let user = {
        let users = state.users.clone();
        let email = body.email.clone();
        tokio::task::spawn_blocking(move || users.find_by_email(&email))
            .await
            .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string(), &request_id))?
            .map_err(|e| ApiError::from_store(e, &request_id))?
    };

    // Same failure for unknown email and bad password.
    let denied = || {
        ApiError::new(
            ErrorCode::Unauthenticated,
            "invalid email or password",
            &request_id,
        )
    };
    let user = user.ok_or_else(denied)?;
    if !password::verify(&body.password, &user.password_hash) {
        return Err(denied());
    }

    let tokens = issue_tokens(&state, &user, &request_id)?;
    Ok(Json(serde_json::json!({
        "user": public_user(&user),
        "tokens": tokens,
    })))
}

/// `POST /api/auth/refresh`: rotates the refresh token.
pub async fn refresh(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(body): Json<RefreshBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = meta.request_id.clone();
    check_rate(&state, "refresh", &meta, &request_id)?;

    let session = state
        .sessions
        .find_live(&body.refresh_token)
        .map_err(|e| ApiError::from_store(e, &request_id))?
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::Unauthenticated,
                "invalid or expired refresh token",
                &request_id,
            )
        })?;

    let user = state
        .users
        .find_by_id(&session.user_id)
        .map_err(|e| ApiError::from_store(e, &request_id))?
        .ok_or_else(|| {
            ApiError::new(ErrorCode::Unauthenticated, "account no longer exists", &request_id)
        })?;

    let new_refresh = jwt::new_refresh_token();
    state
        .sessions
        .rotate(
            &session.id,
            &new_refresh,
            Duration::seconds(state.config.auth.jwt.refresh_ttl as i64),
        )
        .map_err(|e| ApiError::from_store(e, &request_id))?;

    let (access_token, expires_at) = state
        .jwt
        .sign_access(
            &user.id,
            &user.email,
            user.verified,
            &user.role,
            user.metadata.clone(),
        )
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string(), &request_id))?;

    Ok(Json(serde_json::json!({
        "user": public_user(&user),
        "tokens": {
            "access_token": access_token,
            "refresh_token": new_refresh,
            "expires_at": expires_at,
            "token_type": "Bearer",
        },
    })))
}

/// `POST /api/auth/logout`: deletes the session.
pub async fn logout(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(body): Json<LogoutBody>,
) -> Result<StatusCode, ApiError> {
    let request_id = meta.request_id.clone();
    if let Some(session) = state
        .sessions
        .find_live(&body.refresh_token)
        .map_err(|e| ApiError::from_store(e, &request_id))?
    {
        state
            .sessions
            .delete(&session.id)
            .map_err(|e| ApiError::from_store(e, &request_id))?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/auth/me`.
pub async fn me(
    State(state): State<AppState>,
    OptionalAuth(auth): OptionalAuth,
    meta: RequestMeta,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = meta.request_id.clone();
    let claims = auth.ok_or_else(|| {
        ApiError::new(ErrorCode::Unauthenticated, "authentication required", &request_id)
    })?;

    let user = state
        .users
        .find_by_id(&claims.sub)
        .map_err(|e| ApiError::from_store(e, &request_id))?
        .ok_or_else(|| {
            ApiError::new(ErrorCode::NotFound, "account no longer exists", &request_id)
        })?;
    Ok(Json(serde_json::json!({"user": public_user(&user)})))
}

/// `GET /api/auth/providers`: configured OAuth provider names.
pub async fn providers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let names: Vec<&String> = state.config.auth.oauth.keys().collect();
    Json(serde_json::json!({ "providers": names }))
}

/// `GET /api/auth/oauth/{provider}`: redirect into the provider's
/// authorize page. The token exchange itself lives in the external
/// OAuth collaborator; this route only hands the browser off.
pub async fn oauth_start(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    meta: RequestMeta,
) -> Result<Redirect, ApiError> {
    let request_id = meta.request_id.clone();
    let config = state.config.auth.oauth.get(&provider).ok_or_else(|| {
        ApiError::new(
            ErrorCode::NotFound,
            format!("provider '{provider}' is not configured"),
            &request_id,
        )
    })?;

    let authorize_url = match provider.as_str() {
        "github" => format!(
            "https://github.com/login/oauth/authorize?client_id={}&scope=user:email",
            config.client_id
        ),
        "google" => format!(
            "https://accounts.google.com/o/oauth2/v2/auth?client_id={}&response_type=code&scope=openid%20email",
            config.client_id
        ),
        _ => {
            return Err(ApiError::new(
                ErrorCode::BadRequest,
                format!("provider '{provider}' has no authorize template"),
                &request_id,
            ))
        }
    };
    Ok(Redirect::temporary(&authorize_url))
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
}

/// `GET /api/auth/oauth/{provider}/callback`: the code-for-token
/// exchange is delegated to the external OAuth collaborator; the core
/// only owns the account-link tables it writes through `UserStore`.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<OAuthCallbackQuery>,
    meta: RequestMeta,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = meta.request_id.clone();
    if !state.config.auth.oauth.contains_key(&provider) {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("provider '{provider}' is not configured"),
            &request_id,
        ));
    }
    if query.code.is_none() {
        return Err(ApiError::new(
            ErrorCode::BadRequest,
            "missing authorization code",
            &request_id,
        ));
    }
    Err(ApiError::new(
        ErrorCode::BadRequest,
        "code exchange is handled by the configured OAuth collaborator",
        &request_id,
    ))
}

fn check_rate(
    state: &AppState,
    endpoint: &str,
    meta: &RequestMeta,
    request_id: &str,
) -> Result<(), ApiError> {
    if !state.limiter.allow(endpoint, &meta.ip) {
        return Err(ApiError::new(
            ErrorCode::RateLimited,
            format!("too many {endpoint} attempts"),
            request_id,
        ));
    }
    Ok(())
}

fn issue_tokens(
    state: &AppState,
    user: &UserRecord,
    request_id: &str,
) -> Result<serde_json::Value, ApiError> {
    let (access_token, expires_at) = state
        .jwt
        .sign_access(
            &user.id,
            &user.email,
            user.verified,
            &user.role,
            user.metadata.clone(),
        )
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string(), request_id))?;

    let refresh_token = jwt::new_refresh_token();
    state
        .sessions
        .create(
            &user.id,
            &refresh_token,
            Duration::seconds(state.config.auth.jwt.refresh_ttl as i64),
        )
        .map_err(|e| ApiError::from_store(e, request_id))?;

    Ok(serde_json::json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_at": expires_at,
        "token_type": "Bearer",
    }))
}

fn public_user(user: &UserRecord) -> serde_json::Value {
    serde_json::json!({
        "id": user.id,
        "email": user.email,
        "verified": user.verified,
        "role": user.role,
        "metadata": user.metadata,
        "created_at": user.created_at.to_rfc3339(),
    })
}
