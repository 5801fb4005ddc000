use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

/// Request identity, generated per request and echoed in every error
/// body and the `x-request-id` response header.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// The caller's network address as the policy engine sees it
/// (`request.ip`).
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// Outermost middleware: stamps a request id, resolves the client ip,
/// counts the request, and tags error responses in the metrics.
pub async fn context(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let ip = client_ip(&request);
    request.extensions_mut().insert(ClientIp(ip));

    state
        .metrics
        .http_requests
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let mut response = next.run(request).await;
    if response.status().is_client_error() || response.status().is_server_error() {
        state
            .metrics
            .http_errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    if let Ok(value) = header::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Bearer-token middleware. No header means anonymous; a present but
/// invalid token is rejected before any handler runs.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(value) = header_value {
        let Some(token) = value.strip_prefix("Bearer ") else {
            return unauthorized(&request, "authorization header is not a bearer token");
        };
        match state.jwt.verify(token) {
            Some(claims) => {
                request.extensions_mut().insert(claims);
            }
            None => return unauthorized(&request, "invalid or expired token"),
        }
    }

    next.run(request).await
}

fn unauthorized(request: &Request, message: &str) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    ApiError::new(ErrorCode::Unauthenticated, message, &request_id).into_response()
}

fn client_ip(request: &Request) -> String {
    // Behind a proxy the forwarded header wins; otherwise the socket
    // address recorded by the connect-info layer.
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Extractor bundling what every handler wants from the context
/// middleware: the stamped request id and the resolved client ip.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub ip: String,
}

impl<S> axum::extract::FromRequestParts<S> for RequestMeta
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(RequestMeta {
            request_id: parts
                .extensions
                .get::<RequestId>()
                .map(|r| r.0.clone())
                .unwrap_or_default(),
            ip: parts
                .extensions
                .get::<ClientIp>()
                .map(|r| r.0.clone())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}
