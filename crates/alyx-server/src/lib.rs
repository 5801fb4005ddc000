//! The Alyx HTTP/WebSocket service layer.
//!
//! Routes are generated from the schema registry at request time (the
//! collection name is a path parameter resolved against the current
//! snapshot), so a deployment changes the live surface without a
//! restart.

pub mod auth;
pub mod config;
pub mod error;
pub mod functions;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod realtime;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AlyxConfig;
use crate::error::ServerError;
use crate::state::AppState;

/// Builds the full application router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/collections/{collection}",
            get(routes::collections::list).post(routes::collections::create),
        )
        .route(
            "/api/collections/{collection}/{id}",
            get(routes::collections::get_one)
                .patch(routes::collections::update)
                .delete(routes::collections::delete),
        )
        .route("/api/auth/register", post(auth::routes::register))
        .route("/api/auth/login", post(auth::routes::login))
        .route("/api/auth/refresh", post(auth::routes::refresh))
        .route("/api/auth/logout", post(auth::routes::logout))
        .route("/api/auth/me", get(auth::routes::me))
        .route("/api/auth/providers", get(auth::routes::providers))
        .route("/api/auth/oauth/{provider}", get(auth::routes::oauth_start))
        .route(
            "/api/auth/oauth/{provider}/callback",
            get(auth::routes::oauth_callback),
        )
        .route("/api/functions/{name}", post(routes::functions::invoke))
        .route("/api/realtime", get(realtime::ws::upgrade))
        .route("/health", get(health::health))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/health/stats", get(health::stats))
        .route("/metrics", get(health::metrics));

    let mut router = api
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authenticate,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::context,
        ))
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(
            state.config.server.request_timeout,
        )))
        .layer(TraceLayer::new_for_http());

    if state.config.server.cors.enabled {
        router = router.layer(cors_layer(&state.config));
    }

    router.with_state(state)
}

fn cors_layer(config: &AlyxConfig) -> CorsLayer {
    let cors = &config.server.cors;
    let mut layer = CorsLayer::new()
        .allow_methods(
            cors.methods
                .iter()
                .filter_map(|m| m.parse::<axum::http::Method>().ok())
                .collect::<Vec<_>>(),
        )
        .allow_headers(
            cors.headers
                .iter()
                .filter_map(|h| h.parse::<axum::http::HeaderName>().ok())
                .collect::<Vec<_>>(),
        )
        .max_age(std::time::Duration::from_secs(cors.max_age));

    if cors.origins.iter().any(|o| o == "*") {
        layer = layer.allow_origin(AllowOrigin::any());
    } else {
        layer = layer.allow_origin(AllowOrigin::list(
            cors.origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect::<Vec<_>>(),
        ));
    }
    if cors.credentials && !cors.origins.iter().any(|o| o == "*") {
        layer = layer.allow_credentials(true);
    }
    layer
}

/// Binds the socket (last, per the startup order) and serves until
/// SIGINT/SIGTERM, then drains per the shutdown order.
pub async fn serve(state: AppState) -> Result<(), ServerError> {
    let addr = state.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Startup(format!("bind {addr}: {e}")))?;
    info!(addr = %addr, "listening");

    let maintenance = state.spawn_maintenance();
    let shutdown_state = state.clone();
    let router = build_router(state);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| ServerError::Startup(e.to_string()))?;

    maintenance.abort();
    shutdown_state.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_state(dir: &std::path::Path, schema: Option<&str>) -> AppState {
        let mut config = AlyxConfig::default();
        config.database.path = dir.join("test.db");
        config.functions.dir = dir.join("functions");
        config.functions.enabled = false;
        config.auth.jwt.secret = "test-secret".to_string();

        let schema_path = schema.map(|text| {
            let path = dir.join("schema.yaml");
            std::fs::write(&path, text).unwrap();
            path
        });
        AppState::build(config, schema_path.as_deref(), &dir.join("migrations"))
            .await
            .unwrap()
    }

    const TASKS_SCHEMA: &str = r#"
version: 1
collections:
  - name: tasks
    fields:
      - name: title
        type: string
        validate:
          minLength: 1
          maxLength: 200
      - name: completed
        type: bool
        default:
          literal: false
      - name: created_at
        type: timestamp
        default: now
"#;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Some(TASKS_SCHEMA)).await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/collections/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"title":"Learn"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["title"], "Learn");
        assert_eq!(created["completed"], false);
        assert!(created["id"].is_string());
        assert!(created["created_at"].is_string());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/collections/tasks?sort=-created_at&limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        assert_eq!(listed["total"], 1);
        assert_eq!(listed["docs"][0]["title"], "Learn");

        let id = created["id"].as_str().unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/collections/tasks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn validation_failure_is_400_with_details_and_no_row() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Some(TASKS_SCHEMA)).await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/collections/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"title":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await;
        assert_eq!(error["code"], "validation_failed");
        assert_eq!(error["details"]["title"], "minLength:1");
        assert!(error["request_id"].is_string());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/collections/tasks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed["total"], 0);
    }

    #[tokio::test]
    async fn missing_document_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Some(TASKS_SCHEMA)).await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/api/collections/tasks/{}",
                        uuid::Uuid::new_v4()
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_returns_204() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Some(TASKS_SCHEMA)).await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/collections/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"title":"bye"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let created = body_json(response).await;
        let id = created["id"].as_str().unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/collections/tasks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn register_login_me_flow() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None).await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/register")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"email":"a@b.com","password":"hunter22hunter"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let registered = body_json(response).await;
        assert_eq!(registered["user"]["email"], "a@b.com");
        assert_eq!(registered["tokens"]["token_type"], "Bearer");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"email":"a@b.com","password":"hunter22hunter"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let logged_in = body_json(response).await;
        let access = logged_in["tokens"]["access_token"].as_str().unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/auth/me")
                    .header("authorization", format!("Bearer {access}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let me = body_json(response).await;
        assert_eq!(me["user"]["email"], "a@b.com");

        // Wrong password is rejected without detail.
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"email":"a@b.com","password":"wrong!"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_bearer_token_is_401_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Some(TASKS_SCHEMA)).await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/collections/tasks")
                    .header("authorization", "Bearer garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn policy_scenario_published_or_author() {
        let dir = tempfile::tempdir().unwrap();
        let schema = r#"
version: 1
collections:
  - name: posts
    fields:
      - name: title
        type: string
      - name: published
        type: bool
        default:
          literal: false
      - name: author_id
        type: string
        nullable: true
    rules:
      read: 'doc.published == true || auth.id == doc.author_id'
"#;
        let state = test_state(dir.path(), Some(schema)).await;
        let jwt = std::sync::Arc::clone(&state.jwt);
        let app = build_router(state);

        // Seed one published and one unpublished post owned by u1.
        for (title, published) in [("public", true), ("draft", false)] {
            let body = serde_json::json!({
                "title": title,
                "published": published,
                "author_id": "u1",
            });
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/collections/posts")
                        .header("content-type", "application/json")
                        .body(Body::from(body.to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        // Anonymous sees only the published post.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/collections/posts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed["total"], 1);

        // u1 sees both; u2 sees one.
        for (user, expected) in [("u1", 2), ("u2", 1)] {
            let (token, _) = jwt
                .sign_access(user, "x@y.com", true, "user", serde_json::json!({}))
                .unwrap();
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri("/api/collections/posts")
                        .header("authorization", format!("Bearer {token}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let listed = body_json(response).await;
            assert_eq!(listed["total"], expected, "user {user}");
        }
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None).await;
        let app = build_router(state);

        for uri in ["/health", "/health/live", "/health/ready", "/health/stats"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("alyx_http_requests_total"));
    }

    #[tokio::test]
    async fn unknown_function_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AlyxConfig::default();
        config.database.path = dir.path().join("test.db");
        config.functions.dir = dir.path().join("functions");
        config.auth.jwt.secret = "s".into();
        let state = AppState::build(config, None, &dir.path().join("migrations"))
            .await
            .unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/functions/nope")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
