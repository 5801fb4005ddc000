use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::metrics::GaugeSample;
use crate::state::AppState;

/// `GET /health`: overall summary.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "schema_hash": state.registry.load().hash,
    }))
}

/// `GET /health/live`: process liveness only.
pub async fn live() -> StatusCode {
    StatusCode::OK
}

/// `GET /health/ready`: readiness includes a database round trip.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let pool = std::sync::Arc::clone(&state.pool);
    let ping = tokio::task::spawn_blocking(move || {
        pool.read()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
    })
    .await;

    match ping {
        Ok(Ok(1)) => (StatusCode::OK, Json(serde_json::json!({"ready": true}))),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"ready": false})),
        ),
    }
}

/// `GET /health/stats`: live gauges for operators.
pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (connections, subscriptions, delivered, stale) = state.router.stats();
    let (pool_ready, pool_total) = state.executor.pool_stats().await;
    Json(serde_json::json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "change_seq": state.gateway.sequencer().current(),
        "realtime": {
            "connections": connections,
            "subscriptions": subscriptions,
            "deltas_delivered": delivered,
            "stale_subscriptions": stale,
        },
        "functions": {
            "pool_ready": pool_ready,
            "pool_total": pool_total,
        },
    }))
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let (connections, subscriptions, delivered, stale) = state.router.stats();
    let (pool_ready, pool_total) = state.executor.pool_stats().await;
    let text = state.metrics.render(GaugeSample {
        event_seq: state.gateway.sequencer().current(),
        active_connections: connections,
        active_subscriptions: subscriptions,
        deltas_delivered: delivered,
        stale_subscriptions: stale,
        pool_ready,
        pool_busy: pool_total.saturating_sub(pool_ready),
    });
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
}
