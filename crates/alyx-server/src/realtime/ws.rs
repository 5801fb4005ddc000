use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use alyx_core::query::ListQuery;
use alyx_core::value::document_to_json;
use alyx_store::RequestContext;

use crate::auth::OptionalAuth;
use crate::middleware::RequestMeta;
use crate::realtime::protocol::{Envelope, SubscribePayload, UnsubscribePayload};
use crate::realtime::router::parse_filter_json;
use crate::state::AppState;

/// `GET /api/realtime`: upgrades to the realtime protocol.
pub async fn upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    OptionalAuth(auth): OptionalAuth,
    meta: RequestMeta,
) -> Response {
    let ip = meta.ip;
    let auth_json = auth.map(|claims| claims.to_auth_json());
    ws.on_upgrade(move |socket| handle_socket(state, socket, auth_json, ip))
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    auth: Option<serde_json::Value>,
    ip: String,
) {
    let client_id = uuid::Uuid::new_v4().to_string();
    if state.router.register_client(&client_id).is_err() {
        // Connection cap; close immediately with an error envelope.
        let mut socket = socket;
        let _ = send(&mut socket, &Envelope::new(
            "error",
            serde_json::json!({"code": "rate_limited", "message": "connection limit reached"}),
        ))
        .await;
        return;
    }
    state
        .metrics
        .ws_connections_total
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let (mut sink, mut stream) = socket.split();

    // Everything outbound funnels through one channel so subscription
    // forwarders and request replies interleave safely.
    let (client_tx, mut client_rx) = mpsc::channel::<Envelope>(1024);
    let writer = tokio::spawn(async move {
        while let Some(envelope) = client_rx.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let _ = client_tx
        .send(Envelope::new(
            "connected",
            serde_json::json!({ "clientId": client_id }),
        ))
        .await;

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => continue,
        };

        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                let _ = client_tx
                    .send(Envelope::new(
                        "error",
                        serde_json::json!({"code": "bad_request", "message": e.to_string()}),
                    ))
                    .await;
                continue;
            }
        };

        match envelope.kind.as_str() {
            "ping" => {
                let _ = client_tx
                    .send(Envelope::reply(envelope.id, "pong", serde_json::Value::Null))
                    .await;
            }
            "subscribe" => {
                handle_subscribe(
                    &state,
                    &client_id,
                    &ip,
                    auth.clone(),
                    envelope,
                    &client_tx,
                )
                .await;
            }
            "unsubscribe" => {
                match serde_json::from_value::<UnsubscribePayload>(envelope.payload) {
                    Ok(payload) => {
                        state.router.unsubscribe(&client_id, &payload.subscription_id);
                    }
                    Err(e) => {
                        let _ = client_tx
                            .send(Envelope::reply(
                                envelope.id,
                                "error",
                                serde_json::json!({"code": "bad_request", "message": e.to_string()}),
                            ))
                            .await;
                    }
                }
            }
            other => {
                let _ = client_tx
                    .send(Envelope::reply(
                        envelope.id,
                        "error",
                        serde_json::json!({
                            "code": "bad_request",
                            "message": format!("unknown message type '{other}'"),
                        }),
                    ))
                    .await;
            }
        }
    }

    // Disconnect implicitly removes every subscription.
    state.router.remove_client(&client_id);
    drop(client_tx);
    let _ = writer.await;
    debug!(client = %client_id, "realtime connection closed");
}

/// The subscribe sequence: register the subscription (its queue starts
/// buffering), take the cursor, run the baseline query through the
/// `read` policy, send the snapshot, then forward deltas with seq
/// greater than the cursor.
async fn handle_subscribe(
    state: &AppState,
    client_id: &str,
    ip: &str,
    auth: Option<serde_json::Value>,
    envelope: Envelope,
    client_tx: &mpsc::Sender<Envelope>,
) {
    let reply_id = envelope.id.clone();
    let payload = match serde_json::from_value::<SubscribePayload>(envelope.payload) {
        Ok(payload) => payload,
        Err(e) => {
            let _ = client_tx
                .send(Envelope::reply(
                    reply_id,
                    "error",
                    serde_json::json!({"code": "bad_request", "message": e.to_string()}),
                ))
                .await;
            return;
        }
    };

    let snap = state.registry.load();
    let filters = match &payload.filter {
        Some(json) => match parse_filter_json(&snap, &payload.collection, json) {
            Ok(filters) => filters,
            Err(message) => {
                let _ = client_tx
                    .send(Envelope::reply(
                        reply_id,
                        "error",
                        serde_json::json!({"code": "bad_request", "message": message}),
                    ))
                    .await;
                return;
            }
        },
        None => Vec::new(),
    };

    let registered = state.router.subscribe(
        client_id,
        &payload.collection,
        filters.clone(),
        auth.clone(),
        ip,
        client_tx.clone(),
    );
    let (subscription, mut queue) = match registered {
        Ok(pair) => pair,
        Err(message) => {
            let _ = client_tx
                .send(Envelope::reply(
                    reply_id,
                    "error",
                    serde_json::json!({"code": "rate_limited", "message": message}),
                ))
                .await;
            return;
        }
    };

    // Cursor after registration: every event past it is queued, so
    // nothing falls between snapshot and delta stream. The gateway
    // stamps inside its writer critical section, so anything with
    // seq <= cursor had committed before this read and is visible to
    // the baseline query below.
    let cursor = state.gateway.sequencer().current();

    let query = ListQuery {
        filters,
        sort: payload.sort.as_deref().and_then(alyx_core::query::Sort::parse),
        limit: payload.limit,
        ..ListQuery::default()
    };
    let mut ctx = RequestContext::anonymous("SUBSCRIBE", ip);
    ctx.auth = auth;

    let baseline = {
        let gateway = Arc::clone(&state.gateway);
        let collection = payload.collection.clone();
        tokio::task::spawn_blocking(move || gateway.list(&collection, &query, &ctx)).await
    };

    let result = match baseline {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            warn!(error = %err, "baseline query failed");
            state.router.unsubscribe(client_id, &subscription.id);
            let _ = client_tx
                .send(Envelope::reply(
                    reply_id,
                    "error",
                    serde_json::json!({"code": err.code(), "message": err.to_string()}),
                ))
                .await;
            return;
        }
        Err(join_err) => {
            state.router.unsubscribe(client_id, &subscription.id);
            let _ = client_tx
                .send(Envelope::reply(
                    reply_id,
                    "error",
                    serde_json::json!({"code": "internal", "message": join_err.to_string()}),
                ))
                .await;
            return;
        }
    };

    let docs: Vec<serde_json::Value> = result
        .docs
        .iter()
        .map(|d| document_to_json(&d.document))
        .collect();
    let _ = client_tx
        .send(Envelope::reply(
            reply_id,
            "snapshot",
            serde_json::json!({
                "subscriptionId": subscription.id,
                "docs": docs,
                "total": result.total,
                "cursor": cursor,
            }),
        ))
        .await;

    // Forward deltas; anything at or below the snapshot cursor is
    // already represented in the baseline.
    let forward_tx = client_tx.clone();
    tokio::spawn(async move {
        while let Some((seq, delta)) = queue.recv().await {
            if seq <= cursor {
                continue;
            }
            if forward_tx.send(delta).await.is_err() {
                break;
            }
        }
    });
}

async fn send(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), axum::Error> {
    let text = serde_json::to_string(envelope).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_payload_parses_from_envelope() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"id":"7","type":"subscribe","payload":{"collection":"messages","filter":{"channel":{"$eq":"general"}},"sort":"-created_at","limit":50}}"#,
        )
        .unwrap();
        let payload: SubscribePayload = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(payload.collection, "messages");
        assert_eq!(payload.limit, Some(50));
    }
}
