//! WebSocket endpoint for the notification hub.
//!
//! Clients connect to `GET /ws` and manage group membership with JSON
//! frames:
//!
//! ```json
//! {"action": "subscribe", "group": "bucket:abc123defg"}
//! {"action": "unsubscribe", "group": "bucket:abc123defg"}
//! ```
//!
//! The `global` group needs an Admin credential at the handshake, passed
//! either as a bearer header or an `auth` query parameter (browser
//! WebSocket clients cannot set headers).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::auth;
use crate::AppState;

#[derive(Debug, Deserialize)]
struct ClientFrame {
    action: String,
    group: String,
}

/// `GET /ws` -- upgrade to the notification stream.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| params.get("auth").cloned());

    let context = auth::resolve(&state, bearer.as_deref())
        .await
        .unwrap_or(auth::AuthContext::Public);
    let is_admin = context.is_admin();

    ws.on_upgrade(move |socket| handle_socket(state, socket, is_admin))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, is_admin: bool) {
    let (conn, mut events) = state.hub.register(is_admin);
    let (mut sink, mut stream) = socket.split();
    debug!(conn, is_admin, "notification connection opened");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(payload) => {
                        if sink.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_frame(&state, conn, &text);
                        if sink.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.disconnect(conn);
    debug!(conn, "notification connection closed");
}

fn handle_frame(state: &AppState, conn: crate::hub::ConnId, text: &str) -> String {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            return serde_json::json!({
                "type": "error",
                "error": "frames must be {\"action\": ..., \"group\": ...}",
            })
            .to_string()
        }
    };

    match frame.action.as_str() {
        "subscribe" => {
            if state.hub.subscribe(conn, &frame.group) {
                serde_json::json!({"type": "subscribed", "group": frame.group}).to_string()
            } else {
                serde_json::json!({
                    "type": "error",
                    "error": "subscription refused",
                    "group": frame.group,
                })
                .to_string()
            }
        }
        "unsubscribe" => {
            state.hub.unsubscribe(conn, &frame.group);
            serde_json::json!({"type": "unsubscribed", "group": frame.group}).to_string()
        }
        other => serde_json::json!({
            "type": "error",
            "error": format!("unknown action: {other}"),
        })
        .to_string(),
    }
}
