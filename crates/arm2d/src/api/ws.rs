//! `/sessions/{id}/events` WebSocket: server-push only, tagged JSON
//! messages of `type ∈ {state, output, event}` (§6). Mirrors the
//! teacher's lagged-receiver backpressure handling: a `Lagged(n)` error
//! accumulates a dropped-event counter and is folded into the next
//! event actually sent, rather than silently vanishing (§4.8's "never
//! silently lose terminal state").

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::api::handlers::SharedRegistry;

pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry, id))
}

async fn handle_socket(mut socket: WebSocket, registry: SharedRegistry, id: Uuid) {
    let Some(handle) = registry.get(id).await else {
        let _ = socket
            .send(Message::Text(
                serde_json::json!({"type": "event", "kind": "error", "message": "session not found"}).to_string(),
            ))
            .await;
        return;
    };

    info!(session_id = %id, "websocket subscriber connected");
    let mut rx = handle.subscribe();
    let mut dropped: usize = 0;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if dropped > 0 {
                            let notice = serde_json::json!({
                                "type": "event",
                                "kind": "backpressure",
                                "droppedCount": dropped,
                            });
                            if socket.send(Message::Text(notice.to_string())).await.is_err() {
                                break;
                            }
                            dropped = 0;
                        }
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if socket.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => error!(session_id = %id, error = %e, "failed to serialize session event"),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        dropped += n as usize;
                        debug!(session_id = %id, dropped, "subscriber lagging");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(session_id = %id, error = %e, "websocket error");
                        break;
                    }
                }
            }
        }
    }

    info!(session_id = %id, "websocket subscriber disconnected");
}
