//! Signaling WebSocket handler.
//!
//! 1. Client connects to /ws, naming itself in `Sec-WebSocket-Protocol`
//! 2. The peer is registered before upgrade (a taken id gets 409)
//! 3. Existing producers are announced with `new-producer`
//! 4. Requests are handled one at a time, in arrival order
//! 5. On disconnect the peer's transports are closed and its producers leave the directory

use crate::health;
use crate::outbound::{Outbound, OutboundReceiver};
use crate::signaling;
use crate::state::SfuState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use castkit_common::{CastError, PeerId};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

/// Build the signaling router (`/ws`, `/health`, `/egress`).
pub fn build_router(state: Arc<SfuState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .merge(health::router())
        .with_state(state)
}

/// First non-empty entry of `Sec-WebSocket-Protocol`.
fn requested_peer_id(headers: &HeaderMap) -> Option<PeerId> {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(PeerId::from)
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<Arc<SfuState>>) -> Response {
    let requested = requested_peer_id(&headers);
    let peer_id = requested.clone().unwrap_or_else(PeerId::generate);

    let (outbound, rx) = match signaling::connect(&state, peer_id.clone()).await {
        Ok(conn) => conn,
        Err(e @ CastError::DuplicatePeer(_)) => {
            tracing::warn!(peer = %peer_id, "Rejected duplicate peer id");
            return (StatusCode::CONFLICT, e.to_string()).into_response();
        }
        Err(e) => {
            tracing::error!(peer = %peer_id, error = %e, "Failed to register peer");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.client_message()).into_response();
        }
    };

    let ws = match requested {
        Some(id) => ws.protocols([id.to_string()]),
        None => ws,
    };

    let failed_state = state.clone();
    let failed_peer = peer_id.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(peer = %failed_peer, error = %e, "WebSocket upgrade failed");
        tokio::spawn(async move {
            signaling::disconnect(&failed_state, &failed_peer).await;
        });
    })
    .on_upgrade(move |socket| handle_connection(socket, state, peer_id, outbound, rx))
}

/// Handle a single signaling WebSocket connection.
async fn handle_connection(
    socket: WebSocket,
    state: Arc<SfuState>,
    peer_id: PeerId,
    outbound: Outbound,
    mut rx: OutboundReceiver,
) {
    let (mut sender, mut receiver) = socket.split();

    // ── Sender task ──────────────────────────────────────────────────────────
    // Replies and broadcasts share the outbound queue, so frames reach the
    // socket in the order they were queued.
    let send_peer = peer_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if sender.send(Message::Text(envelope.to_json().into())).await.is_err() {
                tracing::debug!(peer = %send_peer, "Socket write failed");
                break;
            }
        }
        let _ = sender.close().await;
    });

    tracing::debug!(peer = %peer_id, "Signaling WebSocket connected");

    // Receive loop
    loop {
        tokio::select! {
            _ = outbound.disconnected() => {
                tracing::warn!(peer = %peer_id, "Peer disconnected by the relay");
                break;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = signaling::handle_text(&state, &peer_id, text.as_str()).await;
                    if !outbound.send(reply).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(peer = %peer_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    // Cleanup on disconnect
    signaling::disconnect(&state, &peer_id).await;
    outbound.disconnect();
    let _ = send_task.await;

    tracing::info!(peer = %peer_id, "Signaling WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn peer_id_comes_from_the_first_subprotocol() {
        let mut headers = HeaderMap::new();
        assert!(requested_peer_id(&headers).is_none());

        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("alice, castkit"));
        assert_eq!(requested_peer_id(&headers), Some(PeerId::from("alice")));

        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(" , "));
        assert!(requested_peer_id(&headers).is_none());
    }
}
