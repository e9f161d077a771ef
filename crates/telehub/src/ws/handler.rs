//! WebSocket handler for client connections.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};

use crate::api::AppState;

use super::outbox::Outbox;
use super::types::{ClientFrame, ClientId};

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Handle a WebSocket connection from open to close.
async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let hub = state.router.hub().clone();
    let registry = hub.registry().clone();

    let outbox = Arc::new(Outbox::new(state.client_queue_capacity));
    // Only the new client learns its id, and that frame comes first.
    let client_id = hub.connect(outbox.clone());
    info!("New client {} connected", client_id);

    let (mut sender, mut receiver) = socket.split();

    // Drain the outbox into the socket until it is closed.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sender
                .send(WsMessage::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => handle_text(&state, client_id, text.as_str()),
                Some(Ok(WsMessage::Binary(_))) => {
                    debug!("Received binary message from client {}, ignoring", client_id);
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("Client {} disconnected", client_id);
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error for client {}: {}", client_id, e);
                    break;
                }
            },
            _ = &mut send_task => {
                info!("Client {} dropped by the hub", client_id);
                break;
            }
        }
    }

    send_task.abort();
    registry.unregister(client_id);
}

/// Parse one text frame and hand it to the router.
fn handle_text(state: &AppState, client_id: ClientId, text: &str) {
    debug!("Client {} sent a message: {}", client_id, text);

    match ClientFrame::parse(text) {
        Ok(frame) => {
            state.router.route_client(client_id, frame);
        }
        Err(e) => {
            warn!("Dropping malformed frame from client {}: {}", client_id, e);
        }
    }
}
