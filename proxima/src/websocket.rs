//! WebSocket signaling endpoint
//!
//! One socket is one peer. Inbound text frames and engine notifications are
//! processed on the connection task in arrival order; outbound frames are
//! written by a dedicated writer task.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use proxima_sfu::SignalingDispatcher;
use tracing::{debug, error, info, warn};

use crate::server::AppState;

/// axum defaults to 64MB, far beyond any signaling frame
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (dispatcher, mut outbound, mut engine_events) =
        SignalingDispatcher::connect(state.service.clone(), state.broker.clone());
    let peer_id = dispatcher.peer_id().clone();
    info!(peer_id = %peer_id, "WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let writer_peer_id = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!(peer_id = %writer_peer_id, error = %e, "Failed to encode signaling frame");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                debug!(peer_id = %writer_peer_id, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatcher.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    debug!(peer_id = %peer_id, "Ignoring binary frame");
                }
                // Ping and pong are answered by axum
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(peer_id = %peer_id, error = %e, "WebSocket error");
                    break;
                }
            },
            Some(event) = engine_events.recv() => dispatcher.handle_engine_event(event).await,
            _ = shutdown.changed() => {
                debug!(peer_id = %peer_id, "Server shutting down, closing connection");
                break;
            }
        }
    }

    dispatcher.disconnect().await;
    // Dropping the last peer handle closes the outbound channel and ends the writer
    drop(dispatcher);
    if let Err(e) = writer.await {
        error!(peer_id = %peer_id, error = %e, "WebSocket writer task failed");
    }

    info!(peer_id = %peer_id, "WebSocket connection closed");
}
