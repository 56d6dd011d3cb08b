//! WebSocket feed of job state changes

use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe to job updates
    let mut updates = state.orchestrator.subscribe();

    info!("WebSocket client connected");

    // Forward every job transition to the client
    let send_task = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(job) => {
                    let msg = match serde_json::to_string(&job) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Failed to encode job {}: {}", job.id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("WebSocket client missed {} job updates", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // The feed is one-way; only watch for the client going away
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnected");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cancel the send task when client disconnects
    send_task.abort();
}
