use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::manager::{ConnectionEvent, OutboundFrame};
use crate::models::ClientMessage;

/// Capacity of a single connection's outbound frame channel.
const OUTBOUND_BUFFER: usize = 128;

/// Shared handle the collaboration route needs: the sender into the
/// connection manager's event loop.
#[derive(Clone)]
pub struct CollabState {
    pub events: mpsc::Sender<ConnectionEvent>,
}

/// WebSocket upgrade handler for the collaboration endpoint.
pub async fn collab_handler(
    ws: WebSocketUpgrade,
    State(state): State<CollabState>,
) -> Response {
    info!("new WebSocket connection attempt");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump one WebSocket: a recv task parses frames and forwards them to the
/// manager, a send task drains the connection's outbound channel.
async fn handle_socket(socket: WebSocket, state: CollabState) {
    let conn_id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);

    if state
        .events
        .send(ConnectionEvent::Opened {
            conn_id,
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    info!(%conn_id, "WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                OutboundFrame::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        debug!(%conn_id, error = %e, "failed to serialize outbound message");
                        continue;
                    }
                },
                OutboundFrame::Ping => Message::Ping(Vec::new()),
                OutboundFrame::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let events = state.events.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(parsed) => {
                        if events
                            .send(ConnectionEvent::Inbound {
                                conn_id,
                                message: parsed,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = events
                            .send(ConnectionEvent::Malformed {
                                conn_id,
                                reason: e.to_string(),
                            })
                            .await;
                        break;
                    }
                },
                Message::Pong(_) => {
                    if events.send(ConnectionEvent::Pong { conn_id }).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                // Axum answers ping frames itself; binary frames are not part
                // of the protocol.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    let _ = state.events.send(ConnectionEvent::Closed { conn_id }).await;
    info!(%conn_id, "WebSocket connection terminated");
}
