use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use super::reconciler::{Reconciler, ServerApplied};
use crate::models::{ClientMessage, Selection, ServerMessage, Step};

/// Edits produced by the embedding editor, fed into the connection loop.
#[derive(Debug, Clone)]
pub enum LocalEdit {
    Step(Step),
    Selection(Selection),
}

/// Connection loop for one client.
///
/// Connects, greets (with the last confirmed version on reconnect, so the
/// server can choose catch-up over a full document), then pumps server
/// messages into the reconciler and local edits out to the server. On any
/// transport failure it backs off and reconnects; returns when the edit
/// channel is closed.
pub async fn run_client(
    url: &str,
    reconciler: &mut Reconciler,
    edits: &mut mpsc::Receiver<LocalEdit>,
    retry: Duration,
) {
    loop {
        let (socket, _) = match connect_async(url).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "connection failed, retrying");
                tokio::time::sleep(retry).await;
                continue;
            }
        };
        info!(url, "connected to collaboration server");
        let (mut sink, mut stream) = socket.split();

        if send_message(&mut sink, &reconciler.greet()).await.is_err() {
            tokio::time::sleep(retry).await;
            continue;
        }

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(message) => {
                                let advances = matches!(
                                    &message,
                                    ServerMessage::DocumentChange(_) | ServerMessage::Greet(_)
                                );
                                match reconciler.apply_server(message) {
                                    Err(e) => {
                                        warn!(error = %e, "failed to integrate server message");
                                    }
                                    Ok(ServerApplied::NeedsResync) => {
                                        // A missed broadcast left a gap; the
                                        // greet carries the confirmed version
                                        // and the server answers with the
                                        // missing step suffix.
                                        if send_message(&mut sink, &reconciler.greet()).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerApplied::Applied) if advances => {
                                        // Rebased pending steps must be resent
                                        // at the advanced version.
                                        if let Some(resend) = reconciler.sendable() {
                                            if send_message(&mut sink, &resend).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    Ok(ServerApplied::Applied) => {}
                                }
                            }
                            Err(e) => warn!(error = %e, "unparsable server message"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        break;
                    }
                },
                edit = edits.recv() => match edit {
                    Some(LocalEdit::Step(step)) => match reconciler.edit(step) {
                        Ok(message) => {
                            if send_message(&mut sink, &message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "local edit rejected"),
                    },
                    Some(LocalEdit::Selection(selection)) => {
                        if let Some(message) = reconciler.select(selection) {
                            if send_message(&mut sink, &message).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                },
            }
        }

        warn!("connection lost, reconnecting");
        tokio::time::sleep(retry).await;
    }
}

async fn send_message<S>(sink: &mut S, message: &ClientMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}
