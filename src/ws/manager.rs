use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{Audience, Outbound, SyncCoordinator};
use crate::models::{ClientMessage, ServerMessage, UserId};

pub type ConnId = Uuid;

/// Frames the manager pushes down a connection's outbound channel; the socket
/// send task turns them into WebSocket frames.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(ServerMessage),
    Ping,
    Close,
}

/// Events fed into the manager's single event loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened {
        conn_id: ConnId,
        outbound: mpsc::Sender<OutboundFrame>,
    },
    Inbound {
        conn_id: ConnId,
        message: ClientMessage,
    },
    /// The payload could not be parsed as a known client message.
    Malformed {
        conn_id: ConnId,
        reason: String,
    },
    Pong {
        conn_id: ConnId,
    },
    Closed {
        conn_id: ConnId,
    },
}

struct ConnHandle {
    outbound: mpsc::Sender<OutboundFrame>,
    user_id: Option<UserId>,
    alive: bool,
}

/// Owns the coordinator and the connection table.
///
/// All shared mutation happens inside `run`'s event loop; one event is handled
/// to completion before the next, which is the protocol's whole concurrency
/// story. Per-connection inbound order is preserved by the event channel.
pub struct ConnectionManager {
    coordinator: SyncCoordinator,
    connections: HashMap<ConnId, ConnHandle>,
    heartbeat: Duration,
}

impl ConnectionManager {
    pub fn new(coordinator: SyncCoordinator, heartbeat: Duration) -> Self {
        Self {
            coordinator,
            connections: HashMap::new(),
            heartbeat,
        }
    }

    /// Event loop: runs until every event sender is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<ConnectionEvent>) {
        let mut ticker = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = ticker.tick() => self.heartbeat_sweep(),
            }
        }
        info!("connection manager shutting down");
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { conn_id, outbound } => {
                debug!(%conn_id, total = self.connections.len() + 1, "connection opened");
                self.connections.insert(
                    conn_id,
                    ConnHandle {
                        outbound,
                        user_id: None,
                        alive: true,
                    },
                );
            }
            ConnectionEvent::Inbound { conn_id, message } => self.handle_inbound(conn_id, message),
            ConnectionEvent::Malformed { conn_id, reason } => {
                warn!(%conn_id, %reason, "malformed message, closing connection");
                self.close_connection(conn_id);
            }
            ConnectionEvent::Pong { conn_id } => {
                if let Some(handle) = self.connections.get_mut(&conn_id) {
                    handle.alive = true;
                }
            }
            ConnectionEvent::Closed { conn_id } => {
                // May have already been removed by a sweep or a forced close.
                if self.connections.contains_key(&conn_id) {
                    debug!(%conn_id, "connection closed by peer");
                    self.close_connection(conn_id);
                }
            }
        }
    }

    fn handle_inbound(&mut self, conn_id: ConnId, message: ClientMessage) {
        if !self.connections.contains_key(&conn_id) {
            return;
        }
        self.bind_user(conn_id, message.user_id().clone());

        match self.coordinator.handle(message) {
            Ok(outbound) => self.fan_out(conn_id, outbound),
            Err(e) => {
                warn!(%conn_id, error = %e, "protocol violation, closing connection");
                self.close_connection(conn_id);
            }
        }
    }

    /// Bind the connection to the user id on its first attributed message.
    /// One live connection per user: an older connection claiming the same id
    /// is force-closed without a leave broadcast, since the user remains.
    fn bind_user(&mut self, conn_id: ConnId, user_id: UserId) {
        let already_bound = self
            .connections
            .get(&conn_id)
            .is_some_and(|h| h.user_id.is_some());
        if already_bound {
            return;
        }

        let stale: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(id, h)| **id != conn_id && h.user_id.as_deref() == Some(user_id.as_str()))
            .map(|(id, _)| *id)
            .collect();
        for old in stale {
            info!(conn_id = %old, %user_id, "user rebound to a new connection, closing old one");
            if let Some(handle) = self.connections.remove(&old) {
                let _ = handle.outbound.try_send(OutboundFrame::Close);
            }
        }

        if let Some(handle) = self.connections.get_mut(&conn_id) {
            handle.user_id = Some(user_id);
        }
    }

    /// Remove the connection and run the leave transition for its user.
    fn close_connection(&mut self, conn_id: ConnId) {
        let Some(handle) = self.connections.remove(&conn_id) else {
            return;
        };
        let _ = handle.outbound.try_send(OutboundFrame::Close);
        if let Some(user_id) = handle.user_id {
            let outbound = self.coordinator.handle_leave(&user_id);
            self.fan_out(conn_id, outbound);
        }
    }

    /// Deliver notices to their declared audience without stalling the loop.
    /// A connection whose channel cannot take a notice has missed part of the
    /// step stream and can no longer be kept in sync, so it is closed; the
    /// client reconnects and catches up from its confirmed version.
    fn fan_out(&mut self, sender: ConnId, outbound: Vec<Outbound>) {
        let mut stalled: Vec<ConnId> = Vec::new();
        for out in outbound {
            for (conn_id, handle) in &self.connections {
                let wanted = match out.audience {
                    Audience::Sender => *conn_id == sender,
                    Audience::Others => *conn_id != sender,
                    Audience::All => true,
                };
                if !wanted {
                    continue;
                }
                if handle
                    .outbound
                    .try_send(OutboundFrame::Message(out.message.clone()))
                    .is_err()
                    && !stalled.contains(conn_id)
                {
                    stalled.push(*conn_id);
                }
            }
        }
        for conn_id in stalled {
            warn!(%conn_id, "outbound channel full, terminating connection");
            self.close_connection(conn_id);
        }
    }

    /// Heartbeat: a connection that never answered the previous probe is
    /// terminated exactly as if the peer had closed it.
    fn heartbeat_sweep(&mut self) {
        let dead: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, h)| !h.alive)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in dead {
            info!(%conn_id, "no pong since last heartbeat, terminating connection");
            self.close_connection(conn_id);
        }

        for handle in self.connections.values_mut() {
            handle.alive = false;
            let _ = handle.outbound.try_send(OutboundFrame::Ping);
        }
    }
}
