use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{
    ClientMessage, Cursor, DocumentChangeMessage, GreetMessage, SelectionChangeMessage,
    ServerDocumentChangeMessage, ServerGreetMessage, ServerMessage,
    ServerSelectionChangeMessage, UserId, UserJoinMessage, UserLeaveMessage,
};
use crate::presence::PresenceRegistry;
use crate::store::{Applied, DocumentStore, StoreError};
use crate::transform::TransformError;

/// Which connections an outbound message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Sender,
    Others,
    All,
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub audience: Audience,
    pub message: ServerMessage,
}

impl Outbound {
    fn to_sender(message: ServerMessage) -> Self {
        Self {
            audience: Audience::Sender,
            message,
        }
    }

    fn to_others(message: ServerMessage) -> Self {
        Self {
            audience: Audience::Others,
            message,
        }
    }

    fn to_all(message: ServerMessage) -> Self {
        Self {
            audience: Audience::All,
            message,
        }
    }
}

/// Violations that are fatal for the offending connection. The connection
/// layer closes the socket; shared state is never affected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("declared version {declared} is ahead of server version {current}")]
    FutureVersion { declared: u64, current: u64 },
    #[error("step batch rejected by transform: {0}")]
    InvalidStep(#[from] TransformError),
}

/// Single owner of the document store and presence registry.
///
/// One inbound message in, zero or more outbound notices out. Callers must
/// serialize invocations; handlers run to completion, so no partial mutation
/// is ever observable.
pub struct SyncCoordinator {
    store: DocumentStore,
    presence: PresenceRegistry,
}

impl SyncCoordinator {
    pub fn new(store: DocumentStore, presence: PresenceRegistry) -> Self {
        Self { store, presence }
    }

    pub fn version(&self) -> u64 {
        self.store.version()
    }

    /// Current canonical document and version.
    pub fn snapshot(&self) -> (&serde_json::Value, u64) {
        self.store.snapshot()
    }

    pub fn handle(&mut self, message: ClientMessage) -> Result<Vec<Outbound>, ProtocolError> {
        match message {
            ClientMessage::Greet(m) => self.handle_greet(m),
            ClientMessage::DocumentChange(m) => self.handle_document_change(m),
            ClientMessage::SelectionChange(m) => Ok(self.handle_selection_change(m)),
        }
    }

    /// Greet: register presence, reply with either a catch-up step suffix or
    /// the full document, and announce the join to everyone else.
    ///
    /// A declared version of 0 is a real version, not "no version": it yields
    /// a (possibly empty) catch-up, while an absent version yields the full
    /// document.
    fn handle_greet(&mut self, m: GreetMessage) -> Result<Vec<Outbound>, ProtocolError> {
        let current = self.store.version();
        // Validate the declared version before touching presence: a rejected
        // greet must leave no user record behind to un-announce.
        let catch_up = match m.version {
            Some(declared) => {
                let entries = self.store.steps_since(declared).map_err(|e| match e {
                    StoreError::VersionOutOfRange { requested, current } => {
                        ProtocolError::FutureVersion {
                            declared: requested,
                            current,
                        }
                    }
                    StoreError::InvalidStep(e) => ProtocolError::InvalidStep(e),
                })?;
                let steps = entries.iter().map(|e| e.step.clone()).collect::<Vec<_>>();
                let user_ids = entries.iter().map(|e| e.author.clone()).collect::<Vec<_>>();
                Some((steps, user_ids))
            }
            None => None,
        };

        let user = self.presence.join(&m.user_id, m.name.as_deref(), current);
        info!(user_id = %m.user_id, declared = ?m.version, current, "greet");

        let mut greet = ServerGreetMessage {
            users: self.presence.users().clone(),
            cursors: self.presence.cursors().clone(),
            version: current,
            document: None,
            steps: None,
            user_ids: None,
        };
        match catch_up {
            Some((steps, user_ids)) => {
                greet.steps = Some(steps);
                greet.user_ids = Some(user_ids);
            }
            None => {
                greet.document = Some(self.store.snapshot().0.clone());
            }
        }

        Ok(vec![
            Outbound::to_sender(ServerMessage::Greet(greet)),
            Outbound::to_others(ServerMessage::UserJoin(UserJoinMessage {
                user_id: m.user_id,
                user,
            })),
        ])
    }

    /// Document change: version-gated compare-and-append.
    ///
    /// Ahead of the server is a causally impossible claim and fatal; behind
    /// the server is an expected race, dropped silently while the client
    /// rebases off the broadcast that outran it.
    fn handle_document_change(
        &mut self,
        m: DocumentChangeMessage,
    ) -> Result<Vec<Outbound>, ProtocolError> {
        let current = self.store.version();
        if m.version > current {
            warn!(user_id = %m.user_id, declared = m.version, current, "future version claim");
            return Err(ProtocolError::FutureVersion {
                declared: m.version,
                current,
            });
        }
        if m.version < current {
            debug!(user_id = %m.user_id, declared = m.version, current, "stale submission dropped");
            return Ok(Vec::new());
        }

        let applied = self
            .store
            .apply_if_current(&m.steps, m.version, &m.user_id)
            .map_err(|e| match e {
                StoreError::InvalidStep(e) => ProtocolError::InvalidStep(e),
                StoreError::VersionOutOfRange { requested, current } => {
                    ProtocolError::FutureVersion {
                        declared: requested,
                        current,
                    }
                }
            })?;
        let new_version = match applied {
            Applied::Accepted { version } => version,
            // Unreachable after the equality check above, but harmless.
            Applied::Rejected { .. } => return Ok(Vec::new()),
        };

        self.presence.set_cursor(&m.user_id, m.selection, new_version);
        info!(user_id = %m.user_id, steps = m.steps.len(), version = new_version, "change accepted");

        let user_ids = vec![m.user_id.clone(); m.steps.len()];
        Ok(vec![Outbound::to_all(ServerMessage::DocumentChange(
            ServerDocumentChangeMessage {
                version: new_version,
                steps: m.steps,
                user_ids,
                cursors: self.cursor_of(&m.user_id),
            },
        ))])
    }

    /// Selection change: advisory, never rejected on version mismatch.
    fn handle_selection_change(&mut self, m: SelectionChangeMessage) -> Vec<Outbound> {
        self.presence.set_cursor(&m.user_id, m.selection, m.version);
        vec![Outbound::to_all(ServerMessage::SelectionChange(
            ServerSelectionChangeMessage {
                user_id: m.user_id.clone(),
                version: m.version,
                cursors: self.cursor_of(&m.user_id),
            },
        ))]
    }

    /// Leave transition, driven by disconnect or heartbeat timeout, never by
    /// a client message. Idempotent: a user already gone produces nothing.
    pub fn handle_leave(&mut self, user_id: &str) -> Vec<Outbound> {
        if !self.presence.leave(user_id) {
            return Vec::new();
        }
        info!(user_id, "user left");
        vec![Outbound::to_all(ServerMessage::UserLeave(UserLeaveMessage {
            user_id: user_id.to_string(),
        }))]
    }

    fn cursor_of(&self, user_id: &str) -> HashMap<UserId, Cursor> {
        self.presence
            .cursor(user_id)
            .map(|c| HashMap::from([(user_id.to_string(), c.clone())]))
            .unwrap_or_default()
    }
}
