use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{
    ClientMessage, Cursor, DocumentChangeMessage, GreetMessage, SelectionChangeMessage,
    Selection, ServerMessage, Step, User, UserId,
};
use crate::transform::{Transform, TransformError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not synchronized with the server yet")]
    NotSynced,
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Outcome of feeding a server message into the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerApplied {
    Applied,
    /// A broadcast was missed and the incoming step suffix no longer
    /// attaches to the confirmed version. The transport must re-greet with
    /// the confirmed version so the server sends the missing suffix.
    NeedsResync,
}

/// Per-client reconciliation state: the mirror image of the server.
///
/// Keeps the last server-confirmed document plus a queue of locally applied,
/// not-yet-confirmed steps. Local edits are applied optimistically; steps
/// arriving from other participants rebase the pending queue through the
/// transform capability.
pub struct Reconciler {
    user_id: UserId,
    name: Option<String>,
    /// Document at the confirmed version, before any pending steps.
    confirmed: Value,
    /// Confirmed document with the pending steps applied; what the editor
    /// renders.
    local: Value,
    /// Confirmed version; `None` until the first server greet reply.
    version: Option<u64>,
    pending: Vec<Step>,
    /// Set once a non-attaching suffix was reported, so a burst of broadcasts
    /// behind the same gap requests a single resync.
    awaiting_resync: bool,
    selection: Option<Selection>,
    users: HashMap<UserId, User>,
    cursors: HashMap<UserId, Cursor>,
    transform: Arc<dyn Transform>,
}

impl Reconciler {
    pub fn new(user_id: impl Into<UserId>, name: Option<String>, transform: Arc<dyn Transform>) -> Self {
        Self {
            user_id: user_id.into(),
            name,
            confirmed: Value::Null,
            local: Value::Null,
            version: None,
            pending: Vec::new(),
            awaiting_resync: false,
            selection: None,
            users: HashMap::new(),
            cursors: HashMap::new(),
            transform,
        }
    }

    /// Greet message for (re)connecting. Carries the last confirmed version
    /// so the server can choose catch-up over a full document.
    pub fn greet(&self) -> ClientMessage {
        ClientMessage::Greet(GreetMessage {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            version: self.version,
        })
    }

    /// Apply a local edit optimistically and produce the document-change
    /// message carrying every unconfirmed step, declared against the version
    /// the local view is based on.
    pub fn edit(&mut self, step: Step) -> Result<ClientMessage, ClientError> {
        let version = self.version.ok_or(ClientError::NotSynced)?;
        self.local = self.transform.apply(&self.local, &step)?;
        self.pending.push(step);
        Ok(ClientMessage::DocumentChange(DocumentChangeMessage {
            user_id: self.user_id.clone(),
            version,
            steps: self.pending.clone(),
            selection: self.selection,
        }))
    }

    /// The document-change message for the current pending queue, or `None`
    /// when there is nothing unconfirmed. Used to resend after a foreign
    /// broadcast wins the version race and the pending steps were rebased.
    pub fn sendable(&self) -> Option<ClientMessage> {
        let version = self.version?;
        if self.pending.is_empty() {
            return None;
        }
        Some(ClientMessage::DocumentChange(DocumentChangeMessage {
            user_id: self.user_id.clone(),
            version,
            steps: self.pending.clone(),
            selection: self.selection,
        }))
    }

    /// Move the local selection. Produces a selection-change message only
    /// when no document steps are pending; otherwise the selection rides
    /// along with the next document-change.
    pub fn select(&mut self, selection: Selection) -> Option<ClientMessage> {
        self.selection = Some(selection);
        let version = self.version?;
        if !self.pending.is_empty() {
            return None;
        }
        Some(ClientMessage::SelectionChange(SelectionChangeMessage {
            user_id: self.user_id.clone(),
            version,
            selection: self.selection,
        }))
    }

    /// Feed one server message into the reconciler. `NeedsResync` tells the
    /// transport to re-greet with the confirmed version.
    pub fn apply_server(&mut self, message: ServerMessage) -> Result<ServerApplied, ClientError> {
        match message {
            ServerMessage::Greet(g) => {
                self.users = g.users;
                self.merge_cursors(g.cursors);
                if let Some(document) = g.document {
                    // Full document: any pending steps were produced against
                    // a state we can no longer relate to; drop them.
                    if !self.pending.is_empty() {
                        warn!(pending = self.pending.len(), "full resync discards pending steps");
                        self.pending.clear();
                    }
                    self.confirmed = document;
                    self.local = self.confirmed.clone();
                    self.version = Some(g.version);
                    self.awaiting_resync = false;
                    Ok(ServerApplied::Applied)
                } else {
                    let steps = g.steps.unwrap_or_default();
                    let authors = g.user_ids.unwrap_or_default();
                    self.receive(g.version, steps, authors)
                }
            }
            ServerMessage::DocumentChange(d) => {
                self.merge_cursors(d.cursors);
                self.receive(d.version, d.steps, d.user_ids)
            }
            ServerMessage::SelectionChange(s) => {
                self.merge_cursors(s.cursors);
                Ok(ServerApplied::Applied)
            }
            ServerMessage::UserJoin(j) => {
                self.users.insert(j.user_id, j.user);
                Ok(ServerApplied::Applied)
            }
            ServerMessage::UserLeave(l) => {
                self.users.remove(&l.user_id);
                self.cursors.remove(&l.user_id);
                Ok(ServerApplied::Applied)
            }
        }
    }

    /// Integrate a confirmed step suffix ending at `new_version`.
    fn receive(
        &mut self,
        new_version: u64,
        steps: Vec<Step>,
        authors: Vec<UserId>,
    ) -> Result<ServerApplied, ClientError> {
        // Nothing to attach to before the first greet reply.
        let Some(confirmed_version) = self.version else {
            return Ok(ServerApplied::Applied);
        };
        if new_version <= confirmed_version {
            return Ok(ServerApplied::Applied);
        }
        let base = new_version - steps.len() as u64;
        if base != confirmed_version {
            // A gap means we missed a broadcast; only the server can supply
            // the missing suffix. Report it once per gap.
            warn!(base, confirmed_version, "step suffix does not attach, requesting resync");
            if self.awaiting_resync {
                return Ok(ServerApplied::Applied);
            }
            self.awaiting_resync = true;
            return Ok(ServerApplied::NeedsResync);
        }

        // Our own steps coming back confirmed are the front of the pending
        // queue: acknowledge them instead of rebasing over them.
        let mut acknowledged = 0;
        while acknowledged < steps.len()
            && authors.get(acknowledged).is_some_and(|a| a == &self.user_id)
            && self.pending.get(acknowledged) == steps.get(acknowledged)
        {
            acknowledged += 1;
        }
        for step in &steps[..acknowledged] {
            self.confirmed = self.transform.apply(&self.confirmed, step)?;
        }
        self.pending.drain(..acknowledged);
        if acknowledged > 0 {
            debug!(acknowledged, remaining = self.pending.len(), "own steps confirmed");
        }

        let foreign = &steps[acknowledged..];
        if !foreign.is_empty() {
            let rebased = self
                .transform
                .rebase(&self.confirmed, foreign, &self.pending)?;
            self.confirmed = rebased.document;
            self.pending = rebased.pending;
        }

        self.local = self.confirmed.clone();
        for step in &self.pending {
            self.local = self.transform.apply(&self.local, step)?;
        }
        self.version = Some(new_version);
        self.awaiting_resync = false;
        Ok(ServerApplied::Applied)
    }

    fn merge_cursors(&mut self, cursors: HashMap<UserId, Cursor>) {
        for (user_id, cursor) in cursors {
            if user_id != self.user_id {
                self.cursors.insert(user_id, cursor);
            }
        }
    }

    /// The document as the editor should render it, pending steps included.
    pub fn document(&self) -> &Value {
        &self.local
    }

    /// Last server-confirmed version, if greeted.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn pending_steps(&self) -> usize {
        self.pending.len()
    }

    /// Currently known participants.
    pub fn users(&self) -> &HashMap<UserId, User> {
        &self.users
    }

    /// Cursor overlays for the other participants.
    pub fn cursors(&self) -> &HashMap<UserId, Cursor> {
        &self.cursors
    }
}
