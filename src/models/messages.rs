use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{Cursor, Selection, Step, User, UserId};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GreetMessage {
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Last version known to the client. Absent on a first-time connection;
    /// present (possibly 0) on reconnect, requesting catch-up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChangeMessage {
    pub user_id: UserId,
    /// Version the steps were produced against. Must equal the server
    /// version at acceptance time or the batch is not applied.
    pub version: u64,
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SelectionChangeMessage {
    pub user_id: UserId,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

/// Messages a client sends over the collaboration socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "client-greet")]
    Greet(GreetMessage),
    #[serde(rename = "client-document-change")]
    DocumentChange(DocumentChangeMessage),
    #[serde(rename = "client-selection-change")]
    SelectionChange(SelectionChangeMessage),
}

impl ClientMessage {
    /// The user id the message claims to be from.
    pub fn user_id(&self) -> &UserId {
        match self {
            ClientMessage::Greet(m) => &m.user_id,
            ClientMessage::DocumentChange(m) => &m.user_id,
            ClientMessage::SelectionChange(m) => &m.user_id,
        }
    }
}

/// Reply to a greet. Carries either the full document (first connection) or
/// the step suffix the reconnecting client is missing, never both.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerGreetMessage {
    pub users: HashMap<UserId, User>,
    pub cursors: HashMap<UserId, Cursor>,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<UserId>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinMessage {
    pub user_id: UserId,
    pub user: User,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserLeaveMessage {
    pub user_id: UserId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerSelectionChangeMessage {
    pub user_id: UserId,
    pub version: u64,
    pub cursors: HashMap<UserId, Cursor>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerDocumentChangeMessage {
    /// Version after the accepted batch.
    pub version: u64,
    pub steps: Vec<Step>,
    /// Author of each step in `steps`, index-aligned.
    pub user_ids: Vec<UserId>,
    pub cursors: HashMap<UserId, Cursor>,
}

/// Messages the server sends to clients.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "server-greet")]
    Greet(ServerGreetMessage),
    #[serde(rename = "server-user-join")]
    UserJoin(UserJoinMessage),
    #[serde(rename = "server-user-leave")]
    UserLeave(UserLeaveMessage),
    #[serde(rename = "server-selection-change")]
    SelectionChange(ServerSelectionChangeMessage),
    #[serde(rename = "server-document-change")]
    DocumentChange(ServerDocumentChangeMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_greet_round_trips_without_version() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"client-greet","userId":"u1"}"#).unwrap();
        match &msg {
            ClientMessage::Greet(g) => {
                assert_eq!(g.user_id, "u1");
                assert_eq!(g.version, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("version"));
    }

    #[test]
    fn greet_version_zero_is_not_absent() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"client-greet","userId":"u1","version":0}"#).unwrap();
        match msg {
            ClientMessage::Greet(g) => assert_eq!(g.version, Some(0)),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn document_change_carries_opaque_steps() {
        let raw = json!({
            "type": "client-document-change",
            "userId": "u2",
            "version": 4,
            "steps": [{"anything": ["goes", 1]}],
            "selection": {"anchor": 1, "head": 3}
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::DocumentChange(m) => {
                assert_eq!(m.version, 4);
                assert_eq!(m.steps[0].0["anything"][0], "goes");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn server_greet_full_document_omits_steps() {
        let msg = ServerMessage::Greet(ServerGreetMessage {
            users: HashMap::new(),
            cursors: HashMap::new(),
            version: 0,
            document: Some(json!("Hi!")),
            steps: None,
            user_ids: None,
        });
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""type":"server-greet""#));
        assert!(text.contains("document"));
        assert!(!text.contains("steps"));
        assert!(!text.contains("userIds"));
    }
}
