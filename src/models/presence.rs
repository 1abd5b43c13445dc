use serde::{Deserialize, Serialize};

pub type UserId = String;

/// Opaque edit step produced by a client.
///
/// The coordinator never looks inside; the payload is handed as-is to the
/// injected transform capability for apply/rebase.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct Step(pub serde_json::Value);

/// A selection range inside the document.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

/// A connected participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub color: String,
}

/// A participant's live cursor state.
///
/// Exists from the moment the user greets, even before any selection has been
/// sent; `version` is the document version the selection was last valid at.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub color: String,
}
