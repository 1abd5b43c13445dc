use std::collections::HashMap;

use tracing::debug;

use crate::models::{Cursor, Selection, User, UserId};

/// Live user and cursor records for every greeted participant.
///
/// Colors come from a fixed palette, assigned round-robin per new user id and
/// stable for the process lifetime. Every user gets a cursor record at join
/// time, before any selection has been sent.
pub struct PresenceRegistry {
    palette: Vec<String>,
    next_color: usize,
    users: HashMap<UserId, User>,
    cursors: HashMap<UserId, Cursor>,
}

impl PresenceRegistry {
    pub fn new(palette: Vec<String>) -> Self {
        // An empty palette would make color assignment impossible.
        let palette = if palette.is_empty() {
            vec!["gray".to_string()]
        } else {
            palette
        };
        Self {
            palette,
            next_color: 0,
            users: HashMap::new(),
            cursors: HashMap::new(),
        }
    }

    /// Register a user, allocating the next palette color if new.
    /// Idempotent: an already-known user keeps its color.
    pub fn join(&mut self, user_id: &str, name: Option<&str>, version: u64) -> User {
        if let Some(existing) = self.users.get_mut(user_id) {
            if existing.name.is_none() {
                existing.name = name.map(str::to_string);
            }
            return existing.clone();
        }

        let color = self.palette[self.next_color % self.palette.len()].clone();
        self.next_color = (self.next_color + 1) % self.palette.len();

        let user = User {
            id: user_id.to_string(),
            name: name.map(str::to_string),
            color: color.clone(),
        };
        self.users.insert(user_id.to_string(), user.clone());
        self.cursors.insert(
            user_id.to_string(),
            Cursor {
                user_id: user_id.to_string(),
                selection: None,
                version,
                name: user.name.clone(),
                color,
            },
        );
        debug!(user_id, color = %user.color, "user joined presence");
        user
    }

    /// Upsert the cursor record, merging in the user's color and name.
    pub fn set_cursor(&mut self, user_id: &str, selection: Option<Selection>, version: u64) {
        let user = self.users.get(user_id);
        let color = user
            .map(|u| u.color.clone())
            .unwrap_or_else(|| self.palette[0].clone());
        let name = user.and_then(|u| u.name.clone());
        self.cursors.insert(
            user_id.to_string(),
            Cursor {
                user_id: user_id.to_string(),
                selection,
                version,
                name,
                color,
            },
        );
    }

    /// Remove both user and cursor records. No-op if absent; returns whether
    /// the user was present.
    pub fn leave(&mut self, user_id: &str) -> bool {
        let was_present = self.users.remove(user_id).is_some();
        self.cursors.remove(user_id);
        if was_present {
            debug!(user_id, "user left presence");
        }
        was_present
    }

    pub fn users(&self) -> &HashMap<UserId, User> {
        &self.users
    }

    pub fn cursors(&self) -> &HashMap<UserId, Cursor> {
        &self.cursors
    }

    pub fn cursor(&self, user_id: &str) -> Option<&Cursor> {
        self.cursors.get(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(vec!["red".into(), "green".into(), "blue".into()])
    }

    #[test]
    fn colors_assigned_round_robin_and_reused() {
        let mut p = registry();
        assert_eq!(p.join("a", None, 0).color, "red");
        assert_eq!(p.join("b", None, 0).color, "green");
        assert_eq!(p.join("c", None, 0).color, "blue");
        assert_eq!(p.join("d", None, 0).color, "red");
    }

    #[test]
    fn join_is_idempotent() {
        let mut p = registry();
        let first = p.join("a", Some("Ada"), 0);
        let again = p.join("a", None, 5);
        assert_eq!(first, again);
        assert_eq!(p.users().len(), 1);
    }

    #[test]
    fn joined_user_has_cursor_before_any_selection() {
        let mut p = registry();
        p.join("a", None, 3);
        let cursor = p.cursor("a").unwrap();
        assert_eq!(cursor.selection, None);
        assert_eq!(cursor.version, 3);
        assert_eq!(cursor.color, "red");
    }

    #[test]
    fn set_cursor_merges_user_color() {
        let mut p = registry();
        p.join("a", Some("Ada"), 0);
        p.set_cursor("a", Some(Selection { anchor: 1, head: 4 }), 2);
        let cursor = p.cursor("a").unwrap();
        assert_eq!(cursor.selection, Some(Selection { anchor: 1, head: 4 }));
        assert_eq!(cursor.color, "red");
        assert_eq!(cursor.name.as_deref(), Some("Ada"));
    }

    #[test]
    fn leave_removes_both_records_and_is_idempotent() {
        let mut p = registry();
        p.join("a", None, 0);
        assert!(p.leave("a"));
        assert!(p.users().is_empty());
        assert!(p.cursors().is_empty());
        assert!(!p.leave("a"));
    }
}
