//! In-memory session store

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::store::{Session, Turn};
use super::SessionStore;

type SessionEntry = Arc<Mutex<Session>>;

/// Map of session key to an individually locked session.
///
/// The outer lock is only held to find or insert an entry; turn updates
/// happen under the entry's own lock.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    entries: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    /// Get an existing entry
    pub(crate) fn existing(&self, key: &str) -> Option<SessionEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Get an entry, inserting the session built by `init` when absent
    pub(crate) fn get_or_insert_with<F>(&self, key: &str, init: F) -> SessionEntry
    where
        F: FnOnce() -> Session,
    {
        if let Some(entry) = self.existing(key) {
            return entry;
        }

        let mut entries = self.entries.write();
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

/// Process-local session store
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    table: SessionTable,
    max_turns: usize,
}

impl InMemorySessionStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that keeps at most `max_turns` turns per session (0 = unbounded)
    pub fn with_max_turns(max_turns: usize) -> Self {
        Self {
            table: SessionTable::default(),
            max_turns,
        }
    }

    /// Keys of all sessions seen so far
    pub fn session_keys(&self) -> Vec<String> {
        self.table.keys()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, session_id: &str) -> crate::Result<Vec<Turn>> {
        Ok(self
            .table
            .existing(session_id)
            .map(|entry| entry.lock().turns.clone())
            .unwrap_or_default())
    }

    fn append(&self, session_id: &str, turn: Turn) -> crate::Result<()> {
        let entry = self
            .table
            .get_or_insert_with(session_id, || Session::new(session_id));
        if entry.lock().push_turn(turn, self.max_turns) {
            tracing::debug!(session = session_id, max_turns = self.max_turns, "Trimmed session history");
        }
        Ok(())
    }

    fn clear(&self, session_id: &str) -> crate::Result<()> {
        if let Some(entry) = self.table.existing(session_id) {
            entry.lock().clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[test]
    fn test_get_unknown_session_is_empty() {
        let store = InMemorySessionStore::new();
        assert!(store.get("nobody").unwrap().is_empty());
        assert!(store.session_keys().is_empty());
    }

    #[test]
    fn test_append_preserves_order() {
        let store = InMemorySessionStore::new();
        store.append("s1", Turn::user("Hello")).unwrap();
        store.append("s1", Turn::assistant("Hi there!")).unwrap();

        let turns = store.get("s1").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, "Hi there!");
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = InMemorySessionStore::new();
        store.append("a", Turn::user("for a")).unwrap();
        store.append("b", Turn::user("for b")).unwrap();

        assert_eq!(store.get("a").unwrap()[0].content, "for a");
        assert_eq!(store.get("b").unwrap().len(), 1);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let store = InMemorySessionStore::new();
        store.clear("never-existed").unwrap();
        assert!(store.get("never-existed").unwrap().is_empty());

        store.append("s1", Turn::user("Hello")).unwrap();
        store.clear("s1").unwrap();
        store.clear("s1").unwrap();
        assert!(store.get("s1").unwrap().is_empty());
    }

    #[test]
    fn test_max_turns_window() {
        let store = InMemorySessionStore::with_max_turns(2);
        store.append("s1", Turn::user("one")).unwrap();
        store.append("s1", Turn::assistant("two")).unwrap();
        store.append("s1", Turn::user("three")).unwrap();

        let turns = store.get("s1").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "two");
        assert_eq!(turns[1].content, "three");
    }

    #[test]
    fn test_concurrent_appends_across_sessions() {
        let store = Arc::new(InMemorySessionStore::new());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let key = format!("session-{}", n % 2);
                    for i in 0..50 {
                        store.append(&key, Turn::user(format!("{}-{}", n, i))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("session-0").unwrap().len(), 200);
        assert_eq!(store.get("session-1").unwrap().len(), 200);
    }
}
