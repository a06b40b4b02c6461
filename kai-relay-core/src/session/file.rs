//! File-backed session store
//!
//! Each session is written through to `<dir>/<encoded_key>.jsonl`: one
//! metadata line followed by one line per turn. The key is percent-encoded
//! in the file name and repeated in the metadata line. Sessions are cached
//! in memory after their first access.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::memory::SessionTable;
use super::store::{Session, Turn};
use super::SessionStore;
use crate::utils::session_file_stem;

/// Session store persisting history as JSONL files
#[derive(Debug)]
pub struct FileSessionStore {
    sessions_dir: PathBuf,
    table: SessionTable,
    max_turns: usize,
}

impl FileSessionStore {
    /// Create a store rooted at `dir`; the directory is created on first write
    pub fn new<P: AsRef<Path>>(dir: P, max_turns: usize) -> Self {
        Self {
            sessions_dir: dir.as_ref().to_path_buf(),
            table: SessionTable::default(),
            max_turns,
        }
    }

    /// Directory holding the session files
    pub fn dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Load a session from disk
    fn load(&self, key: &str) -> crate::Result<Option<Session>> {
        let path = self.session_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let mut session = Session::new(key);

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let value: serde_json::Value = serde_json::from_str(line)?;
            if value.get("_type").and_then(|v| v.as_str()) == Some("metadata") {
                if let Some(stored) = value.get("key").and_then(|v| v.as_str()) {
                    if stored != key {
                        return Err(crate::Error::Validation(format!(
                            "session file {:?} belongs to '{}', not '{}'",
                            path, stored, key
                        )));
                    }
                }
                if let Some(created_at) = value
                    .get("created_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                {
                    session.created_at = created_at;
                }
                continue;
            }

            match serde_json::from_value::<Turn>(value) {
                Ok(turn) => session.turns.push(turn),
                Err(e) => warn!("Skipping malformed turn at {:?}:{}: {}", path, line_no + 1, e),
            }
        }

        debug!("Loaded session {} with {} turns", key, session.turns.len());
        Ok(Some(session))
    }

    /// Write a session to disk, replacing the previous file
    fn save(&self, session: &Session) -> crate::Result<()> {
        std::fs::create_dir_all(&self.sessions_dir)?;
        let path = self.session_path(&session.key);

        let mut lines = Vec::with_capacity(session.turns.len() + 1);
        let metadata = serde_json::json!({
            "_type": "metadata",
            "key": session.key,
            "created_at": session.created_at.to_rfc3339(),
            "updated_at": session.updated_at.to_rfc3339(),
        });
        lines.push(serde_json::to_string(&metadata)?);

        for turn in &session.turns {
            lines.push(serde_json::to_string(turn)?);
        }

        std::fs::write(&path, lines.join("\n"))?;
        Ok(())
    }

    /// Cached entry for `key`, loading it from disk on first access
    fn entry(&self, key: &str) -> crate::Result<std::sync::Arc<parking_lot::Mutex<Session>>> {
        if let Some(entry) = self.table.existing(key) {
            return Ok(entry);
        }
        let loaded = self.load(key)?.unwrap_or_else(|| Session::new(key));
        Ok(self.cache_loaded(key, loaded))
    }

    /// Cache a session read from disk unless another caller got there first.
    ///
    /// A concurrent `append` or `clear` installs its entry before touching the
    /// file, so the entry already in the table wins over `loaded`.
    fn cache_loaded(
        &self,
        key: &str,
        loaded: Session,
    ) -> std::sync::Arc<parking_lot::Mutex<Session>> {
        self.table.get_or_insert_with(key, || loaded)
    }

    /// List persisted sessions, most recently updated first
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&self.sessions_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let mut lines = content.lines().filter(|l| !l.trim().is_empty());
                let Some(first_line) = lines.next() else {
                    continue;
                };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(first_line) else {
                    continue;
                };
                if value.get("_type").and_then(|v| v.as_str()) != Some("metadata") {
                    continue;
                }

                sessions.push(SessionInfo {
                    key: value
                        .get("key")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .unwrap_or_else(|| {
                            path.file_stem()
                                .map(|s| s.to_string_lossy().to_string())
                                .unwrap_or_default()
                        }),
                    turns: lines.count(),
                    updated_at: value
                        .get("updated_at")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    path: path.to_string_lossy().to_string(),
                });
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.jsonl", session_file_stem(key)))
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, session_id: &str) -> crate::Result<Vec<Turn>> {
        if let Some(entry) = self.table.existing(session_id) {
            return Ok(entry.lock().turns.clone());
        }
        match self.load(session_id)? {
            Some(loaded) => Ok(self.cache_loaded(session_id, loaded).lock().turns.clone()),
            None => Ok(Vec::new()),
        }
    }

    fn append(&self, session_id: &str, turn: Turn) -> crate::Result<()> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock();

        // Only a saved turn becomes visible
        let mut updated = session.clone();
        updated.push_turn(turn, self.max_turns);
        self.save(&updated)?;
        *session = updated;
        Ok(())
    }

    fn clear(&self, session_id: &str) -> crate::Result<()> {
        let entry = self
            .table
            .get_or_insert_with(session_id, || Session::new(session_id));
        let mut session = entry.lock();
        session.clear();
        remove_if_exists(&self.session_path(session_id))
    }
}

fn remove_if_exists(path: &Path) -> crate::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Information about a persisted session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session key
    pub key: String,
    /// Number of stored turns
    pub turns: usize,
    /// Last update time
    pub updated_at: Option<String>,
    /// File path
    pub path: String,
}
