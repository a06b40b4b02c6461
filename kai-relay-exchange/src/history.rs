//! Session history access for the HTTP layer

use kai_relay_core::{SessionStore, Turn};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;

/// Reads and clears stored history
#[derive(Clone)]
pub struct HistoryHandler {
    store: Arc<dyn SessionStore>,
}

impl HistoryHandler {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Stored turns of a session in order; unknown sessions are empty
    pub fn read(&self, session_id: &str) -> Result<Vec<Turn>> {
        Ok(self.store.get(session_id)?)
    }

    /// Drop every turn of a session. Idempotent.
    pub fn clear(&self, session_id: &str) -> Result<()> {
        self.store.clear(session_id)?;
        info!("Cleared history for session {}", session_id);
        Ok(())
    }
}
