//! Session storage for conversation history
//!
//! A session is an ordered, append-only list of [`Turn`]s keyed by an
//! opaque client-supplied string. All access goes through the
//! [`SessionStore`] contract so the exchange logic does not care whether
//! history lives in memory or on disk.

pub mod file;
pub mod memory;
pub mod store;

pub use file::{FileSessionStore, SessionInfo};
pub use memory::InMemorySessionStore;
pub use store::{Role, Session, Turn};

/// Storage contract for session history.
///
/// Implementations must be safe to share across tasks. Appends to one
/// session are applied in call order and readers never observe a partially
/// written sequence. Distinct sessions do not contend with each other
/// beyond the lookup of their entry.
pub trait SessionStore: Send + Sync {
    /// Ordered turns of a session. Unknown sessions yield an empty list.
    fn get(&self, session_id: &str) -> crate::Result<Vec<Turn>>;

    /// Append one turn to a session, creating the session if needed.
    ///
    /// Not idempotent: calling twice stores the turn twice.
    fn append(&self, session_id: &str, turn: Turn) -> crate::Result<()>;

    /// Remove every turn of a session. Clearing an unknown session is a no-op.
    fn clear(&self, session_id: &str) -> crate::Result<()>;
}
