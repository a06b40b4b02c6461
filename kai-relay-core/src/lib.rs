//! Core types and storage for kai-relay
//!
//! This crate provides the conversation data model, the session store
//! contract and its implementations, configuration loading and logging
//! setup shared by the other kai-relay components.

pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod utils;

pub use error::{Error, Result};
pub use session::{Role, SessionStore, Turn};
