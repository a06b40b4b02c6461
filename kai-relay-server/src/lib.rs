//! HTTP surface for kai-relay
//!
//! Exposes chat exchanges (buffered JSON or server-sent events) and session
//! history over axum.

pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::{build_router, run_server};
pub use state::AppState;
