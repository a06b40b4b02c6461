//! Chat exchange logic for kai-relay
//!
//! This crate validates incoming chat requests, merges them with stored
//! session history, calls the upstream provider and persists the reply,
//! either buffered or as a relayed stream of fragments.

pub mod controller;
pub mod error;
pub mod history;
pub mod normalizer;

pub use controller::{
    ExchangeController, ExchangeEvent, ExchangeEventStream, ExchangeReply, ExchangeState,
    DEFAULT_SESSION_KEY,
};
pub use error::{ErrorKind, ExchangeError, ValidationError};
pub use history::HistoryHandler;
pub use normalizer::{ChatRequest, NormalizedRequest, Normalizer, RawMessage};
