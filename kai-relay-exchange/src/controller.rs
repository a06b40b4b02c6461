//! Exchange controller
//!
//! Drives one chat request through validation, history merge, the upstream
//! call and persistence of the reply. Exchanges on the same session are
//! serialized so each one reads the history its predecessor left behind.

use futures::{Stream, StreamExt};
use kai_relay_core::utils::truncate;
use kai_relay_core::{SessionStore, Turn};
use kai_relay_providers::{FragmentStream, StreamEvent, UpstreamProvider};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::{ExchangeError, Result};
use crate::normalizer::{ChatRequest, NormalizedRequest, Normalizer};

/// Session used when a request does not name one
pub const DEFAULT_SESSION_KEY: &str = "default";

/// Capacity of the channel between the relay task and the client
const EVENT_BUFFER: usize = 32;

/// Idle exchange locks are dropped once the table grows past this size
const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Lifecycle of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Normalizing,
    HistoryMerged,
    AwaitingUpstream,
    Emitting,
    Persisted,
    Failed,
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeState::Idle => "idle",
            ExchangeState::Normalizing => "normalizing",
            ExchangeState::HistoryMerged => "history_merged",
            ExchangeState::AwaitingUpstream => "awaiting_upstream",
            ExchangeState::Emitting => "emitting",
            ExchangeState::Persisted => "persisted",
            ExchangeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a buffered exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeReply {
    pub session_id: String,
    pub reply: String,
    pub model: String,
}

/// Item of a streamed exchange.
///
/// Zero or more fragments are followed by exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    Fragment(String),
    /// The full reply, already persisted
    Done { reply: String },
    Error(ExchangeError),
}

pub type ExchangeEventStream = Pin<Box<dyn Stream<Item = ExchangeEvent> + Send>>;

/// Logs state transitions of a single exchange
struct Transitions {
    session_id: String,
    state: ExchangeState,
}

impl Transitions {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: ExchangeState::Idle,
        }
    }

    fn advance(&mut self, next: ExchangeState) {
        debug!("Exchange [{}]: {} -> {}", self.session_id, self.state, next);
        self.state = next;
    }

    /// Move to `Failed` and hand the error back
    fn failed(&mut self, err: ExchangeError) -> ExchangeError {
        warn!(
            "Exchange [{}] failed in {} ({}): {}",
            self.session_id,
            self.state,
            err.kind(),
            err
        );
        self.state = ExchangeState::Failed;
        err
    }

    fn cancelled(&mut self) {
        info!(
            "Exchange [{}] cancelled by client in {}, reply not stored",
            self.session_id, self.state
        );
        self.state = ExchangeState::Failed;
    }
}

/// Per-session async locks held for the duration of an exchange
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() >= LOCK_PRUNE_THRESHOLD {
                // Held and awaited locks have a guard or waiter holding a clone.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(session_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Runs chat exchanges against a session store and an upstream provider
pub struct ExchangeController {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn UpstreamProvider>,
    normalizer: Normalizer,
    default_session: String,
    locks: SessionLocks,
}

impl ExchangeController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn UpstreamProvider>,
        normalizer: Normalizer,
    ) -> Self {
        Self {
            store,
            provider,
            normalizer,
            default_session: DEFAULT_SESSION_KEY.to_string(),
            locks: SessionLocks::default(),
        }
    }

    /// Override the session used for requests without a session id
    pub fn with_default_session(mut self, session_id: impl Into<String>) -> Self {
        self.default_session = session_id.into();
        self
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.store)
    }

    pub fn default_session(&self) -> &str {
        &self.default_session
    }

    /// The session a request addresses; blank ids map to the default session
    pub fn resolve_session(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.default_session.clone(),
        }
    }

    /// Run a buffered exchange and return the complete reply.
    ///
    /// The user turn is stored before the upstream call and stays in the
    /// history even if that call fails.
    pub async fn exchange(&self, request: ChatRequest) -> Result<ExchangeReply> {
        let session_id = self.resolve_session(request.session_id.as_deref());
        let mut transitions = Transitions::new(&session_id);

        let (_guard, normalized, turns) = self.prepare(&request, &session_id, &mut transitions).await?;

        transitions.advance(ExchangeState::AwaitingUpstream);
        let reply = self
            .provider
            .complete(turns, &normalized.params)
            .await
            .map_err(|e| transitions.failed(e.into()))?;

        transitions.advance(ExchangeState::Emitting);
        self.store
            .append(&session_id, Turn::assistant(reply.clone()))
            .map_err(|e| transitions.failed(e.into()))?;
        transitions.advance(ExchangeState::Persisted);

        info!(
            "Exchange [{}] completed (model: {}): {}",
            session_id,
            normalized.params.model,
            truncate(&reply, 120)
        );

        Ok(ExchangeReply {
            session_id,
            reply,
            model: normalized.params.model,
        })
    }

    /// Run a streaming exchange.
    ///
    /// Failures before the upstream stream opens are returned directly.
    /// After that, fragments are relayed from a background task and the
    /// outcome arrives as the final event. Dropping the returned stream
    /// cancels the exchange without storing a partial reply.
    pub async fn exchange_stream(&self, request: ChatRequest) -> Result<ExchangeEventStream> {
        let session_id = self.resolve_session(request.session_id.as_deref());
        let mut transitions = Transitions::new(&session_id);

        let (guard, normalized, turns) = self.prepare(&request, &session_id, &mut transitions).await?;

        transitions.advance(ExchangeState::AwaitingUpstream);
        let upstream = self
            .provider
            .stream(turns, &normalized.params)
            .await
            .map_err(|e| transitions.failed(e.into()))?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(relay(
            upstream,
            tx,
            Arc::clone(&self.store),
            transitions,
            guard,
        ));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Validate, take the session lock, store the user turn and build the
    /// upstream turn list
    async fn prepare(
        &self,
        request: &ChatRequest,
        session_id: &str,
        transitions: &mut Transitions,
    ) -> Result<(OwnedMutexGuard<()>, NormalizedRequest, Vec<Turn>)> {
        transitions.advance(ExchangeState::Normalizing);
        let normalized = self
            .normalizer
            .normalize(request)
            .map_err(|e| transitions.failed(e.into()))?;

        let guard = self.locks.acquire(session_id).await;
        let turns = self
            .merge_history(session_id, &normalized)
            .map_err(|e| transitions.failed(e))?;
        transitions.advance(ExchangeState::HistoryMerged);

        Ok((guard, normalized, turns))
    }

    /// Upstream turns are request system turns, stored history, then the new
    /// user turn
    fn merge_history(&self, session_id: &str, normalized: &NormalizedRequest) -> Result<Vec<Turn>> {
        let history = self.store.get(session_id)?;
        self.store.append(session_id, normalized.user.clone())?;

        let mut turns = Vec::with_capacity(normalized.system.len() + history.len() + 1);
        turns.extend(normalized.system.iter().cloned());
        turns.extend(history);
        turns.push(normalized.user.clone());
        Ok(turns)
    }
}

/// Forward upstream events to the client and persist the reply on completion
async fn relay(
    mut upstream: FragmentStream,
    tx: mpsc::Sender<ExchangeEvent>,
    store: Arc<dyn SessionStore>,
    mut transitions: Transitions,
    _guard: OwnedMutexGuard<()>,
) {
    let mut reply = String::new();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                transitions.cancelled();
                return;
            }
            next = upstream.next() => next,
        };

        match next {
            Some(StreamEvent::Fragment(text)) => {
                if transitions.state != ExchangeState::Emitting {
                    transitions.advance(ExchangeState::Emitting);
                }
                reply.push_str(&text);
                if tx.send(ExchangeEvent::Fragment(text)).await.is_err() {
                    transitions.cancelled();
                    return;
                }
            }
            Some(StreamEvent::Completed) => {
                if tx.is_closed() {
                    transitions.cancelled();
                    return;
                }
                if transitions.state != ExchangeState::Emitting {
                    transitions.advance(ExchangeState::Emitting);
                }

                let event = match store.append(&transitions.session_id, Turn::assistant(reply.clone())) {
                    Ok(()) => {
                        transitions.advance(ExchangeState::Persisted);
                        info!(
                            "Exchange [{}] streamed: {}",
                            transitions.session_id,
                            truncate(&reply, 120)
                        );
                        ExchangeEvent::Done { reply }
                    }
                    Err(e) => ExchangeEvent::Error(transitions.failed(e.into())),
                };
                let _ = tx.send(event).await;
                return;
            }
            Some(StreamEvent::Faulted(reason)) => {
                let err = transitions.failed(ExchangeError::StreamInterrupted(reason));
                let _ = tx.send(ExchangeEvent::Error(err)).await;
                return;
            }
            None => {
                let err = transitions.failed(ExchangeError::StreamInterrupted(
                    "upstream stream ended without a terminal event".to_string(),
                ));
                let _ = tx.send(ExchangeEvent::Error(err)).await;
                return;
            }
        }
    }
}
