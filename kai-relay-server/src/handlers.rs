use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::StreamExt;
use kai_relay_core::Turn;
use kai_relay_exchange::{ChatRequest, ExchangeEvent};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

use crate::error::{ApiError, ErrorBody};
use crate::state::AppState;

/// Buffered reply to `POST /chat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub ok: bool,
    pub reply: String,
    pub session_id: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub turns: Vec<Turn>,
}

pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if payload.stream {
        let events = state.controller.exchange_stream(payload).await?;
        let stream = events.map(|event| Ok::<_, Infallible>(sse_event(event)));
        return Ok(Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let reply = state.controller.exchange(payload).await?;
    Ok(Json(ChatResponse {
        ok: true,
        reply: reply.reply,
        session_id: reply.session_id,
        model: reply.model,
    })
    .into_response())
}

/// Every event carries JSON data, so fragment text with line breaks or
/// carriage returns stays on a single `data:` line.
fn sse_event(event: ExchangeEvent) -> Event {
    let built = match &event {
        ExchangeEvent::Fragment(text) => Event::default().event("fragment").json_data(text),
        ExchangeEvent::Done { reply } => Event::default()
            .event("done")
            .json_data(serde_json::json!({ "reply": reply })),
        ExchangeEvent::Error(err) => Event::default()
            .event("error")
            .json_data(ErrorBody::from(err)),
    };

    built.unwrap_or_else(|e| {
        tracing::error!("Failed to encode SSE event: {}", e);
        Event::default()
            .event("error")
            .data(r#"{"ok":false,"kind":"stream_interrupted","retryable":true,"detail":"event encoding failed"}"#)
    })
}

pub async fn get_history_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let turns = state.history.read(&session_id)?;
    Ok(Json(HistoryResponse { session_id, turns }))
}

pub async fn clear_history_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.history.clear(&session_id)?;
    Ok(Json(serde_json::json!({ "ok": true, "session_id": session_id })))
}

pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
