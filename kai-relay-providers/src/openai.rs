//! OpenAI-compatible chat completions client

use async_trait::async_trait;
use kai_relay_core::config::UpstreamConfig;
use kai_relay_core::{Role, Turn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::base::{
    FragmentStream, GenerationParams, ProviderResult, StreamEvent, UpstreamError,
    UpstreamProvider,
};

/// Events buffered between the reader task and the consumer
const STREAM_BUFFER: usize = 32;

/// Chat completion request body
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: String,
}

impl From<Turn> for WireMessage {
    fn from(turn: Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.content,
        }
    }
}

/// Chat completion response body
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any endpoint speaking the OpenAI chat completions protocol
pub struct OpenAiCompatClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    extra_headers: HashMap<String, String>,
    timeout: Duration,
}

impl OpenAiCompatClient {
    /// Create a new client
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        extra_headers: Option<HashMap<String, String>>,
        timeout: Duration,
    ) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self {
            client: Client::builder()
                .http1_only() // Some local servers mishandle HTTP/2 upgrades
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_base,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            default_model: default_model.into(),
            extra_headers: extra_headers.unwrap_or_default(),
            timeout,
        }
    }

    /// Create a client from the upstream section of the configuration
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(
            config.api_base.clone(),
            Some(config.api_key.clone()),
            config.model.clone(),
            Some(config.extra_headers.clone()),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn apply_headers(&self, mut req_builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        for (key, value) in &self.extra_headers {
            req_builder = req_builder.header(key, value);
        }

        req_builder
    }

    fn build_request<'a>(
        &self,
        turns: Vec<Turn>,
        params: &'a GenerationParams,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &params.model,
            messages: turns.into_iter().map(WireMessage::from).collect(),
            stream: stream.then_some(true),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        }
    }

    async fn check_status(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(UpstreamError::from_status(status.as_u16(), error_text))
    }

    fn parse_response(response: ChatCompletionResponse) -> ProviderResult<String> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::InvalidResponse("No choices in response".to_string()))?;
        Ok(choice.message.content.unwrap_or_default())
    }

    /// Read the SSE body, forwarding fragments until `[DONE]`, a fault, or the
    /// consumer going away.
    async fn pump_stream(
        mut response: reqwest::Response,
        tx: mpsc::Sender<StreamEvent>,
        idle_timeout: Duration,
    ) {
        let mut decoder = SseDecoder::default();

        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    debug!("Stream consumer dropped, closing upstream stream");
                    return;
                }
                next = tokio::time::timeout(idle_timeout, response.chunk()) => next,
            };
            let chunk = match next {
                Ok(Ok(Some(bytes))) => bytes,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    warn!("Upstream stream transport error: {}", err);
                    let _ = tx.send(StreamEvent::Faulted(err.to_string())).await;
                    return;
                }
                Err(_) => {
                    warn!("Upstream stream idle for {:?}", idle_timeout);
                    let _ = tx
                        .send(StreamEvent::Faulted(format!(
                            "no data from upstream for {:?}",
                            idle_timeout
                        )))
                        .await;
                    return;
                }
            };

            for payload in decoder.push(&chunk) {
                if payload == "[DONE]" {
                    let _ = tx.send(StreamEvent::Completed).await;
                    return;
                }

                let parsed = match serde_json::from_str::<StreamChunk>(&payload) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx
                            .send(StreamEvent::Faulted(format!("malformed stream chunk: {}", err)))
                            .await;
                        return;
                    }
                };

                let delta = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .filter(|text| !text.is_empty());
                if let Some(text) = delta {
                    if tx.send(StreamEvent::Fragment(text)).await.is_err() {
                        debug!("Stream consumer dropped, closing upstream stream");
                        return;
                    }
                }
            }
        }

        let _ = tx
            .send(StreamEvent::Faulted(
                "stream ended before completion marker".to_string(),
            ))
            .await;
    }
}

#[async_trait]
impl UpstreamProvider for OpenAiCompatClient {
    async fn complete(&self, turns: Vec<Turn>, params: &GenerationParams) -> ProviderResult<String> {
        let request = self.build_request(turns, params, false);

        debug!(
            "Sending chat request to {} with model {}",
            self.api_base, params.model
        );

        let req_builder = self
            .apply_headers(self.client.post(self.endpoint()).json(&request))
            .timeout(self.timeout);
        let response = Self::check_status(req_builder.send().await?).await?;

        let response_data: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| match UpstreamError::from(e) {
                UpstreamError::Unavailable(detail) => UpstreamError::InvalidResponse(detail),
                other => other,
            })?;
        Self::parse_response(response_data)
    }

    async fn stream(&self, turns: Vec<Turn>, params: &GenerationParams) -> ProviderResult<FragmentStream> {
        let request = self.build_request(turns, params, true);

        debug!(
            "Sending streaming chat request to {} with model {}",
            self.api_base, params.model
        );

        let req_builder = self.apply_headers(self.client.post(self.endpoint()).json(&request));
        let response = tokio::time::timeout(self.timeout, req_builder.send())
            .await
            .map_err(|_| {
                UpstreamError::Timeout(format!("no response headers within {:?}", self.timeout))
            })??;
        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(Self::pump_stream(response, tx, self.timeout));

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    fn default_model(&self) -> String {
        self.default_model.clone()
    }
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes are buffered until a blank line closes an event, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed bytes and return the `data` payload of every completed event
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some((end, sep_len)) = find_event_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            let raw = String::from_utf8_lossy(&raw);

            let data_lines: Vec<&str> = raw
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim)
                .collect();

            if !data_lines.is_empty() {
                events.push(data_lines.join("\n"));
            }
        }
        events
    }
}

/// Position and length of the first blank-line separator (`\n\n` or `\r\n\r\n`)
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
