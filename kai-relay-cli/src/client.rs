use anyhow::Result;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use kai_relay_exchange::ChatRequest;
use kai_relay_server::error::ErrorBody;
use kai_relay_server::handlers::{ChatResponse, HistoryResponse};
use reqwest::{Client, Response, Url};
use serde::Deserialize;

/// HTTP client for a running kai-relay server
pub struct ApiClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct DoneEvent {
    reply: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Send a buffered chat request
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Send a streaming chat request, calling `on_fragment` for each fragment.
    ///
    /// Returns the full reply as confirmed by the server's `done` event.
    pub async fn chat_stream<F>(&self, request: &ChatRequest, mut on_fragment: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let url = format!("{}/chat", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;
        let response = check_status(response).await?;

        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            let event = event?;
            match event.event.as_str() {
                "fragment" => {
                    let text: String = serde_json::from_str(&event.data)?;
                    on_fragment(&text);
                }
                "done" => {
                    let done: DoneEvent = serde_json::from_str(&event.data)?;
                    return Ok(done.reply);
                }
                "error" => anyhow::bail!(describe_error(&event.data)),
                other => tracing::debug!("Ignoring SSE event '{}'", other),
            }
        }

        anyhow::bail!("Stream closed before the reply completed")
    }

    pub async fn history(&self, session_id: &str) -> Result<HistoryResponse> {
        let url = self.history_url(session_id)?;
        let response = check_status(self.client.get(url).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn clear_history(&self, session_id: &str) -> Result<()> {
        let url = self.history_url(session_id)?;
        check_status(self.client.delete(url).send().await?).await?;
        Ok(())
    }

    /// `<base>/history/<session_id>` with the id encoded as one path segment
    fn history_url(&self, session_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Server URL cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .push("history")
            .push(session_id);
        Ok(url)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("Server returned {}: {}", status, describe_error(&body))
}

/// Render a server error payload for the terminal
fn describe_error(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) if err.retryable => format!("{} (retryable): {}", err.kind, err.detail),
        Ok(err) => format!("{}: {}", err.kind, err.detail),
        Err(_) => body.to_string(),
    }
}
