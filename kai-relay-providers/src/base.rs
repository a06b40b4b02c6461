//! Upstream provider contract

use async_trait::async_trait;
use futures::stream::{self, Stream};
use kai_relay_core::Turn;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;

/// Failure of an upstream call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// The provider did not answer within the configured deadline
    #[error("Upstream timed out: {0}")]
    Timeout(String),

    /// The provider refused the request (4xx: bad model, quota, ...)
    #[error("Upstream rejected request (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// Network failure or 5xx
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// The provider answered 2xx with a body we cannot use
    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            408 | 504 => UpstreamError::Timeout(format!("HTTP {}: {}", status, detail)),
            400..=499 => UpstreamError::Rejected { status, detail },
            _ => UpstreamError::Unavailable(format!("HTTP {}: {}", status, detail)),
        }
    }

    /// Whether the client may reasonably retry the same request later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamError::Timeout(_) | UpstreamError::Unavailable(_) | UpstreamError::InvalidResponse(_)
        )
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            UpstreamError::from_status(status.as_u16(), e.to_string())
        } else if e.is_decode() {
            UpstreamError::InvalidResponse(e.to_string())
        } else {
            UpstreamError::Unavailable(e.to_string())
        }
    }
}

pub type ProviderResult<T> = Result<T, UpstreamError>;

/// Generation parameters for one exchange, already defaulted and bounds-checked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One item of a streamed reply.
///
/// A stream yields zero or more fragments followed by exactly one terminal
/// event (`Completed` or `Faulted`), after which it ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Incremental assistant text
    Fragment(String),
    /// The provider signalled the end of the reply
    Completed,
    /// The stream broke before the completion marker
    Faulted(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Fragment(_))
    }
}

/// Lazy, finite, non-restartable sequence of stream events
pub type FragmentStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Trait for upstream model providers
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Request a complete reply for `turns`
    async fn complete(&self, turns: Vec<Turn>, params: &GenerationParams) -> ProviderResult<String>;

    /// Request a streamed reply for `turns`.
    ///
    /// Errors returned here happen before any fragment was produced. Faults
    /// after that point arrive as [`StreamEvent::Faulted`].
    ///
    /// Default behavior falls back to `complete` and emits a single fragment.
    async fn stream(&self, turns: Vec<Turn>, params: &GenerationParams) -> ProviderResult<FragmentStream> {
        let content = self.complete(turns, params).await?;

        let mut events = Vec::with_capacity(2);
        if !content.is_empty() {
            events.push(StreamEvent::Fragment(content));
        }
        events.push(StreamEvent::Completed);

        Ok(Box::pin(stream::iter(events)))
    }

    /// Model used when a request does not name one
    fn default_model(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Fixed(&'static str);

    #[async_trait]
    impl UpstreamProvider for Fixed {
        async fn complete(&self, _turns: Vec<Turn>, _params: &GenerationParams) -> ProviderResult<String> {
            Ok(self.0.to_string())
        }

        fn default_model(&self) -> String {
            "fixed".to_string()
        }
    }

    fn params() -> GenerationParams {
        GenerationParams {
            model: "fixed".to_string(),
            temperature: 0.0,
            max_tokens: 16,
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            UpstreamError::from_status(404, "no such model"),
            UpstreamError::Rejected { status: 404, .. }
        ));
        assert!(matches!(
            UpstreamError::from_status(429, "quota"),
            UpstreamError::Rejected { status: 429, .. }
        ));
        assert!(matches!(UpstreamError::from_status(504, ""), UpstreamError::Timeout(_)));
        assert!(matches!(UpstreamError::from_status(502, ""), UpstreamError::Unavailable(_)));
    }

    #[test]
    fn test_transient_errors() {
        assert!(UpstreamError::Timeout("slow".into()).is_transient());
        assert!(UpstreamError::Unavailable("down".into()).is_transient());
        assert!(!UpstreamError::Rejected {
            status: 400,
            detail: "bad".into()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn test_default_stream_falls_back_to_complete() {
        let provider = Fixed("whole reply");
        let events: Vec<_> = provider
            .stream(vec![Turn::user("hi")], &params())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Fragment("whole reply".to_string()),
                StreamEvent::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_default_stream_skips_empty_fragment() {
        let provider = Fixed("");
        let events: Vec<_> = provider
            .stream(vec![Turn::user("hi")], &params())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events, vec![StreamEvent::Completed]);
    }
}
