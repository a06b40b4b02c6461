//! Bounded retry with exponential backoff for transient upstream failures

use async_trait::async_trait;
use kai_relay_core::config::UpstreamConfig;
use kai_relay_core::Turn;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::base::{FragmentStream, GenerationParams, ProviderResult, UpstreamError, UpstreamProvider};

/// When and how often to retry
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Timeouts are surfaced immediately unless this is set
    pub retry_on_timeout: bool,
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            retry_on_timeout: config.retry_on_timeout,
        }
    }

    pub fn should_retry(&self, err: &UpstreamError) -> bool {
        match err {
            UpstreamError::Unavailable(_) => true,
            UpstreamError::Timeout(_) => self.retry_on_timeout,
            UpstreamError::Rejected { .. } | UpstreamError::InvalidResponse(_) => false,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && self.should_retry(&err) => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        "Upstream {} failed ({}), retry {}/{} in {:?}",
                        operation, err, attempt, self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            retry_on_timeout: false,
        }
    }
}

/// Provider wrapper applying a [`RetryPolicy`].
///
/// Streams are only retried while opening; once fragments flow, faults are
/// reported through the stream itself.
pub struct RetryingProvider {
    inner: Arc<dyn UpstreamProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn UpstreamProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl UpstreamProvider for RetryingProvider {
    async fn complete(&self, turns: Vec<Turn>, params: &GenerationParams) -> ProviderResult<String> {
        self.policy
            .run("completion", || self.inner.complete(turns.clone(), params))
            .await
    }

    async fn stream(&self, turns: Vec<Turn>, params: &GenerationParams) -> ProviderResult<FragmentStream> {
        self.policy
            .run("stream", || self.inner.stream(turns.clone(), params))
            .await
    }

    fn default_model(&self) -> String {
        self.inner.default_model()
    }
}
