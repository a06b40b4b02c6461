//! Upstream model provider integrations for kai-relay
//!
//! The [`UpstreamProvider`] trait is the only thing the exchange logic knows
//! about the model provider. [`OpenAiCompatClient`] talks to any endpoint
//! implementing the OpenAI chat completions protocol, and
//! [`RetryingProvider`] adds bounded retries for transient failures.

pub mod base;
pub mod openai;
pub mod retry;

pub use base::{
    FragmentStream, GenerationParams, ProviderResult, StreamEvent, UpstreamError,
    UpstreamProvider,
};
pub use openai::OpenAiCompatClient;
pub use retry::{RetryPolicy, RetryingProvider};
