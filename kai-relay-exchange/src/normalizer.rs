//! Request validation and defaulting

use kai_relay_core::config::validate::MAX_TOKENS_LIMIT;
use kai_relay_core::config::Config;
use kai_relay_core::{Role, Turn};
use kai_relay_providers::GenerationParams;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use crate::error::ValidationError;

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=2.0;
pub const MAX_TOKENS_RANGE: RangeInclusive<i64> = 1..=MAX_TOKENS_LIMIT as i64;

/// Message as sent by the client, before role parsing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl RawMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Body of a chat request.
///
/// Numeric fields are accepted wide so out-of-range values are reported as
/// validation failures instead of deserialization errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Single user message with every other field defaulted
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            messages: vec![RawMessage::new("user", content)],
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// A validated request ready to be merged with history
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    /// Request-scoped system turns, sent upstream but never stored
    pub system: Vec<Turn>,
    /// The new user prompt
    pub user: Turn,
    pub params: GenerationParams,
}

/// Applies configured defaults and bounds to incoming requests
#[derive(Debug, Clone, PartialEq)]
pub struct Normalizer {
    default_model: String,
    default_temperature: f32,
    default_max_tokens: u32,
}

impl Normalizer {
    pub fn new(
        default_model: impl Into<String>,
        default_temperature: f32,
        default_max_tokens: u32,
    ) -> Self {
        Self {
            default_model: default_model.into(),
            default_temperature,
            default_max_tokens,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.upstream.model.clone(),
            config.generation.temperature,
            config.generation.max_tokens,
        )
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Validate `request` and resolve its generation parameters.
    ///
    /// The last user message becomes the prompt. Earlier user and assistant
    /// messages are dropped since stored history is authoritative.
    pub fn normalize(&self, request: &ChatRequest) -> Result<NormalizedRequest, ValidationError> {
        if request.messages.is_empty() {
            return Err(ValidationError::new("messages must not be empty"));
        }

        let mut system = Vec::new();
        let mut prompt: Option<&str> = None;
        for (index, message) in request.messages.iter().enumerate() {
            let role: Role = message
                .role
                .parse()
                .map_err(|e| ValidationError::new(format!("messages[{}]: {}", index, e)))?;
            match role {
                Role::System => system.push(Turn::system(message.content.clone())),
                Role::User => prompt = Some(&message.content),
                Role::Assistant => {}
            }
        }

        let prompt = prompt.ok_or_else(|| ValidationError::new("no user message"))?;
        if prompt.trim().is_empty() {
            return Err(ValidationError::new("user message must not be empty"));
        }

        let params = GenerationParams {
            model: self.resolve_model(request.model.as_deref()),
            temperature: self.resolve_temperature(request.temperature)?,
            max_tokens: self.resolve_max_tokens(request.max_tokens)?,
        };

        Ok(NormalizedRequest {
            system,
            user: Turn::user(prompt),
            params,
        })
    }

    fn resolve_model(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            Some(model) if !model.is_empty() => model.to_string(),
            _ => self.default_model.clone(),
        }
    }

    fn resolve_temperature(&self, requested: Option<f64>) -> Result<f32, ValidationError> {
        match requested {
            None => Ok(self.default_temperature),
            Some(t) if TEMPERATURE_RANGE.contains(&t) => Ok(t as f32),
            Some(t) => Err(ValidationError::new(format!(
                "temperature {} outside [{}, {}]",
                t,
                TEMPERATURE_RANGE.start(),
                TEMPERATURE_RANGE.end()
            ))),
        }
    }

    fn resolve_max_tokens(&self, requested: Option<i64>) -> Result<u32, ValidationError> {
        match requested {
            None => Ok(self.default_max_tokens),
            Some(n) if MAX_TOKENS_RANGE.contains(&n) => u32::try_from(n)
                .map_err(|_| ValidationError::new(format!("max_tokens {} out of range", n))),
            Some(n) => Err(ValidationError::new(format!(
                "max_tokens {} outside [{}, {}]",
                n,
                MAX_TOKENS_RANGE.start(),
                MAX_TOKENS_RANGE.end()
            ))),
        }
    }
}
