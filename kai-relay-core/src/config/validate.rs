//! Configuration validation rules.

use super::schema::Config;

/// Largest `max_tokens` a request or the configured default may ask for
pub const MAX_TOKENS_LIMIT: u32 = 32_768;

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    let api_base = config.upstream.api_base.trim();
    if api_base.is_empty() {
        errors.push("upstream.api_base must not be empty".to_string());
    } else if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
        errors.push("upstream.api_base must start with http:// or https://".to_string());
    }
    if config.upstream.model.trim().is_empty() {
        errors.push("upstream.model must not be empty".to_string());
    }
    if config.upstream.request_timeout_secs == 0 {
        errors.push("upstream.request_timeout_secs must be > 0".to_string());
    }
    if config.upstream.initial_backoff_ms > config.upstream.max_backoff_ms {
        errors.push("upstream.initial_backoff_ms must not exceed upstream.max_backoff_ms".to_string());
    }

    if !(0.0..=2.0).contains(&config.generation.temperature) {
        errors.push("generation.temperature must be in [0.0, 2.0]".to_string());
    }
    if !(1..=MAX_TOKENS_LIMIT).contains(&config.generation.max_tokens) {
        errors.push(format!(
            "generation.max_tokens must be in [1, {}]",
            MAX_TOKENS_LIMIT
        ));
    }

    if config.session.default_key.trim().is_empty() {
        errors.push("session.default_key must not be empty".to_string());
    }
    if config.session.dir.trim().is_empty() {
        errors.push("session.dir must not be empty".to_string());
    }

    if config.server.port == 0 {
        errors.push("server.port must be > 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}
