use super::models::{Config, PollConfig};
use thiserror::Error;

/// Upper bound for the transient retry counts
pub const MAX_RETRIES: u32 = 10;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    ZeroConcurrency { field: String },

    #[error("http.concurrency_backoff must contain at least one delay")]
    EmptyConcurrencyBackoff,

    #[error("{section}.factor must be >= 1.0, got {factor}")]
    ShrinkingPollFactor { section: String, factor: f64 },

    #[error("{section}.max_delay ({max_ms}ms) is below initial_delay ({initial_ms}ms)")]
    PollCapBelowStart {
        section: String,
        initial_ms: u64,
        max_ms: u64,
    },

    #[error("resources.max_resource_bytes must be positive")]
    InvalidMaxResourceBytes,

    #[error("{field} must be at most {max}, got {value}")]
    TooManyRetries { field: String, value: u32, max: u32 },

    #[error("Invalid server url '{url}': {reason}")]
    InvalidServerUrl { url: String, reason: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_server(config)?;
    validate_http(config)?;
    validate_render(config)?;
    validate_resources(config)?;
    Ok(())
}

fn validate_server(config: &Config) -> Result<(), ValidationError> {
    let url = url::Url::parse(&config.server.url).map_err(|e| ValidationError::InvalidServerUrl {
        url: config.server.url.clone(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::InvalidServerUrl {
            url: config.server.url.clone(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    Ok(())
}

fn validate_retries(field: &str, value: u32) -> Result<(), ValidationError> {
    if value > MAX_RETRIES {
        return Err(ValidationError::TooManyRetries {
            field: field.to_string(),
            value,
            max: MAX_RETRIES,
        });
    }
    Ok(())
}

fn validate_http(config: &Config) -> Result<(), ValidationError> {
    validate_retries("http.max_retries", config.http.max_retries)?;
    if config.http.concurrency_backoff.is_empty() {
        return Err(ValidationError::EmptyConcurrencyBackoff);
    }
    validate_poll("http.long_task", &config.http.long_task)
}

fn validate_render(config: &Config) -> Result<(), ValidationError> {
    if config.render.concurrency == 0 {
        return Err(ValidationError::ZeroConcurrency {
            field: "render.concurrency".to_string(),
        });
    }
    if config.render.session_concurrency == 0 {
        return Err(ValidationError::ZeroConcurrency {
            field: "render.session_concurrency".to_string(),
        });
    }
    validate_poll("render.poll", &config.render.poll)
}

fn validate_poll(section: &str, poll: &PollConfig) -> Result<(), ValidationError> {
    if poll.factor < 1.0 || !poll.factor.is_finite() {
        return Err(ValidationError::ShrinkingPollFactor {
            section: section.to_string(),
            factor: poll.factor,
        });
    }

    if poll.max_delay < poll.initial_delay {
        return Err(ValidationError::PollCapBelowStart {
            section: section.to_string(),
            initial_ms: poll.initial_delay.as_millis(),
            max_ms: poll.max_delay.as_millis(),
        });
    }

    Ok(())
}

fn validate_resources(config: &Config) -> Result<(), ValidationError> {
    if config.resources.max_resource_bytes.as_u64() == 0 {
        return Err(ValidationError::InvalidMaxResourceBytes);
    }
    validate_retries("resources.max_retries", config.resources.max_retries)
}
