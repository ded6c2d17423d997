//! Configuration management for visualgrid
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use visualgrid::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Render concurrency: {}", config.render.concurrency);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `VISUALGRID__<section>__<key>`
//!
//! Examples:
//! - `VISUALGRID__SERVER__URL=https://eyes.example.com`
//! - `VISUALGRID__RENDER__CONCURRENCY=10`
//! - `VISUALGRID__MATCHING__RETRY_TIMEOUT=5s`
//!
//! The API key is only read from `VISUALGRID_API_KEY` (or `APPLITOOLS_API_KEY`).
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/visualgrid.toml`.
//! This can be overridden using the `VISUALGRID_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::{ByteSize, HumanDuration};
pub use models::{
    Config, HttpConfig, MatchConfig, PollConfig, RenderConfig, ResourcesConfig, ServerConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or a value
    /// fails validation (zero concurrency, empty backoff schedule, ...).
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let mut config = sources::load_from_sources(path)?;
        sources::load_secrets(&mut config);
        validation::validate(&config)?;
        Ok(config)
    }
}
