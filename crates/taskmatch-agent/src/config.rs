//! Agent configuration.
//!
//! Timing settings come from an optional TOML file. Any section or key left
//! out keeps its default. The merged result is validated before use.

use std::path::Path;

use thiserror::Error;

use taskmatch_realtime::{InvalidConfig, RealtimeConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(#[from] InvalidConfig),
}

/// Load settings from `path`, or defaults when no file is given.
pub fn load(path: Option<&Path>) -> Result<RealtimeConfig, ConfigError> {
    match path {
        Some(path) => parse(&std::fs::read_to_string(path)?),
        None => Ok(RealtimeConfig::default()),
    }
}

pub fn parse(content: &str) -> Result<RealtimeConfig, ConfigError> {
    let config: RealtimeConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}
