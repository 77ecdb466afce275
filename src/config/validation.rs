//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (worker count, limits, intervals > 0)
//! - Check the bind address parses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ServerConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener.bind_address `{0}` is not a socket address")]
    BindAddress(String),
    #[error("listener.workers must be at least 1")]
    NoWorkers,
    #[error("listener.max_connections must be at least 1")]
    NoConnections,
    #[error("listener.backlog must be positive")]
    Backlog,
    #[error("protocol.max_head_size must be positive")]
    HeadSize,
    #[error("protocol.pipeline_depth must be at least 1")]
    PipelineDepth,
    #[error("reaper.check_interval_secs must be positive")]
    ReaperInterval,
    #[error("reaper.idle_timeout_secs must be positive")]
    IdleTimeout,
}

/// Validate a configuration, collecting every problem.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }
    if config.listener.workers == 0 {
        errors.push(ValidationError::NoWorkers);
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::NoConnections);
    }
    if config.listener.backlog <= 0 {
        errors.push(ValidationError::Backlog);
    }
    if config.protocol.max_head_size == 0 {
        errors.push(ValidationError::HeadSize);
    }
    if config.protocol.pipeline_depth == 0 {
        errors.push(ValidationError::PipelineDepth);
    }
    if config.reaper.enabled {
        if config.reaper.check_interval_secs == 0 {
            errors.push(ValidationError::ReaperInterval);
        }
        if config.reaper.idle_timeout_secs == 0 {
            errors.push(ValidationError::IdleTimeout);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
