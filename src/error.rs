//! Error types for pipequeue operations.
//!
//! Defines error types for every subsystem:
//! - Broker access (Redis or in-process)
//! - Configuration loading and validation
//! - Message envelope validation
//! - Relay loops (inbound, outbound, delayed promotion)
//! - Process supervision
//! - Status aggregation

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while talking to the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Subscription to '{0}' closed by the broker")]
    SubscriptionClosed(String),

    #[error("Received payload is not valid UTF-8: {0}")]
    InvalidPayload(String),

    #[error("Invalid subscription pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Module '{0}' is not defined in the pipeline configuration")]
    UnknownModule(String),

    #[error("Runtime configuration has no 'Default' entry")]
    MissingDefault,

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Errors raised when a received payload is not a valid message envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Payload is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Message carries no application payload")]
    EmptyPayload,

    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Errors that stop a relay loop.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Module '{0}' has no source queue")]
    NoSource(String),
}

/// Errors that can occur in the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn '{runtime_id}': {source}")]
    SpawnFailed {
        runtime_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to kill '{runtime_id}': {source}")]
    KillFailed {
        runtime_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop the status aggregator.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to encode status snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::SubscriptionClosed("events".to_string());
        assert!(err.to_string().contains("events"));

        let err = ConfigError::UnknownModule("Entry".to_string());
        assert!(err.to_string().contains("Entry"));

        let err = EnvelopeError::InvalidField {
            field: "run_at",
            reason: "expected a number".to_string(),
        };
        assert!(err.to_string().contains("run_at"));

        let err = RelayError::NoSource("Entry".to_string());
        assert!(err.to_string().contains("no source"));
    }

    #[test]
    fn test_supervisor_error_keeps_source() {
        let err = SupervisorError::SpawnFailed {
            runtime_id: "Entry_0".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().contains("Entry_0"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
