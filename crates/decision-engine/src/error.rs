//! Error types for the decision engine.
//!
//! Only authoring, management and dependency failures are represented here.
//! Problems met while evaluating a request (unknown field, bad pattern,
//! type mismatch) never become an `EngineError`; they are downgraded to a
//! non-match by the evaluator.

use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the decision engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rule, profile or configuration failed authoring-time validation.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Entity already exists and overwrite was not requested.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Rule file or bundle could not be parsed.
    #[error("Failed to parse: {0}")]
    Parse(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backing store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Event bus refused or failed a publish.
    #[error("Publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    /// Threat-intelligence provider failed.
    #[error("Provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    /// Outbound call exceeded its deadline.
    #[error("'{operation}' timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// Imported bundle does not match its checksum.
    #[error("Integrity check failed: expected {expected}, computed {actual}")]
    Integrity { expected: String, actual: String },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error while reading rule or context files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a validation error from a single message.
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::Validation(vec![message.into()])
    }

    /// Creates a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}
