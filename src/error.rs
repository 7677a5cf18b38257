//! Error types for reply-relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw inbound payload that could not be turned into an update.
#[derive(Debug, thiserror::Error)]
#[error("Malformed update {sequence}: {reason}")]
pub struct DecodeError {
    pub sequence: i64,
    pub reason: String,
}

/// Failures raised while routing a decoded update.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Routing timed out after {0:?}")]
    Timeout(Duration),

    #[error("Routing failed: {0}")]
    Failed(String),

    #[error("Routing reply failed: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Error returned by a single call to the generation service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Generation request failed: {0}")]
    RequestFailed(String),

    #[error("Generation service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response from generation service: {0}")]
    InvalidResponse(String),
}

/// Generation failures, per attempt (`Timeout`, `Service`) or terminal (`Failure`).
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Generation failed after {attempts} attempts: {last}")]
    Failure {
        attempts: u32,
        last: Box<GenerationError>,
    },
}

impl GenerationError {
    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Service(_) => "service_error",
            Self::Failure { .. } => "failure",
        }
    }

    /// Whether another attempt may be issued after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Service(_))
    }
}

/// The output sink rejected a send.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to send to chat {chat_id}: {reason}")]
    SendFailed { chat_id: i64, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{call} timed out after {after:?}")]
    Timeout { call: &'static str, after: Duration },
}

/// Pipeline lifecycle misuse.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Pipeline cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
