//! # Error Types
//!
//! Custom error types for the telemetry gateway using `thiserror`.

use thiserror::Error;

/// Main error type for the telemetry gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Start request named an operation type that is not registered
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// The flight link is not ready to serve operations
    #[error("Flight link unavailable")]
    LinkUnavailable,

    /// Stop request referenced an operation id that is not running
    #[error("Unknown operation id: {0}")]
    UnknownOperationId(String),

    /// Start request reused the id of a running operation
    #[error("Operation id already running: {0}")]
    DuplicateOperationId(String),

    /// The operation refused to start or faulted while starting
    #[error("Operation failed to start: {0}")]
    OperationStartFailure(String),

    /// Unexpected internal fault raised by an operation instance
    #[error("Operation fault: {0}")]
    OperationFault(String),

    /// Emit attempted while the transport is disconnected
    #[error("Transport unavailable")]
    TransportUnavailable,

    /// Transport-level send or connect failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cumulative disconnect time reached the configured ceiling
    #[error("Transport disconnected for {seconds:.1}s, link considered lost")]
    LinkFatallyLost { seconds: f64 },

    /// The flight link reported a permanent failure
    #[error("Flight link failed permanently")]
    LinkFailed,

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the telemetry gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
