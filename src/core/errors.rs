// src/core/errors.rs

//! Defines the primary error type for the entire application and the stable
//! error codes reported on the wire.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Stable error codes carried in wire-level `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    HandshakeError,
    AccessDenied,
    NotFound,
    Timeout,
    TooManyRequests,
    RoutingError,
    ShortCircuitNotImplemented,
    OutOfBounds,
    InternalError,
}

impl ErrorCode {
    /// The canonical textual form used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::HandshakeError => "HANDSHAKE_ERROR",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::RoutingError => "ROUTING_ERROR",
            ErrorCode::ShortCircuitNotImplemented => "SHORT_CIRCUIT_NOT_IMPLEMENTED",
            ErrorCode::OutOfBounds => "OUT_OF_BOUNDS",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum LatZeroError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Handshake refused: {0}")]
    Handshake(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Too many in-flight requests (limit {0})")]
    TooManyRequests(usize),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Intra-application triggers are not supported")]
    ShortCircuitNotImplemented,

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Locking error: {0}")]
    Locking(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Connection is shutting down")]
    ConnectionClosed,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl LatZeroError {
    /// Maps the error onto the stable code reported on the wire.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LatZeroError::Validation(_)
            | LatZeroError::Protocol(_)
            | LatZeroError::IncompleteData
            | LatZeroError::FrameTooLarge(_) => ErrorCode::ValidationError,
            LatZeroError::Handshake(_) => ErrorCode::HandshakeError,
            LatZeroError::AccessDenied(_) | LatZeroError::Locking(_) => ErrorCode::AccessDenied,
            LatZeroError::NotFound(_) => ErrorCode::NotFound,
            LatZeroError::Timeout(_) => ErrorCode::Timeout,
            LatZeroError::TooManyRequests(_) => ErrorCode::TooManyRequests,
            LatZeroError::Routing(_) | LatZeroError::ConnectionClosed => ErrorCode::RoutingError,
            LatZeroError::ShortCircuitNotImplemented => ErrorCode::ShortCircuitNotImplemented,
            LatZeroError::OutOfBounds(_) => ErrorCode::OutOfBounds,
            LatZeroError::Io(_) | LatZeroError::Persistence(_) | LatZeroError::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// True if the error should tear down the connection rather than be
    /// answered with an `error` message.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            LatZeroError::Io(_) | LatZeroError::FrameTooLarge(_) | LatZeroError::ConnectionClosed
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for LatZeroError {
    fn clone(&self) -> Self {
        match self {
            LatZeroError::Io(e) => LatZeroError::Io(Arc::clone(e)),
            LatZeroError::IncompleteData => LatZeroError::IncompleteData,
            LatZeroError::FrameTooLarge(n) => LatZeroError::FrameTooLarge(*n),
            LatZeroError::Protocol(s) => LatZeroError::Protocol(s.clone()),
            LatZeroError::Validation(s) => LatZeroError::Validation(s.clone()),
            LatZeroError::Handshake(s) => LatZeroError::Handshake(s.clone()),
            LatZeroError::AccessDenied(s) => LatZeroError::AccessDenied(s.clone()),
            LatZeroError::NotFound(s) => LatZeroError::NotFound(s.clone()),
            LatZeroError::Timeout(ms) => LatZeroError::Timeout(*ms),
            LatZeroError::TooManyRequests(n) => LatZeroError::TooManyRequests(*n),
            LatZeroError::Routing(s) => LatZeroError::Routing(s.clone()),
            LatZeroError::ShortCircuitNotImplemented => LatZeroError::ShortCircuitNotImplemented,
            LatZeroError::OutOfBounds(s) => LatZeroError::OutOfBounds(s.clone()),
            LatZeroError::Locking(s) => LatZeroError::Locking(s.clone()),
            LatZeroError::Persistence(s) => LatZeroError::Persistence(s.clone()),
            LatZeroError::ConnectionClosed => LatZeroError::ConnectionClosed,
            LatZeroError::Internal(s) => LatZeroError::Internal(s.clone()),
        }
    }
}

impl PartialEq for LatZeroError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LatZeroError::Io(e1), LatZeroError::Io(e2)) => e1.to_string() == e2.to_string(),
            (LatZeroError::Protocol(a), LatZeroError::Protocol(b)) => a == b,
            (LatZeroError::Validation(a), LatZeroError::Validation(b)) => a == b,
            (LatZeroError::Handshake(a), LatZeroError::Handshake(b)) => a == b,
            (LatZeroError::AccessDenied(a), LatZeroError::AccessDenied(b)) => a == b,
            (LatZeroError::NotFound(a), LatZeroError::NotFound(b)) => a == b,
            (LatZeroError::Timeout(a), LatZeroError::Timeout(b)) => a == b,
            (LatZeroError::TooManyRequests(a), LatZeroError::TooManyRequests(b)) => a == b,
            (LatZeroError::Routing(a), LatZeroError::Routing(b)) => a == b,
            (LatZeroError::OutOfBounds(a), LatZeroError::OutOfBounds(b)) => a == b,
            (LatZeroError::Locking(a), LatZeroError::Locking(b)) => a == b,
            (LatZeroError::Persistence(a), LatZeroError::Persistence(b)) => a == b,
            (LatZeroError::Internal(a), LatZeroError::Internal(b)) => a == b,
            (LatZeroError::FrameTooLarge(a), LatZeroError::FrameTooLarge(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for LatZeroError {
    fn from(e: std::io::Error) -> Self {
        LatZeroError::Io(Arc::new(e))
    }
}

impl From<uuid::Error> for LatZeroError {
    fn from(e: uuid::Error) -> Self {
        LatZeroError::Validation(format!("invalid UUID: {e}"))
    }
}

impl From<std::str::Utf8Error> for LatZeroError {
    fn from(e: std::str::Utf8Error) -> Self {
        LatZeroError::Protocol(format!("payload is not valid UTF-8: {e}"))
    }
}

impl From<serde_json::Error> for LatZeroError {
    fn from(e: serde_json::Error) -> Self {
        LatZeroError::Protocol(format!("malformed JSON payload: {e}"))
    }
}
