//! Error types
//!
//! Two distinct things live here:
//! - `ErrorCode`: the OCPP-J RPC error codes carried *inside* error envelopes
//! - `OcppError`: Rust-side errors for codec, configuration and connection problems
//!
//! Ordinary send/receive failures are never `OcppError`s. They travel as
//! `SentMessageResult` values or as terminal `PendingRequest` outcomes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OCPP-J RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    /// Local only: no response arrived before the request deadline
    Timeout,
}

impl ErrorCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::Timeout => "Timeout",
        }
    }

    /// Parse a wire name, falling back to `GenericError` for anything unknown
    ///
    /// `Timeout` is never a valid wire code, so a peer sending it gets
    /// `GenericError` like any other unknown name.
    pub fn parse_lenient(s: &str) -> Self {
        match serde_json::from_value(serde_json::Value::String(s.to_string())) {
            Ok(ErrorCode::Timeout) | Err(_) => ErrorCode::GenericError,
            Ok(code) => code,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors in adapter setup, framing and connection handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("At least one signature policy must be configured")]
    NoSignaturePolicy,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport is already running")]
    AlreadyRunning,
}
