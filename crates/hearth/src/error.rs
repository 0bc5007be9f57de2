//! # Framework Errors
//!
//! Centralized error definitions for the actor framework. Every failure a
//! caller can observe is either a [`HearthError`] (on the Rust API surface)
//! or an [`ErrorEnvelope`] (on the wire, inside a non-2xx [`Response`]).
//!
//! The taxonomy follows the framework's failure classes: routing, storage,
//! lock, alarm, and socket failures each get their own variants so call
//! sites can decide what is recoverable. Internal causes are logged at the
//! failure site; envelopes carry only an opaque code and a short
//! description, never raw internals.
//!
//! [`Response`]: crate::request::Response

use serde::{Deserialize, Serialize};

/// Errors produced by the framework itself.
#[derive(Debug, thiserror::Error)]
pub enum HearthError {
    /// The instance's mailbox is closed (hibernated or crashed).
    #[error("Instance closed")]
    InstanceClosed,
    /// The instance dropped the response channel mid-request.
    #[error("Instance dropped response channel")]
    InstanceDropped,
    /// A route table failed validation at spawn time. This is a programming
    /// error in the actor definition, surfaced before any request is served.
    #[error("Invalid route table: {0}")]
    BadRoute(String),
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Alarm scheduling failed. Recoverable: callers re-arm on the next
    /// invocation rather than treating the instance as dead.
    #[error("Alarm scheduling failed: {0}")]
    AlarmSchedule(String),
    /// A single-flight execution failed; shared with every waiter that
    /// coalesced onto the same key.
    #[error("Locked operation '{key}' failed: {message}")]
    LockFailed { key: String, message: String },
    #[error("Socket connection closed")]
    SocketClosed,
    /// A remote instance answered with a non-success status.
    #[error("Instance answered {status}: {code}: {description}")]
    RemoteStatus {
        status: u16,
        code: String,
        description: String,
    },
    /// A response body did not match the caller's expected shape.
    #[error("Response shape mismatch: {0}")]
    ResponseShape(String),
    /// A handler failed for a reason that has no dedicated variant.
    #[error("Handler error: {0}")]
    Handler(String),
}

impl HearthError {
    /// Opaque code used in error envelopes. Codes are stable identifiers,
    /// not explanations; the full cause stays in the instance log.
    pub fn error_code(&self) -> &'static str {
        match self {
            HearthError::InstanceClosed => "instance_closed",
            HearthError::InstanceDropped => "instance_dropped",
            HearthError::BadRoute(_) => "bad_route",
            HearthError::Storage(_) => "storage_error",
            HearthError::Json(_) => "invalid_json",
            HearthError::AlarmSchedule(_) => "alarm_error",
            HearthError::LockFailed { .. } => "lock_error",
            HearthError::SocketClosed => "socket_closed",
            HearthError::RemoteStatus { .. } => "remote_error",
            HearthError::ResponseShape(_) => "response_shape",
            HearthError::Handler(_) => "handler_error",
        }
    }
}

/// Wire shape of every failure response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub error_code: String,
    pub error_description: String,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error_code: code.into(),
            error_description: description.into(),
        }
    }
}
