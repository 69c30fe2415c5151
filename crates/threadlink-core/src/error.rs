//! Error types for threadlink.
//!
//! Every failure that can cross a context boundary has a stable `code()` so a
//! rejected response can be matched by kind on the calling side, not only by
//! its human-readable message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Main error type for threadlink.
#[derive(Debug, Error)]
pub enum ThreadsError {
    // Construction errors
    #[error("type \"{kind}\" not recognized, must be: 'window', 'worker' or 'sharedworker'")]
    UnknownContextKind { kind: String },

    #[error("iframes can't be spawned from workers")]
    CannotSpawnWindowFromWorker,

    #[error("no context script registered for \"{src}\"")]
    ScriptNotFound { src: String },

    // Discovery errors
    #[error("Request to get service \"{name}\" timed out")]
    ServiceDiscoveryTimeout { name: String },

    // Dispatch errors
    #[error("method \"{name}\" doesn't exist")]
    MethodNotFound { name: String },

    #[error("stream \"{name}\" doesn't exist")]
    StreamNotFound { name: String },

    #[error("unknown request type: \"{kind}\"")]
    UnknownRequestType { kind: String },

    #[error("client \"{client}\" is not connected")]
    ClientNotConnected { client: String },

    // Contract errors
    #[error("method \"{name}\" not defined in the contract")]
    MethodNotInContract { name: String },

    #[error("expected method \"{name}\" to be called with {expected} arguments, got {actual}")]
    ArityMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument {position} of \"{name}\" should be {expected}, got {actual}")]
    ArgumentTypeMismatch {
        name: String,
        position: usize,
        expected: String,
        actual: String,
    },

    // Lifecycle errors
    #[error("Service \"{name}\" already defined")]
    DuplicateServiceName { name: String },

    #[error("Unknown connection type: \"{kind}\"")]
    UnknownConnectionKind { kind: String },

    // Stream errors
    #[error("Can't {action} on current state: {state}")]
    InvalidStreamTransition { action: String, state: String },

    #[error("service should implement stream.cancel()")]
    CancelNotImplemented,

    #[error("stream aborted: {reason}")]
    StreamAborted { reason: Value },

    // Transport errors
    #[error("channel \"{channel}\" is closed")]
    ChannelClosed { channel: String },

    #[error("endpoint went away before responding")]
    Disconnected,

    /// A rejection received from another context.
    #[error("{reason}")]
    Remote { code: Option<String>, reason: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for threadlink operations.
pub type Result<T> = std::result::Result<T, ThreadsError>;

impl From<serde_json::Error> for ThreadsError {
    fn from(err: serde_json::Error) -> Self {
        ThreadsError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ThreadsError {
    /// Stable name of the error kind, carried on the wire next to the reason.
    ///
    /// A `Remote` error reports the code it was received with.
    pub fn code(&self) -> Option<&str> {
        let code = match self {
            ThreadsError::UnknownContextKind { .. } => "UnknownContextKind",
            ThreadsError::CannotSpawnWindowFromWorker => "CannotSpawnWindowFromWorker",
            ThreadsError::ScriptNotFound { .. } => "ScriptNotFound",
            ThreadsError::ServiceDiscoveryTimeout { .. } => "ServiceDiscoveryTimeout",
            ThreadsError::MethodNotFound { .. } => "MethodNotFound",
            ThreadsError::StreamNotFound { .. } => "StreamNotFound",
            ThreadsError::UnknownRequestType { .. } => "UnknownRequestType",
            ThreadsError::ClientNotConnected { .. } => "ClientNotConnected",
            ThreadsError::MethodNotInContract { .. } => "MethodNotInContract",
            ThreadsError::ArityMismatch { .. } => "ArityMismatch",
            ThreadsError::ArgumentTypeMismatch { .. } => "ArgumentTypeMismatch",
            ThreadsError::DuplicateServiceName { .. } => "DuplicateServiceName",
            ThreadsError::UnknownConnectionKind { .. } => "UnknownConnectionKind",
            ThreadsError::InvalidStreamTransition { .. } => "InvalidStreamTransition",
            ThreadsError::CancelNotImplemented => "CancelNotImplemented",
            ThreadsError::StreamAborted { .. } => "StreamAborted",
            ThreadsError::ChannelClosed { .. } => "ChannelClosed",
            ThreadsError::Disconnected => "Disconnected",
            ThreadsError::Remote { code, .. } => return code.as_deref(),
            ThreadsError::Json { .. } => "Json",
            ThreadsError::Other(_) => return None,
        };
        Some(code)
    }

    /// Check whether this error (or the remote error it wraps) is of the given kind.
    pub fn is(&self, code: &str) -> bool {
        self.code() == Some(code)
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Discovery/transport error
    /// - -32001: Stream aborted or cancelled
    /// - -32002: Lifecycle error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self.code() {
            Some("MethodNotFound")
            | Some("StreamNotFound")
            | Some("UnknownRequestType")
            | Some("MethodNotInContract") => -32601,

            Some("ArityMismatch") | Some("ArgumentTypeMismatch") => -32602,

            Some("ServiceDiscoveryTimeout")
            | Some("ScriptNotFound")
            | Some("ChannelClosed")
            | Some("Disconnected")
            | Some("ClientNotConnected") => -32000,

            Some("StreamAborted")
            | Some("InvalidStreamTransition")
            | Some("CancelNotImplemented") => -32001,

            Some("DuplicateServiceName")
            | Some("UnknownConnectionKind")
            | Some("UnknownContextKind")
            | Some("CannotSpawnWindowFromWorker") => -32002,

            // All other errors are internal errors
            _ => -32603,
        }
    }
}

/// Cloneable snapshot of a failure, as it travels inside a rejected response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub reason: String,
}

impl From<&ThreadsError> for Rejection {
    fn from(err: &ThreadsError) -> Self {
        Rejection {
            code: err.code().map(str::to_string),
            reason: err.to_string(),
        }
    }
}

impl From<Rejection> for ThreadsError {
    fn from(rejection: Rejection) -> Self {
        ThreadsError::Remote {
            code: rejection.code,
            reason: rejection.reason,
        }
    }
}
