//! Error types for QLink

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the QLink Error
pub type Result<T> = std::result::Result<T, Error>;

/// QLink error types
#[derive(Debug, Error)]
pub enum Error {
    /// A session could not be established or accepted, or the handshake
    /// failed before the session reached the running state.
    #[error("connect failed: {context}")]
    Connect {
        context: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// The session ended while a request was in flight, or an operation
    /// was attempted against a torn-down session.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// An operation was invoked in a state that does not permit it.
    #[error("invalid state: {0}")]
    State(String),

    /// The peer sent a malformed or unexpected message.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The QMP server reported failure for an executed command.
    #[error("command '{command}' failed: {}", .error.desc)]
    Execute {
        /// Command name as issued by the caller.
        command: String,
        /// The full message that was sent.
        sent: serde_json::Value,
        /// The full response that reported the failure.
        received: serde_json::Value,
        /// Structured error payload from the response.
        error: ErrorInfo,
    },

    /// The qtest server reported FAIL or ERR for an executed command.
    #[error("qtest command failed ({status}): {reason}")]
    Qtest { status: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a `Connect` error without an underlying cause.
    pub(crate) fn connect(context: impl Into<String>) -> Self {
        Error::Connect {
            context: context.into(),
            source: None,
        }
    }

    /// Wrap any non-connect error as the cause of a failed connect.
    pub(crate) fn into_connect(self, context: impl Into<String>) -> Self {
        match self {
            err @ Error::Connect { .. } => err,
            other => Error::Connect {
                context: context.into(),
                source: Some(Box::new(other)),
            },
        }
    }
}

/// Error payload of a failed QMP command response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub class: ErrorClass,
    pub desc: String,
}

/// QMP error classes, after qapi/error.json.
///
/// Recognized classes parse into their own variant; anything else lands in
/// [`ErrorClass::Other`] with the wire name preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Default class for errors that need no specific one.
    GenericError,
    /// The requested command has not been found.
    CommandNotFound,
    /// A device has failed to become active.
    DeviceNotActive,
    /// The requested device has not been found.
    DeviceNotFound,
    /// A required KVM capability is missing.
    #[serde(rename = "KVMMissingCap")]
    KvmMissingCap,
    /// Any class this library does not recognize.
    #[serde(untagged)]
    Other(String),
}

impl ErrorClass {
    /// Wire name of the class.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorClass::GenericError => "GenericError",
            ErrorClass::CommandNotFound => "CommandNotFound",
            ErrorClass::DeviceNotActive => "DeviceNotActive",
            ErrorClass::DeviceNotFound => "DeviceNotFound",
            ErrorClass::KvmMissingCap => "KVMMissingCap",
            ErrorClass::Other(name) => name,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
