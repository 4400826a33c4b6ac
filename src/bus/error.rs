use thiserror::Error;

use crate::metadata::TypeParseError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Link error: {0}")]
    LinkError(String),

    #[error("Not connected")]
    Offline,

    #[error("Malformed topic: {0}")]
    MalformedTopic(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Presence tracking is disabled")]
    PresenceDisabled,
}

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("Expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid utf-8 payload: {0}")]
    InvalidText(#[from] std::string::FromUtf8Error),

    #[error("Invalid json payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Value {value} does not fit type {value_type}")]
    TypeMismatch { value: String, value_type: String },

    #[error("Invalid value type: {0}")]
    InvalidType(#[from] TypeParseError),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Invalid metadata path: '{0}'")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("View for instance '{0}' is already open")]
    ViewExists(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors surfaced to RPC callers and service owners.
///
/// Everything except [`RpcError::Remote`] happened locally. Remote failures
/// carry the handler's message only; its stacktrace is logged, not returned.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(#[from] BusError),

    #[error("Call timed out after {0} ms")]
    Timeout(u64),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Service '{0}' is already served")]
    DuplicateService(String),

    #[error("Service '{0}' is not served")]
    UnknownService(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
