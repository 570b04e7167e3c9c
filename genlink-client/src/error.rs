//! Client error types.

use genlink_protocol::{ProtocolError, TaskType};
use thiserror::Error;

/// Client errors.
///
/// `Clone` so that one connection outcome can be handed to every caller that
/// joined the same attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("connection blocked by policy: {0}")]
    PolicyBlocked(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("connection interfered with: {0}")]
    ExtensionConflict(String),

    #[error("request timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unknown connection failure: {0}")]
    Unknown(String),

    #[error("giving up after {attempts} reconnection attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("{task_type} task failed: {message}")]
    Task { task_type: TaskType, message: String },

    #[error("not connected")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

impl ClientError {
    /// Returns whether a later attempt may succeed without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectTimeout
                | ClientError::NetworkUnavailable(_)
                | ClientError::ServerError(_)
                | ClientError::Timeout
                | ClientError::ConnectionClosed
                | ClientError::Unknown(_)
        )
    }

    /// Short advice shown to the user for this error.
    pub fn advisory(&self) -> &'static str {
        match self {
            ClientError::AuthRejected(_) => {
                "The API key was rejected. Check the key and try again."
            }
            ClientError::ConnectTimeout => {
                "The image service did not respond in time. Try again shortly."
            }
            ClientError::NetworkUnavailable(_) => {
                "Cannot reach the image service. Check your internet connection."
            }
            ClientError::PolicyBlocked(_) => {
                "The connection was blocked, likely by a proxy or firewall. Ask IT to allow the service."
            }
            ClientError::ServerError(_) => {
                "The image service reported an error. Try again in a few minutes."
            }
            ClientError::ExtensionConflict(_) => {
                "Something on this machine interrupted the connection. Disable interfering extensions or security software and retry."
            }
            ClientError::Timeout => "The request took too long. Try again.",
            ClientError::ConnectionClosed => {
                "The connection closed before the request finished. Try again."
            }
            ClientError::Unknown(_) => "An unexpected connection problem occurred. Try again.",
            ClientError::ReconnectExhausted { .. } => {
                "The connection keeps failing. Reconnect manually once the problem is fixed."
            }
            ClientError::Task { .. } => "The image service could not complete this request.",
            ClientError::NotConnected => "Not connected to the image service.",
            ClientError::InvalidRequest(_) => "The request is missing required input.",
            ClientError::Protocol(_) | ClientError::InvalidResponse(_) => {
                "The image service sent a response this client does not understand."
            }
            ClientError::Config(_) | ClientError::TlsConfig(_) => {
                "The client is misconfigured. Check the endpoint, API key and TLS settings."
            }
        }
    }
}
