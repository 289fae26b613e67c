//! Error types for the tool protocol layer

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by protocol sessions and transports
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The transport failed or closed underneath the session
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The peer answered with an error object
    #[error("Server error {code}: {message}")]
    Application { code: i64, message: String },

    /// The request was abandoned because the session was disconnected
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// No response arrived within the configured call timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The server process could not be started
    #[error("Failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// A response arrived but its payload had the wrong shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The tool ran but reported a failure (`isError: true`)
    #[error("Tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// No session registered under this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl ProtocolError {
    /// True when the peer is gone, as opposed to the peer rejecting a request.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Transport(_) | ProtocolError::Spawn { .. })
    }

    pub fn is_application(&self) -> bool {
        matches!(self, ProtocolError::Application { .. })
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidResponse(err.to_string())
    }
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
