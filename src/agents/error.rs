//! Error types for agents and orchestration

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors raised while running agents or orchestrating them
#[derive(Debug, Error)]
pub enum AgentError {
    /// Agent not found
    #[error("Agent not found: {0}")]
    NotFound(String),

    /// Configuration error; not retryable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Model CLI failure
    #[error("Model error: {0}")]
    Llm(#[from] LlmError),

    /// Protocol session failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Delegation chain exceeded the configured depth
    #[error("Delegation depth limit ({0}) reached")]
    DepthLimit(u32),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}

/// Errors from invoking an external model CLI
#[derive(Debug, Error)]
pub enum LlmError {
    /// No command is known for this model id
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The CLI could not be started
    #[error("Failed to start '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// The CLI exited unsuccessfully
    #[error("Model CLI exited with status {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    /// The CLI did not finish in time and was killed
    #[error("Model CLI timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error talking to the CLI
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Result type alias for model CLI operations
pub type LlmResult<T> = Result<T, LlmError>;
