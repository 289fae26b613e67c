//! Tool protocol plumbing
//!
//! Line-delimited JSON-RPC sessions used both to reach external tool servers
//! and to talk to agents exposed as tool servers.

pub mod client;
pub mod error;
pub mod server;
pub mod transport;

#[cfg(test)]
mod client_test;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{CallToolResult, ToolSpec};

pub use client::{McpClientManager, Session, DEFAULT_CALL_TIMEOUT};
pub use error::{ProtocolError, ProtocolResult};
pub use server::ProtocolServer;
pub use transport::{Connection, ServerConfig, TransportConfig};

/// Anything tools can be invoked on.
///
/// Implemented by [`Session`]; orchestration code depends on this trait so it
/// can be exercised without real processes.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    fn server_id(&self) -> &str;

    fn tools(&self) -> Vec<ToolSpec>;

    fn is_closed(&self) -> bool;

    async fn call_tool(&self, name: &str, arguments: Value) -> ProtocolResult<CallToolResult>;

    /// Resolves once the underlying connection is gone.
    async fn closed(&self);

    async fn disconnect(&self);

    /// Invoke a tool and flatten its text content. A result flagged
    /// `isError` becomes [`ProtocolError::ToolFailed`].
    async fn call_tool_text(&self, name: &str, arguments: Value) -> ProtocolResult<String> {
        let result = self.call_tool(name, arguments).await?;
        if result.is_error {
            return Err(ProtocolError::ToolFailed {
                tool: name.to_string(),
                message: result.text(),
            });
        }
        Ok(result.text())
    }
}
