//! Agent system for agentmesh
//!
//! ## Architecture
//!
//! - `domain/` - Core types (task results, delegation directives, process status, events)
//! - `llm/` - Model CLI invocation
//! - `handler` - Agent-as-server tool adapter
//! - `launcher` - Starting agent servers and tool servers
//! - `orchestration/` - Swarm orchestrator and peer network
//! - `memory/` - Conversation history

pub mod domain;
pub mod error;
pub mod handler;
pub mod launcher;
pub mod llm;
pub mod memory;
pub mod orchestration;
pub mod prompt;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use domain::*;
pub use error::*;
pub use handler::{AgentToolHandler, ToolKind};
pub use launcher::{AgentLauncher, LaunchedAgent, LocalProcessLauncher};
pub use orchestration::{PeerNetwork, SwarmOrchestrator};
