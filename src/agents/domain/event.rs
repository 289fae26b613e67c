//! Swarm lifecycle events

use serde::{Deserialize, Serialize};

/// Events broadcast by the swarm orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEvent {
    AgentStarting { agent: String },
    AgentReady { agent: String, tools: usize },
    AgentFailed { agent: String, error: String },
    /// The agent's process went away without being asked to
    AgentExited { agent: String },
    AgentStopped { agent: String },
    PeerConnected { from: String, to: String },
    TaskStarted { run_id: String, agent: String, depth: u32 },
    TaskCompleted { run_id: String, agent: String, duration_ms: u64 },
    TaskFailed { run_id: String, agent: String, error: String },
    DelegationDropped { from: String, to: String, reason: String },
}

impl SwarmEvent {
    pub fn agent(&self) -> &str {
        match self {
            SwarmEvent::AgentStarting { agent }
            | SwarmEvent::AgentReady { agent, .. }
            | SwarmEvent::AgentFailed { agent, .. }
            | SwarmEvent::AgentExited { agent }
            | SwarmEvent::AgentStopped { agent }
            | SwarmEvent::TaskStarted { agent, .. }
            | SwarmEvent::TaskCompleted { agent, .. }
            | SwarmEvent::TaskFailed { agent, .. } => agent,
            SwarmEvent::PeerConnected { from, .. } | SwarmEvent::DelegationDropped { from, .. } => from,
        }
    }
}
