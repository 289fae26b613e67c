//! Supervision records for running agents

use serde::{Deserialize, Serialize};

/// Lifecycle of one agent server process.
///
/// `Starting` moves to `Ready` on a successful handshake or to `Error` when
/// spawning or the handshake fails. `Ready` moves to `Stopped` on explicit
/// shutdown. Any state may fall to `Error` on an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Ready,
    Error,
    Stopped,
}

impl ProcessStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProcessStatus::Ready)
    }

    /// Whether an unexpected exit should be reported from this state.
    pub fn can_fail(&self) -> bool {
        !matches!(self, ProcessStatus::Stopped | ProcessStatus::Error)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Ready => "ready",
            ProcessStatus::Error => "error",
            ProcessStatus::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Snapshot of an agent process as seen by its supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProcessInfo {
    pub agent: String,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
