//! Task execution values

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of running one agent within a swarm run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskResult {
    pub agent: String,
    /// Raw model output, absent when the agent failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Delegation depth the agent ran at; the main agent is 0
    pub depth: u32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

impl AgentTaskResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A request, found in an agent's output, to hand work to another agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationDirective {
    pub target_agent: String,
    pub task: String,
}

impl DelegationDirective {
    pub fn new(target_agent: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            target_agent: target_agent.into(),
            task: task.into(),
        }
    }
}

/// Context threaded through recursive agent execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    pub depth: u32,
    /// Agent that delegated this task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated_by: Option<String>,
    /// Task of the delegating agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task: Option<String>,
    /// Caller-supplied data, passed through to prompts as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TaskContext {
    pub fn root(data: Option<Value>) -> Self {
        Self {
            depth: 0,
            delegated_by: None,
            parent_task: None,
            data,
        }
    }

    /// Context for a task delegated from `parent` while it ran `task`.
    pub fn child(&self, parent: &str, task: &str) -> Self {
        Self {
            depth: self.depth + 1,
            delegated_by: Some(parent.to_string()),
            parent_task: Some(task.to_string()),
            data: self.data.clone(),
        }
    }

    /// JSON rendered into prompts, or `None` for a bare root task.
    pub fn prompt_json(&self) -> Option<Value> {
        if self.delegated_by.is_none() && self.data.is_none() {
            return None;
        }
        serde_json::to_value(self).ok()
    }
}
