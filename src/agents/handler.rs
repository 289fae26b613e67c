//! Agent exposed as a protocol tool server
//!
//! Each agent gets exactly five tools, named after it:
//! `chat_with_<a>`, `ask_<a>`, `delegate_to_<a>`, `get_<a>_status` and
//! `request_<a>_expertise`. Names are resolved to a [`ToolKind`] once, at
//! construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::agents::llm::{ModelCli, ModelInvocation};
use crate::agents::memory::ConversationHistory;
use crate::agents::prompt::{
    build_ask_prompt, build_chat_prompt, build_delegate_prompt, build_expertise_prompt,
    ExpertiseDepth,
};
use crate::config::AgentDefinition;
use crate::domain::{CallToolResult, ToolError, ToolPort, ToolSpec};

/// Conversation id used when a chat call does not name one
pub const DEFAULT_CONVERSATION: &str = "default";

/// The operations every agent exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Chat,
    Ask,
    Delegate,
    Status,
    Expertise,
}

impl ToolKind {
    pub const ALL: [ToolKind; 5] = [
        ToolKind::Chat,
        ToolKind::Ask,
        ToolKind::Delegate,
        ToolKind::Status,
        ToolKind::Expertise,
    ];

    /// Protocol tool name of this operation for `agent`
    pub fn tool_name(&self, agent: &str) -> String {
        match self {
            ToolKind::Chat => format!("chat_with_{}", agent),
            ToolKind::Ask => format!("ask_{}", agent),
            ToolKind::Delegate => format!("delegate_to_{}", agent),
            ToolKind::Status => format!("get_{}_status", agent),
            ToolKind::Expertise => format!("request_{}_expertise", agent),
        }
    }

    fn spec(&self, agent: &AgentDefinition) -> ToolSpec {
        let name = self.tool_name(&agent.name);
        let context = json!({"description": "Extra context: text or any JSON value"});
        match self {
            ToolKind::Chat => ToolSpec::new(
                name,
                format!("Have a conversation with {}", agent.name),
                json!({
                    "type": "object",
                    "properties": {
                        "message": {"type": "string"},
                        "conversation_id": {"type": "string"},
                        "context": context
                    },
                    "required": ["message"]
                }),
            ),
            ToolKind::Ask => ToolSpec::new(
                name,
                format!("Ask {} a direct question", agent.name),
                json!({
                    "type": "object",
                    "properties": {
                        "question": {"type": "string"},
                        "context": context
                    },
                    "required": ["question"]
                }),
            ),
            ToolKind::Delegate => ToolSpec::new(
                name,
                format!("Hand a task to {}", agent.name),
                json!({
                    "type": "object",
                    "properties": {
                        "task": {"type": "string"},
                        "from_agent": {"type": "string"},
                        "context": context
                    },
                    "required": ["task"]
                }),
            ),
            ToolKind::Status => ToolSpec::new(
                name,
                format!("Current status of {}", agent.name),
                json!({"type": "object", "properties": {}}),
            ),
            ToolKind::Expertise => ToolSpec::new(
                name,
                format!("Request expert analysis from {}", agent.name),
                json!({
                    "type": "object",
                    "properties": {
                        "topic": {"type": "string"},
                        "depth": {"type": "string", "enum": ["brief", "detailed", "comprehensive"]},
                        "context": context
                    },
                    "required": ["topic"]
                }),
            ),
        }
    }
}

#[derive(Deserialize)]
struct ChatArgs {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    context: Option<Value>,
}

#[derive(Deserialize)]
struct AskArgs {
    question: String,
    #[serde(default)]
    context: Option<Value>,
}

#[derive(Deserialize)]
struct DelegateArgs {
    task: String,
    #[serde(default)]
    from_agent: Option<String>,
    #[serde(default)]
    context: Option<Value>,
}

#[derive(Deserialize)]
struct ExpertiseArgs {
    topic: String,
    #[serde(default)]
    depth: ExpertiseDepth,
    #[serde(default)]
    context: Option<Value>,
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Decrements the active request counter when dropped
struct WorkloadGuard<'a>(&'a AtomicUsize);

impl<'a> WorkloadGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WorkloadGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves one agent definition as a [`ToolPort`]
pub struct AgentToolHandler {
    definition: AgentDefinition,
    model: Arc<dyn ModelCli>,
    history: ConversationHistory,
    history_turns: usize,
    routes: HashMap<String, ToolKind>,
    active_requests: AtomicUsize,
}

impl AgentToolHandler {
    pub fn new(definition: AgentDefinition, model: Arc<dyn ModelCli>, history_turns: usize) -> Self {
        let routes = ToolKind::ALL
            .iter()
            .map(|kind| (kind.tool_name(&definition.name), *kind))
            .collect();

        Self {
            definition,
            model,
            history: ConversationHistory::default(),
            history_turns,
            routes,
            active_requests: AtomicUsize::new(0),
        }
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Which operation a tool name maps to, if any
    pub fn resolve(&self, tool: &str) -> Option<ToolKind> {
        self.routes.get(tool).copied()
    }

    async fn status(&self) -> Value {
        let agent = &self.definition;
        json!({
            "agent": agent.name,
            "model": agent.model,
            "description": agent.description,
            "capabilities": agent.allowed_tools,
            "working_directory": agent.working_directory.display().to_string(),
            "workload": {
                "active_requests": self.active_requests.load(Ordering::SeqCst),
                "conversations": self.history.conversation_count().await,
            }
        })
    }

    async fn run_model(&self, prompt: String) -> Result<String, String> {
        let invocation = ModelInvocation::new(
            &self.definition.name,
            &self.definition.model,
            prompt,
            &self.definition.working_directory,
        )
        .for_agent_process();
        self.model.invoke(invocation).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ToolPort for AgentToolHandler {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        Ok(ToolKind::ALL
            .iter()
            .map(|kind| kind.spec(&self.definition))
            .collect())
    }

    async fn execute_tool(&self, name: &str, args: Value) -> Result<CallToolResult, ToolError> {
        let kind = self
            .resolve(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        if kind == ToolKind::Status {
            return Ok(CallToolResult::json(self.status().await));
        }

        let _workload = WorkloadGuard::enter(&self.active_requests);
        let agent = &self.definition;
        debug!(agent = %agent.name, tool = %name, "Handling tool call");

        let outcome = match kind {
            ToolKind::Chat => {
                let args: ChatArgs = parse_args(args)?;
                let conversation = args
                    .conversation_id
                    .unwrap_or_else(|| DEFAULT_CONVERSATION.to_string());
                let history = self.history.recent(&conversation, self.history_turns).await;
                let prompt = build_chat_prompt(agent, &args.message, &history, args.context.as_ref());
                let reply = self.run_model(prompt).await;
                if let Ok(text) = &reply {
                    self.history
                        .append(
                            &conversation,
                            vec![format!("User: {}", args.message), format!("Agent: {}", text)],
                        )
                        .await;
                }
                reply
            }
            ToolKind::Ask => {
                let args: AskArgs = parse_args(args)?;
                self.run_model(build_ask_prompt(agent, &args.question, args.context.as_ref()))
                    .await
            }
            ToolKind::Delegate => {
                let args: DelegateArgs = parse_args(args)?;
                self.run_model(build_delegate_prompt(
                    agent,
                    &args.task,
                    args.from_agent.as_deref(),
                    args.context.as_ref(),
                ))
                .await
            }
            ToolKind::Expertise => {
                let args: ExpertiseArgs = parse_args(args)?;
                self.run_model(build_expertise_prompt(
                    agent,
                    &args.topic,
                    args.depth,
                    args.context.as_ref(),
                ))
                .await
            }
            ToolKind::Status => return Ok(CallToolResult::json(self.status().await)),
        };

        match outcome {
            Ok(text) => Ok(CallToolResult::success(text)),
            Err(e) => {
                warn!(agent = %agent.name, tool = %name, "Model invocation failed: {}", e);
                Ok(CallToolResult::error(format!("Agent '{}' failed: {}", agent.name, e)))
            }
        }
    }
}
