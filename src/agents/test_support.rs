//! Test doubles shared by the agent unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::agents::error::{AgentError, AgentResult, LlmResult};
use crate::agents::handler::ToolKind;
use crate::agents::launcher::{AgentLauncher, LaunchedAgent};
use crate::agents::llm::{ModelCli, ModelInvocation};
use crate::config::{AgentDefinition, ToolServerConfig};
use crate::domain::mcp_types::METHOD_NOT_FOUND;
use crate::domain::{CallToolResult, ToolSpec};
use crate::protocol::{ProtocolError, ProtocolResult, ToolCaller};

type Responder = Box<dyn Fn(&ModelInvocation) -> LlmResult<String> + Send + Sync>;

/// Model whose answers come from a closure; records every invocation.
pub struct ScriptedModel {
    respond: Responder,
    calls: Mutex<Vec<ModelInvocation>>,
}

impl ScriptedModel {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&ModelInvocation) -> LlmResult<String> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<ModelInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, agent: &str) -> usize {
        self.calls().iter().filter(|c| c.agent == agent).count()
    }
}

#[async_trait]
impl ModelCli for ScriptedModel {
    async fn invoke(&self, invocation: ModelInvocation) -> LlmResult<String> {
        self.calls.lock().unwrap().push(invocation.clone());
        tokio::task::yield_now().await;
        (self.respond)(&invocation)
    }
}

/// In-memory stand-in for a protocol session to an agent server
pub struct MockSession {
    id: String,
    failing: bool,
    closed_tx: watch::Sender<bool>,
    calls: Mutex<Vec<(String, Value)>>,
    disconnects: AtomicUsize,
}

impl MockSession {
    pub fn new(id: &str, failing: bool) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: id.to_string(),
            failing,
            closed_tx,
            calls: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        })
    }

    /// Simulate the server process dying.
    pub fn kill(&self) {
        self.closed_tx.send_replace(true);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolCaller for MockSession {
    fn server_id(&self) -> &str {
        &self.id
    }

    fn tools(&self) -> Vec<ToolSpec> {
        ToolKind::ALL
            .iter()
            .map(|kind| ToolSpec::new(kind.tool_name(&self.id), "", json!({"type": "object"})))
            .collect()
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> ProtocolResult<CallToolResult> {
        if self.is_closed() {
            return Err(ProtocolError::Transport(format!("{} is gone", self.id)));
        }
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        tokio::task::yield_now().await;

        if self.failing {
            return Ok(CallToolResult::error(format!("{} failed", self.id)));
        }
        if name == ToolKind::Status.tool_name(&self.id) {
            return Ok(CallToolResult::json(json!({"agent": self.id, "workload": {"active_requests": 0}})));
        }
        if name == ToolKind::Ask.tool_name(&self.id) {
            let question = arguments["question"].as_str().unwrap_or_default();
            return Ok(CallToolResult::success(format!("{} answers: {}", self.id, question)));
        }
        if name == ToolKind::Chat.tool_name(&self.id) {
            let message = arguments["message"].as_str().unwrap_or_default();
            return Ok(CallToolResult::success(format!("{} heard: {}", self.id, message)));
        }
        Err(ProtocolError::Application {
            code: METHOD_NOT_FOUND,
            message: format!("Unknown tool: {}", name),
        })
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
    }
}

/// Launcher that hands out [`MockSession`]s instead of processes
#[derive(Default)]
pub struct MockLauncher {
    fail_launch: HashSet<String>,
    failing_replies: HashSet<String>,
    launches: Mutex<Vec<(String, Option<String>, Arc<MockSession>)>>,
    tool_server_connects: Mutex<Vec<String>>,
    slow_first_launch: Option<Duration>,
    launch_attempts: AtomicUsize,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launching these agents fails as if the binary were missing.
    pub fn failing_launch<I: IntoIterator<Item = &'static str>>(mut self, names: I) -> Self {
        self.fail_launch = names.into_iter().map(String::from).collect();
        self
    }

    /// Sessions to these agents answer every call with `isError: true`.
    pub fn failing_replies<I: IntoIterator<Item = &'static str>>(mut self, names: I) -> Self {
        self.failing_replies = names.into_iter().map(String::from).collect();
        self
    }

    /// The first launch takes `delay` before completing.
    pub fn slow_first_launch(mut self, delay: Duration) -> Self {
        self.slow_first_launch = Some(delay);
        self
    }

    /// Every session launched for `name`, in completion order.
    pub fn sessions(&self, name: &str) -> Vec<Arc<MockSession>> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, _, s)| s.clone())
            .collect()
    }

    pub fn launches(&self) -> Vec<(String, Option<String>)> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|(name, caller, _)| (name.clone(), caller.clone()))
            .collect()
    }

    /// Most recent session launched for `name` on behalf of `caller`.
    pub fn session(&self, name: &str, caller: Option<&str>) -> Option<Arc<MockSession>> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(n, c, _)| n == name && c.as_deref() == caller)
            .map(|(_, _, s)| s.clone())
    }

    pub fn tool_server_connects(&self) -> Vec<String> {
        self.tool_server_connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentLauncher for MockLauncher {
    async fn launch_agent(
        &self,
        agent: &AgentDefinition,
        caller: Option<&str>,
    ) -> AgentResult<LaunchedAgent> {
        tokio::task::yield_now().await;
        if self.launch_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(delay) = self.slow_first_launch {
                tokio::time::sleep(delay).await;
            }
        }
        if self.fail_launch.contains(&agent.name) {
            return Err(AgentError::Protocol(ProtocolError::Spawn {
                command: "agentmesh".to_string(),
                reason: format!("cannot start {}", agent.name),
            }));
        }

        let session = MockSession::new(&agent.name, self.failing_replies.contains(&agent.name));
        self.launches.lock().unwrap().push((
            agent.name.clone(),
            caller.map(String::from),
            session.clone(),
        ));
        Ok(LaunchedAgent {
            session,
            pid: Some(4242),
            port: agent.listen_port,
        })
    }

    async fn connect_tool_server(&self, server: &ToolServerConfig) -> AgentResult<Arc<dyn ToolCaller>> {
        self.tool_server_connects
            .lock()
            .unwrap()
            .push(server.name.clone());
        Ok(MockSession::new(&server.name, false))
    }
}
