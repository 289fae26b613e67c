//! Shared fixtures: a canned model CLI and a launcher that serves agents
//! in-process over duplex pipes.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentmesh::agents::error::{AgentError, AgentResult, LlmError, LlmResult};
use agentmesh::agents::handler::AgentToolHandler;
use agentmesh::agents::launcher::{AgentLauncher, LaunchedAgent};
use agentmesh::agents::llm::{ModelCli, ModelInvocation};
use agentmesh::config::{AgentDefinition, ToolServerConfig};
use agentmesh::domain::mcp_types::Implementation;
use agentmesh::protocol::{Connection, ProtocolServer, Session, ToolCaller};
use async_trait::async_trait;

/// Replies with `<agent> replied to: <last prompt line>`; agents whose name
/// contains `broken` fail like a crashed CLI.
#[derive(Default)]
pub struct EchoModel {
    prompts: Mutex<Vec<(String, String)>>,
}

impl EchoModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn prompts_for(&self, agent: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == agent)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl ModelCli for EchoModel {
    async fn invoke(&self, invocation: ModelInvocation) -> LlmResult<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((invocation.agent.clone(), invocation.prompt.clone()));

        if invocation.agent.contains("broken") {
            return Err(LlmError::ExitStatus {
                code: Some(2),
                stderr: "model crashed".to_string(),
            });
        }
        let last = invocation
            .prompt
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty() && l.trim() != "Agent:")
            .unwrap_or_default()
            .to_string();
        Ok(format!("{} replied to: {}", invocation.agent, last))
    }
}

pub fn server_info(name: &str) -> Implementation {
    Implementation {
        name: name.to_string(),
        version: "test".to_string(),
    }
}

/// Start an agent server on a background task and connect a session to it.
pub async fn serve_agent(
    agent: AgentDefinition,
    model: Arc<dyn ModelCli>,
) -> AgentResult<Session> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    let name = agent.name.clone();
    let handler = Arc::new(AgentToolHandler::new(agent, model, 10));
    let server = ProtocolServer::new(handler, server_info(&name));
    tokio::spawn(async move {
        let _ = server.serve(server_read, server_write).await;
    });

    let (client_read, client_write) = tokio::io::split(client_io);
    Ok(Session::establish(
        &name,
        Connection::from_io(client_read, client_write),
        Duration::from_secs(5),
    )
    .await?)
}

/// Launcher backed by [`serve_agent`]
pub struct InProcessLauncher {
    model: Arc<dyn ModelCli>,
    launches: Mutex<Vec<String>>,
}

impl InProcessLauncher {
    pub fn new(model: Arc<dyn ModelCli>) -> Self {
        Self {
            model,
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentLauncher for InProcessLauncher {
    async fn launch_agent(
        &self,
        agent: &AgentDefinition,
        _caller: Option<&str>,
    ) -> AgentResult<LaunchedAgent> {
        self.launches.lock().unwrap().push(agent.name.clone());
        let session = serve_agent(agent.clone(), self.model.clone()).await?;
        Ok(LaunchedAgent {
            session: Arc::new(session),
            pid: None,
            port: None,
        })
    }

    async fn connect_tool_server(&self, server: &ToolServerConfig) -> AgentResult<Arc<dyn ToolCaller>> {
        Err(AgentError::Configuration(format!(
            "tool server '{}' is not available in tests",
            server.name
        )))
    }
}
