//! Starting agent servers and tool servers
//!
//! The orchestrators never spawn processes themselves; they go through an
//! [`AgentLauncher`] so the process model can be swapped out in tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::agents::error::{AgentError, AgentResult};
use crate::config::{AgentDefinition, Settings, ToolServerConfig};
use crate::protocol::{Connection, ProtocolError, Session, ToolCaller, TransportConfig};

pub const ENV_AGENT_NAME: &str = "AGENTMESH_AGENT_NAME";
pub const ENV_AGENT_MODEL: &str = "AGENTMESH_AGENT_MODEL";
pub const ENV_WORKING_DIRECTORY: &str = "AGENTMESH_WORKING_DIRECTORY";
pub const ENV_TOOL_SERVERS: &str = "AGENTMESH_TOOL_SERVERS";
pub const ENV_CALLER: &str = "AGENTMESH_CALLER";
pub const ENV_CONFIG: &str = "AGENTMESH_CONFIG";

/// A started agent and the session opened to it
pub struct LaunchedAgent {
    pub session: Arc<dyn ToolCaller>,
    pub pid: Option<u32>,
    pub port: Option<u16>,
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Start (or reach) the server for `agent` and open a session to it.
    ///
    /// `caller` is the agent on whose behalf the session is opened; `None`
    /// for the orchestrator itself.
    async fn launch_agent(
        &self,
        agent: &AgentDefinition,
        caller: Option<&str>,
    ) -> AgentResult<LaunchedAgent>;

    async fn connect_tool_server(&self, server: &ToolServerConfig) -> AgentResult<Arc<dyn ToolCaller>>;
}

/// Launches agent servers as child processes of this one
pub struct LocalProcessLauncher {
    command: Vec<String>,
    config_path: Option<PathBuf>,
    call_timeout: Duration,
}

impl LocalProcessLauncher {
    pub fn new(command: Vec<String>, call_timeout: Duration) -> Self {
        Self {
            command,
            config_path: None,
            call_timeout,
        }
    }

    /// Use `swarm.agent_server_command`, or this executable's
    /// `agent-server` subcommand.
    pub fn from_settings(settings: &Settings) -> AgentResult<Self> {
        let command = match &settings.swarm.agent_server_command {
            Some(command) => command.clone(),
            None => vec![
                std::env::current_exe()?.display().to_string(),
                "agent-server".to_string(),
            ],
        };
        Ok(Self::new(command, settings.swarm.call_timeout()))
    }

    /// Config file handed to spawned servers through the environment.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    fn environment(&self, agent: &AgentDefinition, caller: Option<&str>) -> Vec<(String, String)> {
        let mut env = vec![
            (ENV_AGENT_NAME.to_string(), agent.name.clone()),
            (ENV_AGENT_MODEL.to_string(), agent.model.clone()),
            (
                ENV_WORKING_DIRECTORY.to_string(),
                agent.working_directory.display().to_string(),
            ),
            (ENV_TOOL_SERVERS.to_string(), agent.tool_servers.join(",")),
        ];
        if let Some(caller) = caller {
            env.push((ENV_CALLER.to_string(), caller.to_string()));
        }
        if let Some(path) = &self.config_path {
            env.push((ENV_CONFIG.to_string(), path.display().to_string()));
        }
        env
    }

    fn arguments(&self, agent: &AgentDefinition, listen: Option<u16>) -> AgentResult<Vec<String>> {
        let mut args: Vec<String> = self.command.iter().skip(1).cloned().collect();
        args.push("--agent".to_string());
        args.push(agent.name.clone());
        args.push("--definition".to_string());
        args.push(serde_json::to_string(agent)?);
        if let Some(port) = listen {
            args.push("--listen".to_string());
            args.push(port.to_string());
        }
        Ok(args)
    }

    fn program(&self) -> AgentResult<&str> {
        self.command
            .first()
            .map(String::as_str)
            .ok_or_else(|| AgentError::Configuration("agent server command is empty".to_string()))
    }

    async fn spawn_stdio(
        &self,
        agent: &AgentDefinition,
        caller: Option<&str>,
    ) -> AgentResult<LaunchedAgent> {
        let transport = TransportConfig::Stdio {
            command: self.program()?.to_string(),
            args: self.arguments(agent, None)?,
            env: self.environment(agent, caller),
            cwd: None,
        };
        let connection = Connection::open(&transport).await?;
        let pid = connection.child.as_ref().and_then(|child| child.id());
        let session = Session::establish(&agent.name, connection, self.call_timeout).await?;
        info!(agent = %agent.name, pid = ?pid, caller = ?caller, "Agent server ready over stdio");

        Ok(LaunchedAgent {
            session: Arc::new(session),
            pid,
            port: None,
        })
    }

    async fn spawn_tcp(
        &self,
        agent: &AgentDefinition,
        port: u16,
        caller: Option<&str>,
    ) -> AgentResult<LaunchedAgent> {
        let program = self.program()?;
        let child = Command::new(program)
            .args(self.arguments(agent, Some(port))?)
            .envs(self.environment(agent, caller))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProtocolError::Spawn {
                command: program.to_string(),
                reason: e.to_string(),
            })?;
        let pid = child.id();

        let connection = Connection::open(&TransportConfig::tcp(format!("127.0.0.1:{}", port)))
            .await?
            .with_child(child);
        let session = Session::establish(&agent.name, connection, self.call_timeout).await?;
        info!(agent = %agent.name, pid = ?pid, port, "Agent server ready over TCP");

        Ok(LaunchedAgent {
            session: Arc::new(session),
            pid,
            port: Some(port),
        })
    }

    async fn connect_tcp(&self, agent: &AgentDefinition, port: u16) -> AgentResult<LaunchedAgent> {
        let connection = Connection::open(&TransportConfig::tcp(format!("127.0.0.1:{}", port))).await?;
        let session = Session::establish(&agent.name, connection, self.call_timeout).await?;
        Ok(LaunchedAgent {
            session: Arc::new(session),
            pid: None,
            port: Some(port),
        })
    }
}

#[async_trait]
impl AgentLauncher for LocalProcessLauncher {
    async fn launch_agent(
        &self,
        agent: &AgentDefinition,
        caller: Option<&str>,
    ) -> AgentResult<LaunchedAgent> {
        match (agent.listen_port, caller) {
            // The listening server is already up; peers share it.
            (Some(port), Some(_)) => self.connect_tcp(agent, port).await,
            (Some(port), None) => self.spawn_tcp(agent, port, None).await,
            (None, caller) => self.spawn_stdio(agent, caller).await,
        }
    }

    async fn connect_tool_server(&self, server: &ToolServerConfig) -> AgentResult<Arc<dyn ToolCaller>> {
        let config = server.server_config(self.call_timeout).ok_or_else(|| {
            AgentError::Configuration(format!(
                "tool server '{}' has neither a command nor an address",
                server.name
            ))
        })?;
        let session = Session::connect(&config).await?;
        Ok(Arc::new(session))
    }
}
