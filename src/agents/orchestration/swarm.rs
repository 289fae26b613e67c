//! Swarm orchestrator
//!
//! Starts an agent server per exposable agent, wires the peer sessions each
//! agent is allowed to use, and runs tasks by invoking the main agent and
//! recursively fanning out whatever it delegates.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::delegation::{authorize, parse_delegations};
use crate::agents::domain::{
    AgentProcessInfo, AgentTaskResult, DelegationDirective, ProcessStatus, SwarmEvent, TaskContext,
};
use crate::agents::error::{AgentError, AgentResult};
use crate::agents::handler::ToolKind;
use crate::agents::launcher::{AgentLauncher, LocalProcessLauncher};
use crate::agents::llm::{CommandModelCli, CommandTable, ModelCli, ModelInvocation};
use crate::agents::prompt::build_task_prompt;
use crate::config::{AgentDefinition, Settings};
use crate::protocol::{McpClientManager, ToolCaller};

const EVENT_CAPACITY: usize = 256;

/// Supervision record for one agent server
struct AgentProcess {
    session: Option<Arc<dyn ToolCaller>>,
    status: ProcessStatus,
    pid: Option<u32>,
    port: Option<u16>,
    last_error: Option<String>,
}

impl AgentProcess {
    fn starting() -> Self {
        Self {
            session: None,
            status: ProcessStatus::Starting,
            pid: None,
            port: None,
            last_error: None,
        }
    }
}

/// Results of one `execute_task` call
struct RunState {
    run_id: String,
    results: Mutex<Vec<AgentTaskResult>>,
}

impl RunState {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Insert or replace the entry for `result.agent`.
    async fn record(&self, result: AgentTaskResult) {
        let mut results = self.results.lock().await;
        match results.iter_mut().find(|r| r.agent == result.agent) {
            Some(existing) => *existing = result,
            None => results.push(result),
        }
    }
}

pub struct SwarmOrchestrator {
    settings: Settings,
    agents: BTreeMap<String, AgentDefinition>,
    model: Arc<dyn ModelCli>,
    launcher: Arc<dyn AgentLauncher>,
    processes: Arc<RwLock<HashMap<String, AgentProcess>>>,
    /// (caller, callee) → session
    peers: RwLock<HashMap<(String, String), Arc<dyn ToolCaller>>>,
    tool_servers: McpClientManager,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    last_results: Mutex<Vec<AgentTaskResult>>,
    events: broadcast::Sender<SwarmEvent>,
}

impl SwarmOrchestrator {
    pub fn new(
        settings: Settings,
        model: Arc<dyn ModelCli>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> AgentResult<Self> {
        settings
            .validate()
            .map_err(|e| AgentError::Configuration(e.to_string()))?;

        let agents = settings
            .agents
            .iter()
            .map(|a| (a.name.clone(), a.clone()))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            settings,
            agents,
            model,
            launcher,
            processes: Arc::new(RwLock::new(HashMap::new())),
            peers: RwLock::new(HashMap::new()),
            tool_servers: McpClientManager::new(),
            watchers: Mutex::new(Vec::new()),
            last_results: Mutex::new(Vec::new()),
            events,
        })
    }

    /// Orchestrator backed by real model CLIs and child processes.
    pub fn from_settings(settings: Settings, config_path: Option<&std::path::Path>) -> AgentResult<Self> {
        let model = Arc::new(CommandModelCli::new(
            CommandTable::new(settings.models.clone()),
            settings.swarm.model_timeout(),
        ));
        let mut launcher = LocalProcessLauncher::from_settings(&settings)?;
        if let Some(path) = config_path {
            launcher = launcher.with_config_path(path);
        }
        Self::new(settings, model, Arc::new(launcher))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SwarmEvent) {
        let _ = self.events.send(event);
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.get(name)
    }

    /// Start agent servers, connect declared tool servers, then wire peers.
    ///
    /// Individual failures are recorded per agent and reported as events;
    /// they never abort the other agents.
    pub async fn initialize(&self) -> AgentResult<()> {
        if !self.processes.read().await.is_empty() {
            warn!("Swarm already initialized");
            return Ok(());
        }

        self.connect_tool_servers().await;

        let exposable: Vec<&AgentDefinition> =
            self.agents.values().filter(|a| a.expose_as_server).collect();
        info!("Starting {} agent server(s)", exposable.len());
        join_all(exposable.into_iter().map(|agent| self.start_agent(agent))).await;

        self.wire_peers().await;
        Ok(())
    }

    async fn connect_tool_servers(&self) {
        let wanted: BTreeSet<&str> = self
            .agents
            .values()
            .flat_map(|a| a.tool_servers.iter().map(String::as_str))
            .collect();

        for name in wanted {
            let Some(config) = self.settings.tool_server(name) else {
                continue;
            };
            if !config.enabled {
                info!("Tool server '{}' is disabled, skipping", name);
                continue;
            }
            match self.launcher.connect_tool_server(config).await {
                Ok(session) => {
                    info!("Connected tool server '{}' with {} tool(s)", name, session.tools().len());
                    self.tool_servers.register(name, session).await;
                }
                Err(e) => warn!("Failed to connect tool server '{}': {}", name, e),
            }
        }
    }

    async fn start_agent(&self, agent: &AgentDefinition) {
        let name = agent.name.clone();
        self.processes
            .write()
            .await
            .insert(name.clone(), AgentProcess::starting());
        self.emit(SwarmEvent::AgentStarting { agent: name.clone() });

        match self.launcher.launch_agent(agent, None).await {
            Ok(launched) => {
                let tools = launched.session.tools().len();
                {
                    let mut processes = self.processes.write().await;
                    if let Some(process) = processes.get_mut(&name) {
                        process.session = Some(launched.session.clone());
                        process.status = ProcessStatus::Ready;
                        process.pid = launched.pid;
                        process.port = launched.port;
                    }
                }
                info!(agent = %name, pid = ?launched.pid, "Agent ready with {} tool(s)", tools);
                self.emit(SwarmEvent::AgentReady {
                    agent: name.clone(),
                    tools,
                });
                self.watch(name, launched.session).await;
            }
            Err(e) => {
                warn!(agent = %name, "Agent failed to start: {}", e);
                if let Some(process) = self.processes.write().await.get_mut(&name) {
                    process.status = ProcessStatus::Error;
                    process.last_error = Some(e.to_string());
                }
                self.emit(SwarmEvent::AgentFailed {
                    agent: name,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Flag the agent as failed if its session closes while it should be up.
    async fn watch(&self, name: String, session: Arc<dyn ToolCaller>) {
        let processes = self.processes.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            session.closed().await;
            let mut processes = processes.write().await;
            if let Some(process) = processes.get_mut(&name) {
                if process.status.can_fail() {
                    warn!(agent = %name, "Agent server exited unexpectedly");
                    process.status = ProcessStatus::Error;
                    process.last_error = Some("agent server exited unexpectedly".to_string());
                    let _ = events.send(SwarmEvent::AgentExited { agent: name.clone() });
                }
            }
        });
        self.watchers.lock().await.push(handle);
    }

    async fn wire_peers(&self) {
        for agent in self.agents.values() {
            for target in &agent.connections {
                let ready = self
                    .processes
                    .read()
                    .await
                    .get(target)
                    .map(|p| p.status.is_ready())
                    .unwrap_or(false);
                if !ready {
                    continue;
                }
                let Some(definition) = self.agents.get(target) else {
                    continue;
                };

                match self.launcher.launch_agent(definition, Some(&agent.name)).await {
                    Ok(launched) => {
                        debug!("Peer session {} -> {} established", agent.name, target);
                        self.peers
                            .write()
                            .await
                            .insert((agent.name.clone(), target.clone()), launched.session);
                        self.emit(SwarmEvent::PeerConnected {
                            from: agent.name.clone(),
                            to: target.clone(),
                        });
                    }
                    Err(e) => warn!("Failed to connect {} -> {}: {}", agent.name, target, e),
                }
            }
        }
    }

    /// Run `task` on the main agent and everything it delegates.
    ///
    /// Always returns one entry per agent invoked; failures are carried in
    /// the entries' `error` fields.
    pub async fn execute_task(&self, task: &str) -> AgentResult<Vec<AgentTaskResult>> {
        self.execute_task_with_context(task, None).await
    }

    pub async fn execute_task_with_context(
        &self,
        task: &str,
        context: Option<Value>,
    ) -> AgentResult<Vec<AgentTaskResult>> {
        let main = self
            .settings
            .swarm
            .main_agent
            .as_deref()
            .ok_or_else(|| AgentError::Configuration("no main agent designated".to_string()))?;
        if !self.agents.contains_key(main) {
            return Err(AgentError::Configuration(format!(
                "main agent '{}' is not defined",
                main
            )));
        }

        self.last_results.lock().await.clear();

        let run = RunState::new();
        info!(run_id = %run.run_id, agent = %main, "Starting run");
        self.execute_agent_task(&run, main, task, TaskContext::root(context))
            .await;

        let results = run.results.into_inner();
        *self.last_results.lock().await = results.clone();
        info!("Run finished with {} result(s)", results.len());
        Ok(results)
    }

    /// Results of the most recent run
    pub async fn results(&self) -> Vec<AgentTaskResult> {
        self.last_results.lock().await.clone()
    }

    fn execute_agent_task<'a>(
        &'a self,
        run: &'a RunState,
        agent_name: &'a str,
        task: &'a str,
        context: TaskContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let started = Instant::now();
            let started_at = Utc::now();
            self.emit(SwarmEvent::TaskStarted {
                run_id: run.run_id.clone(),
                agent: agent_name.to_string(),
                depth: context.depth,
            });

            let outcome = match self.agents.get(agent_name) {
                Some(agent) => self.invoke_agent(agent, task, &context).await,
                None => Err(AgentError::NotFound(agent_name.to_string())),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let output = match outcome {
                Ok(output) => output,
                Err(e) => {
                    warn!(agent = %agent_name, "Task failed: {}", e);
                    run.record(AgentTaskResult {
                        agent: agent_name.to_string(),
                        result: None,
                        error: Some(e.to_string()),
                        duration_ms,
                        depth: context.depth,
                        run_id: run.run_id.clone(),
                        started_at,
                    })
                    .await;
                    self.emit(SwarmEvent::TaskFailed {
                        run_id: run.run_id.clone(),
                        agent: agent_name.to_string(),
                        error: e.to_string(),
                    });
                    return;
                }
            };

            let delegations = match self.agents.get(agent_name) {
                Some(agent) => self.honored_delegations(agent, &output, context.depth),
                None => Vec::new(),
            };

            run.record(AgentTaskResult {
                agent: agent_name.to_string(),
                result: Some(output),
                error: None,
                duration_ms,
                depth: context.depth,
                run_id: run.run_id.clone(),
                started_at,
            })
            .await;
            self.emit(SwarmEvent::TaskCompleted {
                run_id: run.run_id.clone(),
                agent: agent_name.to_string(),
                duration_ms,
            });

            if delegations.is_empty() {
                return;
            }

            debug!(agent = %agent_name, "Fanning out {} delegation(s)", delegations.len());
            let child_context = context.child(agent_name, task);
            join_all(delegations.iter().map(|d| {
                self.execute_agent_task(run, &d.target_agent, &d.task, child_context.clone())
            }))
            .await;
        })
    }

    async fn invoke_agent(
        &self,
        agent: &AgentDefinition,
        task: &str,
        context: &TaskContext,
    ) -> AgentResult<String> {
        let roster: Vec<(String, String)> = self
            .agents
            .values()
            .map(|a| (a.name.clone(), a.description.clone()))
            .collect();
        let prompt = build_task_prompt(agent, task, context.prompt_json().as_ref(), &roster);

        let invocation = ModelInvocation::new(
            &agent.name,
            &agent.model,
            prompt,
            &agent.working_directory,
        )
        .for_agent_process();
        Ok(self.model.invoke(invocation).await?)
    }

    /// Directives in `output` that may run: authorized by the agent's
    /// connections and within the depth limit. Everything else is dropped
    /// with an event.
    fn honored_delegations(
        &self,
        agent: &AgentDefinition,
        output: &str,
        depth: u32,
    ) -> Vec<DelegationDirective> {
        let (honored, unauthorized) = authorize(agent, parse_delegations(output));
        for directive in unauthorized {
            debug!(
                "Dropping delegation {} -> {}: not a connection",
                agent.name, directive.target_agent
            );
            self.emit(SwarmEvent::DelegationDropped {
                from: agent.name.clone(),
                to: directive.target_agent,
                reason: "not in connections".to_string(),
            });
        }

        let max_depth = self.settings.swarm.max_delegation_depth;
        if depth >= max_depth && !honored.is_empty() {
            warn!(
                agent = %agent.name,
                "Delegation depth limit ({}) reached, dropping {} directive(s)",
                max_depth,
                honored.len()
            );
            for directive in honored {
                self.emit(SwarmEvent::DelegationDropped {
                    from: agent.name.clone(),
                    to: directive.target_agent,
                    reason: AgentError::DepthLimit(max_depth).to_string(),
                });
            }
            return Vec::new();
        }

        honored
    }

    /// Supervision snapshot of every started agent, sorted by name
    pub async fn agent_statuses(&self) -> Vec<AgentProcessInfo> {
        let processes = self.processes.read().await;
        let mut statuses: Vec<AgentProcessInfo> = processes
            .iter()
            .map(|(name, p)| AgentProcessInfo {
                agent: name.clone(),
                status: p.status,
                pid: p.pid,
                port: p.port,
                last_error: p.last_error.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.agent.cmp(&b.agent));
        statuses
    }

    async fn ready_session(&self, agent: &str) -> AgentResult<Arc<dyn ToolCaller>> {
        let processes = self.processes.read().await;
        let process = processes
            .get(agent)
            .ok_or_else(|| AgentError::NotFound(agent.to_string()))?;
        match (&process.session, process.status) {
            (Some(session), ProcessStatus::Ready) => Ok(session.clone()),
            (_, status) => Err(AgentError::Internal(format!(
                "agent '{}' is {}",
                agent, status
            ))),
        }
    }

    /// Ask a running agent for its status through its status tool.
    pub async fn poll_status(&self, agent: &str) -> AgentResult<Value> {
        let session = self.ready_session(agent).await?;
        let text = session
            .call_tool_text(&ToolKind::Status.tool_name(agent), json!({}))
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Put a question to `to` on behalf of `from`, over their peer session.
    pub async fn ask_peer(&self, from: &str, to: &str, question: &str) -> AgentResult<String> {
        let caller = self
            .agents
            .get(from)
            .ok_or_else(|| AgentError::NotFound(from.to_string()))?;
        if !caller.can_delegate_to(to) {
            return Err(AgentError::Configuration(format!(
                "agent '{}' is not connected to '{}'",
                from, to
            )));
        }

        let session = self
            .peers
            .read()
            .await
            .get(&(from.to_string(), to.to_string()))
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("peer session {} -> {}", from, to)))?;

        Ok(session
            .call_tool_text(
                &ToolKind::Ask.tool_name(to),
                json!({ "question": question, "context": { "asked_by": from } }),
            )
            .await?)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn tool_server(&self, name: &str) -> Option<Arc<dyn ToolCaller>> {
        self.tool_servers.get(name).await
    }

    /// Stop every agent and close every session. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        // Drained before disconnecting; watchers only flag registered agents.
        let stopped: Vec<(String, Option<Arc<dyn ToolCaller>>)> = self
            .processes
            .write()
            .await
            .drain()
            .map(|(name, process)| (name, process.session))
            .collect();

        for watcher in self.watchers.lock().await.drain(..) {
            watcher.abort();
        }

        let peers: Vec<Arc<dyn ToolCaller>> =
            self.peers.write().await.drain().map(|(_, s)| s).collect();
        let had_tool_servers = !self.tool_servers.is_empty().await;

        let mut sessions: Vec<Arc<dyn ToolCaller>> = peers;
        sessions.extend(stopped.iter().filter_map(|(_, s)| s.clone()));
        if sessions.is_empty() && stopped.is_empty() && !had_tool_servers {
            return;
        }

        futures::join!(
            join_all(sessions.iter().map(|s| s.disconnect())),
            self.tool_servers.disconnect_all()
        );

        for (name, _) in stopped {
            self.emit(SwarmEvent::AgentStopped { agent: name });
        }
        info!("Swarm shut down");
    }
}
