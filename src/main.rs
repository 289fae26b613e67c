use std::path::Path;
use std::sync::Arc;

use agentmesh::agents::handler::AgentToolHandler;
use agentmesh::agents::launcher::LocalProcessLauncher;
use agentmesh::agents::llm::{CommandModelCli, CommandTable};
use agentmesh::agents::orchestration::{PeerNetwork, SpawnStrategy, SwarmOrchestrator};
use agentmesh::cli::{Cli, Command};
use agentmesh::config::{AgentDefinition, Settings};
use agentmesh::domain::mcp_types::Implementation;
use agentmesh::protocol::ProtocolServer;
use clap::Parser;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries protocol frames in agent-server mode, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.clone() {
        Command::Run { task, context } => run(&cli, &task, context).await,
        Command::AgentServer {
            agent,
            listen,
            definition,
        } => agent_server(&cli, &agent, listen, definition).await,
        Command::Validate => validate(&cli),
        Command::Peers {
            root,
            agent_type,
            strategy,
            model,
            message,
        } => peers(&cli, &root, &agent_type, strategy, &model, &message).await,
    }
}

async fn run(cli: &Cli, task: &str, context: Option<String>) -> anyhow::Result<()> {
    let settings = Settings::new_with_cli(cli)?;
    let context = context.map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)));

    let swarm = SwarmOrchestrator::from_settings(settings, Some(cli.config.as_path()))?;
    swarm.initialize().await?;

    let outcome = tokio::select! {
        outcome = swarm.execute_task_with_context(task, context) => Some(outcome),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            None
        }
    };
    swarm.shutdown().await;

    if let Some(outcome) = outcome {
        let results = outcome?;
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    Ok(())
}

async fn agent_server(
    cli: &Cli,
    name: &str,
    listen: Option<u16>,
    definition: Option<String>,
) -> anyhow::Result<()> {
    let settings = match Settings::new_with_cli(cli) {
        Ok(settings) => settings,
        Err(e) if definition.is_some() => {
            warn!("Ignoring configuration ({}), using the supplied definition", e);
            Settings::default()
        }
        Err(e) => return Err(e),
    };

    let agent: AgentDefinition = match definition {
        Some(json) => serde_json::from_str(&json)?,
        None => settings
            .agent(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Agent '{}' is not defined in {}", name, cli.config.display()))?,
    };

    let model = Arc::new(CommandModelCli::new(
        CommandTable::new(settings.models.clone()),
        settings.swarm.model_timeout(),
    ));
    let handler = Arc::new(AgentToolHandler::new(agent.clone(), model, settings.swarm.history_turns));
    let server = ProtocolServer::new(
        handler,
        Implementation {
            name: format!("agentmesh-{}", agent.name),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )
    .with_instructions(format!("Tools for talking to the '{}' agent", agent.name));

    match listen {
        Some(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            info!(agent = %agent.name, "Serving on 127.0.0.1:{}", port);
            server.serve_tcp(listener).await
        }
        None => {
            info!(agent = %agent.name, "Serving on stdio");
            server.serve_stdio().await
        }
    }
}

fn validate(cli: &Cli) -> anyhow::Result<()> {
    let settings = Settings::new_with_cli(cli)?;

    println!("Configuration OK: {}", cli.config.display());
    println!(
        "  main agent: {}",
        settings.swarm.main_agent.as_deref().unwrap_or("(none)")
    );
    println!("  max delegation depth: {}", settings.swarm.max_delegation_depth);
    println!("  agents: {}", settings.agents.len());
    for agent in &settings.agents {
        let connections: Vec<&str> = agent.connections.iter().map(String::as_str).collect();
        println!(
            "    {} ({}){}{}",
            agent.name,
            agent.model,
            if agent.expose_as_server { " [server]" } else { "" },
            if connections.is_empty() {
                String::new()
            } else {
                format!(" -> {}", connections.join(", "))
            }
        );
    }
    println!("  tool servers: {}", settings.tool_servers.len());
    for server in &settings.tool_servers {
        println!(
            "    {}{}",
            server.name,
            if server.enabled { "" } else { " (disabled)" }
        );
    }
    Ok(())
}

async fn peers(
    cli: &Cli,
    root: &Path,
    agent_type: &str,
    strategy: SpawnStrategy,
    model: &str,
    message: &str,
) -> anyhow::Result<()> {
    let settings = Settings::new_with_cli(cli)?;
    let launcher = LocalProcessLauncher::from_settings(&settings)?.with_config_path(&cli.config);
    let network = PeerNetwork::new(Arc::new(launcher));

    let spawned = network
        .spawn_agents_for_codebase(root, agent_type, strategy, model)
        .await?;
    info!("{} peer agent(s) ready", spawned.len());

    let replies = network.broadcast("user", message).await;
    network.shutdown().await;

    let replies: serde_json::Map<String, Value> = replies
        .into_iter()
        .map(|(agent, reply)| (agent, Value::String(reply)))
        .collect();
    println!("{}", serde_json::to_string_pretty(&replies)?);
    Ok(())
}
