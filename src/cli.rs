use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::agents::launcher::{ENV_AGENT_NAME, ENV_CONFIG};
use crate::agents::orchestration::SpawnStrategy;

/// agentmesh - teams of model-driving CLIs talking over a JSON-RPC tool protocol
#[derive(Parser, Debug, Clone)]
#[command(name = "agentmesh", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = ENV_CONFIG, default_value = "agentmesh.toml")]
    pub config: PathBuf,

    /// Override the main agent
    #[arg(long, global = true, env = "AGENTMESH_MAIN_AGENT")]
    pub main_agent: Option<String>,

    /// Override the maximum delegation depth
    #[arg(long, global = true, env = "AGENTMESH_MAX_DEPTH")]
    pub max_depth: Option<u32>,

    /// Override the per-call protocol timeout, in seconds
    #[arg(long, global = true, env = "AGENTMESH_CALL_TIMEOUT")]
    pub call_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a task on the main agent and everything it delegates
    Run {
        task: String,

        /// JSON (or plain text) context passed to every agent
        #[arg(long)]
        context: Option<String>,
    },

    /// Serve one agent's tools over stdio, or TCP with --listen
    AgentServer {
        #[arg(long, env = ENV_AGENT_NAME)]
        agent: String,

        #[arg(long)]
        listen: Option<u16>,

        /// Agent definition as JSON, used instead of the config file entry
        #[arg(long)]
        definition: Option<String>,
    },

    /// Load and validate the configuration
    Validate,

    /// Spawn a peer network over a codebase and broadcast a message
    Peers {
        #[arg(long, default_value = ".")]
        root: PathBuf,

        #[arg(long, default_value = "reviewer")]
        agent_type: String,

        #[arg(long, value_enum, default_value_t = SpawnStrategy::OnePerDirectory)]
        strategy: SpawnStrategy,

        #[arg(long, default_value = "claude-sonnet-4-5")]
        model: String,

        message: String,
    },
}
