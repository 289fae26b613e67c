//! # agentmesh - agent-to-agent tool protocol and swarm orchestration
//!
//! agentmesh wraps external model-driving CLIs (`claude`, `gemini`, `codex`,
//! `ollama`) as agents and lets them call each other as tools.
//!
//! ## Features
//!
//! - **Tool protocol**: line-delimited JSON-RPC 2.0 over a child's stdio or TCP
//! - **Agent-as-server**: every agent exposes `chat_with_*`, `ask_*`,
//!   `delegate_to_*`, `get_*_status` and `request_*_expertise`
//! - **Swarm orchestration**: `DELEGATE TO [agent]: task` directives fan out
//!   in parallel, bounded by a delegation depth guard
//! - **Peer network**: one agent per file or directory, with broadcast messaging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agentmesh::agents::orchestration::SwarmOrchestrator;
//! use agentmesh::config::Settings;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(Path::new("agentmesh.toml"))?;
//!     let swarm = SwarmOrchestrator::from_settings(settings, None)?;
//!     swarm.initialize().await?;
//!     let results = swarm.execute_task("Build a login page").await?;
//!     println!("{} agent(s) ran", results.len());
//!     swarm.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Domain**: protocol types and the `ToolPort` port
//! - **Protocol**: transports, session client, server loop
//! - **Agents**: the tool adapter, model CLIs, launcher and orchestration
//! - **Config**: settings loading and validation

pub mod agents;
pub mod cli;
pub mod config;
pub mod domain;
pub mod protocol;
