//! Multi-agent orchestration
//!
//! - `swarm`: configured agents served over the tool protocol, with
//!   delegation parsed from the main agent's output
//! - `peer_network`: ad-hoc agents per file or directory that exchange
//!   messages
//! - `delegation`: the `DELEGATE TO [agent]: task` directive parser

pub mod delegation;
pub mod peer_network;
pub mod swarm;


pub use delegation::{authorize, parse_delegations};
pub use peer_network::{partition_codebase, PeerAgentConfig, PeerAgentInfo, PeerNetwork, SpawnStrategy};
pub use swarm::SwarmOrchestrator;
