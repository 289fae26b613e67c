//! Peer agent network
//!
//! A flat registry of agents spawned per unit of work (a file or a
//! directory) that talk to each other through their chat tools.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::agents::domain::ProcessStatus;
use crate::agents::error::{AgentError, AgentResult};
use crate::agents::handler::ToolKind;
use crate::agents::launcher::AgentLauncher;
use crate::config::AgentDefinition;
use crate::protocol::ToolCaller;

const SKIPPED_DIRS: [&str; 2] = ["target", "node_modules"];

/// Unit holding the files directly under the partitioned root.
pub const ROOT_UNIT: &str = ".";

/// How a codebase is split into agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SpawnStrategy {
    OnePerFile,
    OnePerDirectory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAgentConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub agent_type: String,
    pub model: String,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub assigned_files: Vec<PathBuf>,
}

impl PeerAgentConfig {
    /// Definition handed to the agent server. The file list goes into the
    /// description so it reaches the base prompt without template rendering.
    fn definition(&self) -> AgentDefinition {
        let mut description = if self.description.is_empty() {
            format!("A {} agent.", self.agent_type)
        } else {
            self.description.clone()
        };
        if !self.assigned_files.is_empty() {
            description.push_str("\n\nYou are responsible for these files:\n");
            for file in &self.assigned_files {
                description.push_str(&format!("- {}\n", file.display()));
            }
        }

        AgentDefinition::new(&self.id, &self.model)
            .with_description(description)
            .with_working_directory(&self.working_directory)
    }
}

/// Registry snapshot of one peer agent
#[derive(Debug, Clone, Serialize)]
pub struct PeerAgentInfo {
    pub config: PeerAgentConfig,
    pub status: ProcessStatus,
    pub last_error: Option<String>,
}

struct PeerAgent {
    config: PeerAgentConfig,
    status: ProcessStatus,
    session: Option<Arc<dyn ToolCaller>>,
    last_error: Option<String>,
    /// Registration this entry belongs to; a launch only attaches to its own.
    generation: u64,
}

pub struct PeerNetwork {
    launcher: Arc<dyn AgentLauncher>,
    agents: RwLock<HashMap<String, PeerAgent>>,
    generations: AtomicU64,
}

impl PeerNetwork {
    pub fn new(launcher: Arc<dyn AgentLauncher>) -> Self {
        Self {
            launcher,
            agents: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Register `config` under its id, replacing any previous entry, and
    /// start its agent server.
    ///
    /// If the id is registered again before this launch completes, the later
    /// registration wins and the session launched here is closed.
    pub async fn spawn_agent(&self, config: PeerAgentConfig) -> AgentResult<()> {
        let id = config.id.clone();
        let definition = config.definition();
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);

        let previous = self.agents.write().await.insert(
            id.clone(),
            PeerAgent {
                config,
                status: ProcessStatus::Starting,
                session: None,
                last_error: None,
                generation,
            },
        );
        if let Some(session) = previous.and_then(|p| p.session) {
            debug!(agent = %id, "Replacing existing peer agent");
            session.disconnect().await;
        }

        let launched = self.launcher.launch_agent(&definition, None).await;

        let stale = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(&id) {
                Some(entry) if entry.generation == generation => match launched {
                    Ok(launched) => {
                        entry.session = Some(launched.session);
                        entry.status = ProcessStatus::Ready;
                        entry.last_error = None;
                        info!(agent = %id, "Peer agent ready");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(agent = %id, "Peer agent failed to start: {}", e);
                        entry.status = ProcessStatus::Error;
                        entry.last_error = Some(e.to_string());
                        return Err(e);
                    }
                },
                Some(_) => {
                    debug!(agent = %id, "Registration replaced while launching");
                    AgentError::Internal(format!("peer agent '{}' was replaced while starting", id))
                }
                None => AgentError::NotFound(id.clone()),
            }
        };

        if let Ok(launched) = launched {
            launched.session.disconnect().await;
        }
        Err(stale)
    }

    /// Spawn one agent per partition of the files under `root`.
    ///
    /// Returns the ids that started; failed partitions stay registered with
    /// status `error`.
    pub async fn spawn_agents_for_codebase(
        &self,
        root: &Path,
        agent_type: &str,
        strategy: SpawnStrategy,
        model: &str,
    ) -> AgentResult<Vec<String>> {
        let partitions = partition_codebase(root, strategy)?;
        info!(
            "Spawning {} {} agent(s) over {}",
            partitions.len(),
            agent_type,
            root.display()
        );

        let mut taken = HashSet::new();
        let configs: Vec<PeerAgentConfig> = partitions
            .into_iter()
            .map(|(unit, files)| {
                let id = unique_id(format!("{}-{}", agent_type, slug(&unit)), &mut taken);
                let label = if unit == ROOT_UNIT { "top-level files" } else { unit.as_str() };
                PeerAgentConfig {
                    id,
                    description: format!("{} agent for {}", agent_type, label),
                    agent_type: agent_type.to_string(),
                    model: model.to_string(),
                    working_directory: root.to_path_buf(),
                    assigned_files: files,
                }
            })
            .collect();

        let outcomes = join_all(configs.into_iter().map(|config| async move {
            let id = config.id.clone();
            self.spawn_agent(config).await.map(|_| id)
        }))
        .await;

        let mut started: Vec<String> = outcomes.into_iter().filter_map(Result::ok).collect();
        started.sort();
        Ok(started)
    }

    async fn session(&self, id: &str) -> AgentResult<Arc<dyn ToolCaller>> {
        let agents = self.agents.read().await;
        let agent = agents
            .get(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        match (&agent.session, agent.status) {
            (Some(session), ProcessStatus::Ready) => Ok(session.clone()),
            (_, status) => Err(AgentError::Internal(format!("agent '{}' is {}", id, status))),
        }
    }

    /// Chat with `to`, using `from` as the conversation id.
    pub async fn send_message(&self, from: &str, to: &str, message: &str) -> AgentResult<String> {
        let session = self.session(to).await?;
        Ok(session
            .call_tool_text(
                &ToolKind::Chat.tool_name(to),
                json!({ "message": message, "conversation_id": from }),
            )
            .await?)
    }

    /// Send `message` to every ready agent except `from`.
    ///
    /// Returns `(agent, reply)` for the recipients that answered, sorted by
    /// agent id.
    pub async fn broadcast(&self, from: &str, message: &str) -> Vec<(String, String)> {
        let recipients: Vec<String> = {
            let agents = self.agents.read().await;
            agents
                .iter()
                .filter(|(id, agent)| id.as_str() != from && agent.status.is_ready())
                .map(|(id, _)| id.clone())
                .collect()
        };

        let replies = join_all(recipients.into_iter().map(|to| async move {
            match self.send_message(from, &to, message).await {
                Ok(reply) => Some((to, reply)),
                Err(e) => {
                    warn!("Broadcast from {} to {} failed: {}", from, to, e);
                    None
                }
            }
        }))
        .await;

        let mut replies: Vec<(String, String)> = replies.into_iter().flatten().collect();
        replies.sort_by(|a, b| a.0.cmp(&b.0));
        replies
    }

    /// Registry snapshot sorted by id
    pub async fn agents(&self) -> Vec<PeerAgentInfo> {
        let agents = self.agents.read().await;
        let mut infos: Vec<PeerAgentInfo> = agents.values().map(PeerAgent::info).collect();
        infos.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        infos
    }

    pub async fn get(&self, id: &str) -> Option<PeerAgentInfo> {
        self.agents.read().await.get(id).map(PeerAgent::info)
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<dyn ToolCaller>> = self
            .agents
            .write()
            .await
            .drain()
            .filter_map(|(_, agent)| agent.session)
            .collect();
        if sessions.is_empty() {
            return;
        }
        join_all(sessions.iter().map(|s| s.disconnect())).await;
        info!("Peer network shut down ({} session(s))", sessions.len());
    }
}

impl PeerAgent {
    fn info(&self) -> PeerAgentInfo {
        PeerAgentInfo {
            config: self.config.clone(),
            status: self.status,
            last_error: self.last_error.clone(),
        }
    }
}

fn is_skipped(relative: &Path) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
        }
        _ => false,
    })
}

/// Files under `root` grouped into work units, keyed by unit name.
///
/// Paths are relative to `root`. A file directly under `root` belongs to
/// [`ROOT_UNIT`] in one-per-directory mode.
pub fn partition_codebase(
    root: &Path,
    strategy: SpawnStrategy,
) -> AgentResult<BTreeMap<String, Vec<PathBuf>>> {
    let pattern = root.join("**").join("*");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| AgentError::Configuration(format!("non UTF-8 path: {}", root.display())))?;
    let entries = glob::glob(pattern)
        .map_err(|e| AgentError::Configuration(format!("invalid glob pattern: {}", e)))?;

    let mut units: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for entry in entries.flatten() {
        if !entry.is_file() {
            continue;
        }
        let Ok(relative) = entry.strip_prefix(root) else {
            continue;
        };
        if is_skipped(relative) {
            continue;
        }
        let relative = relative.to_path_buf();
        let unit = match strategy {
            SpawnStrategy::OnePerFile => relative.to_string_lossy().into_owned(),
            SpawnStrategy::OnePerDirectory => match relative.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => {
                    parent.to_string_lossy().into_owned()
                }
                _ => ROOT_UNIT.to_string(),
            },
        };
        units.entry(unit).or_default().push(relative);
    }

    for files in units.values_mut() {
        files.sort();
    }
    Ok(units)
}

fn slug(unit: &str) -> String {
    let slug: String = unit
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    match slug.trim_matches('-') {
        "" => "root".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// `base`, or `base-2`, `base-3`, ... for the first one not yet taken.
fn unique_id(base: String, taken: &mut HashSet<String>) -> String {
    let mut id = base.clone();
    let mut n = 2;
    while !taken.insert(id.clone()) {
        id = format!("{}-{}", base, n);
        n += 1;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use crate::agents::test_support::MockLauncher;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for file in [
            "README.md",
            "src/main.rs",
            "src/lib.rs",
            "src/net/tcp.rs",
            ".git/config",
            "target/debug/app",
            "web/node_modules/react/index.js",
            "web/app.ts",
        ] {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "x").unwrap();
        }
        dir
    }

    #[test]
    fn test_one_per_file_skips_hidden_and_build_dirs() {
        let dir = tree();
        let units = partition_codebase(dir.path(), SpawnStrategy::OnePerFile).unwrap();
        let names: Vec<&str> = units.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec!["README.md", "src/lib.rs", "src/main.rs", "src/net/tcp.rs", "web/app.ts"]
        );
        assert_eq!(units["src/main.rs"], vec![PathBuf::from("src/main.rs")]);
    }

    #[test]
    fn test_one_per_directory_groups_files() {
        let dir = tree();
        let units = partition_codebase(dir.path(), SpawnStrategy::OnePerDirectory).unwrap();
        let names: Vec<&str> = units.keys().map(String::as_str).collect();
        assert_eq!(names, vec![".", "src", "src/net", "web"]);
        assert_eq!(units["."], vec![PathBuf::from("README.md")]);
        assert_eq!(
            units["src"],
            vec![PathBuf::from("src/lib.rs"), PathBuf::from("src/main.rs")]
        );
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("src/net/tcp.rs"), "src-net-tcp-rs");
        assert_eq!(slug("README.md"), "readme-md");
        assert_eq!(slug(ROOT_UNIT), "root");
    }

    #[test]
    fn test_unique_id_suffixes_collisions() {
        let mut taken = HashSet::new();
        assert_eq!(unique_id("r-a-b".to_string(), &mut taken), "r-a-b");
        assert_eq!(unique_id("r-a-b".to_string(), &mut taken), "r-a-b-2");
        assert_eq!(unique_id("r-a-b-2".to_string(), &mut taken), "r-a-b-2-2");
        assert_eq!(unique_id("r-a-b".to_string(), &mut taken), "r-a-b-3");
    }

    #[tokio::test]
    async fn test_colliding_units_get_distinct_agents() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["a-b.rs", "a/b.rs", "README.md", "readme.md"] {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "x").unwrap();
        }
        let network = PeerNetwork::new(Arc::new(MockLauncher::new()));

        let ids = network
            .spawn_agents_for_codebase(dir.path(), "r", SpawnStrategy::OnePerFile, "claude-sonnet")
            .await
            .unwrap();

        assert_eq!(ids, vec!["r-a-b-rs", "r-a-b-rs-2", "r-readme-md", "r-readme-md-2"]);
        let agents = network.agents().await;
        assert_eq!(agents.len(), 4);
        for agent in &agents {
            assert_eq!(agent.config.assigned_files.len(), 1, "{}", agent.config.id);
        }
        network.shutdown().await;
    }

    #[tokio::test]
    async fn test_root_directory_does_not_merge_with_top_level_files() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["Cargo.toml", "root/lib.rs"] {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "x").unwrap();
        }
        let network = PeerNetwork::new(Arc::new(MockLauncher::new()));

        let ids = network
            .spawn_agents_for_codebase(dir.path(), "r", SpawnStrategy::OnePerDirectory, "claude-sonnet")
            .await
            .unwrap();

        assert_eq!(ids, vec!["r-root", "r-root-2"]);
        assert_eq!(
            network.get("r-root").await.unwrap().config.assigned_files,
            vec![PathBuf::from("Cargo.toml")]
        );
        assert_eq!(
            network.get("r-root-2").await.unwrap().config.assigned_files,
            vec![PathBuf::from("root/lib.rs")]
        );
        network.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_launch_does_not_replace_newer_registration() {
        let launcher = Arc::new(MockLauncher::new().slow_first_launch(Duration::from_millis(100)));
        let network = PeerNetwork::new(launcher.clone());
        let config = |description: &str| PeerAgentConfig {
            id: "dup".to_string(),
            description: description.to_string(),
            agent_type: "reviewer".to_string(),
            model: "claude-sonnet".to_string(),
            working_directory: PathBuf::from("."),
            assigned_files: Vec::new(),
        };

        let (first, second) = tokio::join!(network.spawn_agent(config("first")), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            network.spawn_agent(config("second")).await
        });
        assert!(first.is_err());
        second.unwrap();

        let sessions = launcher.sessions("dup");
        assert_eq!(sessions.len(), 2);
        let (live, stale) = (&sessions[0], &sessions[1]);
        assert!(stale.is_closed());
        assert!(!live.is_closed());

        let info = network.get("dup").await.unwrap();
        assert_eq!(info.config.description, "second");
        assert_eq!(info.status, ProcessStatus::Ready);

        network.send_message("user", "dup", "hello").await.unwrap();
        assert_eq!(live.calls().len(), 1);
        assert!(stale.calls().is_empty());

        network.shutdown().await;
    }

    #[test]
    fn test_definition_lists_assigned_files() {
        let config = PeerAgentConfig {
            id: "reviewer-src".to_string(),
            description: String::new(),
            agent_type: "reviewer".to_string(),
            model: "claude-sonnet".to_string(),
            working_directory: PathBuf::from("/repo"),
            assigned_files: vec![PathBuf::from("src/lib.rs")],
        };
        let definition = config.definition();
        assert_eq!(definition.name, "reviewer-src");
        assert_eq!(definition.working_directory, PathBuf::from("/repo"));
        assert!(definition.description.contains("- src/lib.rs"));
        assert!(definition.description.starts_with("A reviewer agent."));
    }

    #[test]
    fn test_strategy_names() {
        use clap::ValueEnum;
        let names: Vec<String> = SpawnStrategy::value_variants()
            .iter()
            .filter_map(|v| v.to_possible_value())
            .map(|v| v.get_name().to_string())
            .collect();
        assert_eq!(names, vec!["one-per-file", "one-per-directory"]);
        assert_eq!(
            serde_json::to_string(&SpawnStrategy::OnePerDirectory).unwrap(),
            "\"one-per-directory\""
        );
    }
}
