pub mod validator;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, File};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::protocol::{ServerConfig, TransportConfig};

/// Default settings file name looked up next to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "agentmesh.toml";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub swarm: SwarmSettings,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    /// Per-family overrides of the model command table
    #[serde(default)]
    pub models: BTreeMap<String, ModelCommandConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SwarmSettings {
    /// Agent that receives top-level tasks
    #[serde(default)]
    pub main_agent: Option<String>,
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: u32,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,
    /// Conversation turns replayed into chat prompts
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Command line used to start agent servers. Defaults to this executable.
    #[serde(default)]
    pub agent_server_command: Option<Vec<String>>,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            main_agent: None,
            max_delegation_depth: default_max_delegation_depth(),
            call_timeout_secs: default_call_timeout_secs(),
            model_timeout_secs: default_model_timeout_secs(),
            history_turns: default_history_turns(),
            agent_server_command: None,
        }
    }
}

impl SwarmSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }
}

fn default_max_delegation_depth() -> u32 {
    5
}

fn default_call_timeout_secs() -> u64 {
    300
}

fn default_model_timeout_secs() -> u64 {
    600
}

fn default_history_turns() -> usize {
    10
}

fn default_working_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_enabled() -> bool {
    true
}

/// One configured agent. Read-only once validated.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    pub model: String,
    #[serde(default)]
    pub prompt_template: String,
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    /// Agents this one may delegate to
    #[serde(default)]
    pub connections: BTreeSet<String>,
    #[serde(default)]
    pub expose_as_server: bool,
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Names of `tool_servers` entries this agent depends on
    #[serde(default, alias = "declared_tools")]
    pub tool_servers: Vec<String>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            working_directory: default_working_directory(),
            model: model.into(),
            prompt_template: String::new(),
            allowed_tools: BTreeSet::new(),
            connections: BTreeSet::new(),
            expose_as_server: false,
            listen_port: None,
            tool_servers: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompt(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_connections<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connections = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn exposed(mut self) -> Self {
        self.expose_as_server = true;
        self
    }

    pub fn can_delegate_to(&self, agent: &str) -> bool {
        self.connections.contains(agent)
    }
}

/// External protocol server reachable by command or socket address
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ToolServerConfig {
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs added to the spawned process environment
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ToolServerConfig {
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Protocol-level connection settings, or `None` when neither a command
    /// nor an address is configured.
    pub fn server_config(&self, call_timeout: Duration) -> Option<ServerConfig> {
        let transport = match (&self.command, &self.address) {
            (Some(command), _) => TransportConfig::Stdio {
                command: command.clone(),
                args: self.args.clone(),
                env: self.env_pairs(),
                cwd: None,
            },
            (None, Some(address)) => TransportConfig::tcp(address.clone()),
            (None, None) => return None,
        };
        Some(ServerConfig {
            id: self.name.clone(),
            transport,
            call_timeout,
        })
    }
}

/// Replacement command for one model family. `{model}` in `args` is
/// substituted with the model id.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ModelCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Settings {
    /// Load `agentmesh.toml` (or the given file) plus `config/agents/*`
    /// next to it, then validate.
    pub fn load(config_path: &Path) -> Result<Self, anyhow::Error> {
        let root = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let s = Config::builder()
            .add_source(File::from(config_path.to_path_buf()).required(false))
            .set_default("swarm.max_delegation_depth", default_max_delegation_depth() as i64)?
            .set_default("swarm.call_timeout_secs", default_call_timeout_secs() as i64)?
            .set_default("swarm.model_timeout_secs", default_model_timeout_secs() as i64)?
            .set_default("swarm.history_turns", default_history_turns() as i64)?
            .build()?;

        let mut settings: Settings = s.try_deserialize()?;
        settings.load_agents_from_dir(&root.join("config").join("agents"))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_root(root: &Path) -> Result<Self, anyhow::Error> {
        Self::load(&root.join(DEFAULT_CONFIG_FILE))
    }

    /// Load from the CLI's config path, with CLI flags taking precedence.
    pub fn new_with_cli(cli: &Cli) -> Result<Self, anyhow::Error> {
        let mut settings = Self::load(&cli.config)?;
        if settings.apply_cli_overrides(cli) {
            settings.validate()?;
        }
        Ok(settings)
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) -> bool {
        let mut changed = false;
        if let Some(main_agent) = &cli.main_agent {
            self.swarm.main_agent = Some(main_agent.clone());
            changed = true;
        }
        if let Some(depth) = cli.max_depth {
            self.swarm.max_delegation_depth = depth;
            changed = true;
        }
        if let Some(timeout) = cli.call_timeout {
            self.swarm.call_timeout_secs = timeout;
            changed = true;
        }
        changed
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        validator::ConfigValidator::validate(self).map_err(|errors| {
            let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            anyhow::anyhow!(
                "Configuration validation failed:\n{}",
                error_messages.join("\n")
            )
        })
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn tool_server(&self, name: &str) -> Option<&ToolServerConfig> {
        self.tool_servers.iter().find(|t| t.name == name)
    }

    /// Merge another Settings into this one; `other` wins on conflicts.
    pub fn merge(&mut self, other: Settings) {
        self.swarm = other.swarm;
        Self::merge_vec_by_key(&mut self.agents, other.agents, |a| a.name.clone());
        Self::merge_vec_by_key(&mut self.tool_servers, other.tool_servers, |t| t.name.clone());
        self.models.extend(other.models);
    }

    /// Items from `other` replace items in `base` with the same key; new
    /// keys are appended.
    fn merge_vec_by_key<T, K, F>(base: &mut Vec<T>, other: Vec<T>, key_fn: F)
    where
        K: Eq + std::hash::Hash,
        F: Fn(&T) -> K,
    {
        use std::collections::HashMap;

        let mut key_to_index: HashMap<K, usize> = HashMap::new();
        for (i, item) in base.iter().enumerate() {
            key_to_index.insert(key_fn(item), i);
        }

        for item in other {
            let key = key_fn(&item);
            if let Some(&idx) = key_to_index.get(&key) {
                base[idx] = item;
            } else {
                key_to_index.insert(key, base.len());
                base.push(item);
            }
        }
    }

    fn load_agents_from_dir(&mut self, dir: &Path) -> Result<(), anyhow::Error> {
        let pattern = format!("{}/*", dir.display());
        let mut loaded = Vec::new();
        for entry in glob::glob(&pattern)? {
            match entry {
                Ok(path) => {
                    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                        if matches!(ext, "json" | "yaml" | "yml" | "toml") {
                            let content = std::fs::read_to_string(&path)?;
                            let agent: AgentDefinition = match ext {
                                "json" => serde_json::from_str(&content)?,
                                "toml" => toml::from_str(&content)?,
                                _ => serde_yaml::from_str(&content)?,
                            };
                            tracing::debug!("Loaded agent '{}' from {}", agent.name, path.display());
                            loaded.push(agent);
                        }
                    }
                }
                Err(e) => tracing::warn!("Failed to read glob entry: {}", e),
            }
        }
        Self::merge_vec_by_key(&mut self.agents, loaded, |a| a.name.clone());
        Ok(())
    }
}
