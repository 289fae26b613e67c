//! Model command-line integrations
//!
//! Agents never talk to a model API directly. Each model id maps to an
//! external CLI that reads a prompt on stdin and prints the answer on stdout:
//! - `claude`, `opus`, `sonnet`, `haiku` → `claude --print --model <id>`
//! - `gemini` → `gemini --model <id>`
//! - `gpt`, `o1`, `o3`, `o4`, `codex` → `codex exec --model <id> -`
//! - `ollama:<name>` → `ollama run <name>`

mod command;

pub use command::CommandModelCli;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::agents::error::{LlmError, LlmResult};
use crate::agents::launcher::{ENV_AGENT_MODEL, ENV_AGENT_NAME};
use crate::config::ModelCommandConfig;

/// Placeholder substituted with the model id in command arguments
pub const MODEL_PLACEHOLDER: &str = "{model}";

/// One request to a model
#[derive(Debug, Clone)]
pub struct ModelInvocation {
    pub agent: String,
    pub model: String,
    pub prompt: String,
    /// Directory the CLI runs in
    pub working_directory: PathBuf,
    /// Extra environment for the CLI process
    pub env: Vec<(String, String)>,
}

impl ModelInvocation {
    pub fn new(
        agent: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent: agent.into(),
            model: model.into(),
            prompt: prompt.into(),
            working_directory: working_directory.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Tags the CLI process with the agent it runs for.
    pub fn for_agent_process(self) -> Self {
        let (agent, model) = (self.agent.clone(), self.model.clone());
        self.with_env(ENV_AGENT_NAME, agent)
            .with_env(ENV_AGENT_MODEL, model)
    }
}

/// Something that turns a prompt into model output
#[async_trait]
pub trait ModelCli: Send + Sync {
    async fn invoke(&self, invocation: ModelInvocation) -> LlmResult<String>;
}

/// Built-in model families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Gemini,
    Codex,
    Ollama,
}

impl ModelFamily {
    /// Family and the model argument passed to its CLI.
    pub fn detect(model: &str) -> Option<(ModelFamily, String)> {
        if let Some(name) = model.strip_prefix("ollama:") {
            return Some((ModelFamily::Ollama, name.to_string()));
        }

        let lower = model.to_ascii_lowercase();
        let family = if ["claude", "opus", "sonnet", "haiku"]
            .iter()
            .any(|p| lower.starts_with(p))
        {
            ModelFamily::Claude
        } else if lower.starts_with("gemini") {
            ModelFamily::Gemini
        } else if ["gpt", "o1", "o3", "o4", "codex"]
            .iter()
            .any(|p| lower.starts_with(p))
        {
            ModelFamily::Codex
        } else {
            return None;
        };
        Some((family, model.to_string()))
    }

    /// Key used for `[models.<key>]` overrides
    pub fn key(&self) -> &'static str {
        match self {
            ModelFamily::Claude => "claude",
            ModelFamily::Gemini => "gemini",
            ModelFamily::Codex => "codex",
            ModelFamily::Ollama => "ollama",
        }
    }

    fn default_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ModelFamily::Claude => ("claude", &["--print", "--model", MODEL_PLACEHOLDER]),
            ModelFamily::Gemini => ("gemini", &["--model", MODEL_PLACEHOLDER]),
            ModelFamily::Codex => ("codex", &["exec", "--model", MODEL_PLACEHOLDER, "-"]),
            ModelFamily::Ollama => ("ollama", &["run", MODEL_PLACEHOLDER]),
        }
    }
}

/// A resolved program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Model id → command mapping, with configured overrides
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    overrides: BTreeMap<String, ModelCommandConfig>,
}

impl CommandTable {
    pub fn new(overrides: BTreeMap<String, ModelCommandConfig>) -> Self {
        Self { overrides }
    }

    /// Resolve a model id. Overrides keyed by a built-in family replace that
    /// family's command; other override keys match model ids by prefix.
    pub fn resolve(&self, model: &str) -> LlmResult<ModelCommand> {
        if let Some((family, model_arg)) = ModelFamily::detect(model) {
            if let Some(custom) = self.overrides.get(family.key()) {
                return Ok(Self::substitute(&custom.command, &custom.args, &model_arg));
            }
            let (program, args) = family.default_command();
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            return Ok(Self::substitute(program, &args, &model_arg));
        }

        self.overrides
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, custom)| Self::substitute(&custom.command, &custom.args, model))
            .ok_or_else(|| LlmError::UnknownModel(model.to_string()))
    }

    fn substitute(program: &str, args: &[String], model: &str) -> ModelCommand {
        ModelCommand {
            program: program.to_string(),
            args: args
                .iter()
                .map(|a| a.replace(MODEL_PLACEHOLDER, model))
                .collect(),
        }
    }
}
