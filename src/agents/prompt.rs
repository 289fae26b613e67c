//! Prompt construction for agents
//!
//! Base prompts are Tera templates rendered against the agent definition.
//! Every purpose-specific prompt starts from the base prompt and appends
//! its own framing.

use serde::Deserialize;
use serde_json::Value;
use tera::{Context, Tera};

use crate::config::AgentDefinition;

/// Syntax agents use to hand work to each other
pub const DELEGATION_SYNTAX: &str = "DELEGATE TO [agent_name]: task description";

/// Render the agent's prompt template.
///
/// Available variables: `agent_name`, `model`, `working_directory`,
/// `description`. A template that fails to render is used verbatim.
pub fn render_base_prompt(agent: &AgentDefinition) -> String {
    let template = agent.prompt_template.trim();
    if template.is_empty() {
        return if agent.description.is_empty() {
            format!("You are {}.", agent.name)
        } else {
            format!("You are {}. {}", agent.name, agent.description)
        };
    }

    if !template.contains("{{") && !template.contains("{%") {
        return template.to_string();
    }

    let mut context = Context::new();
    context.insert("agent_name", &agent.name);
    context.insert("model", &agent.model);
    context.insert(
        "working_directory",
        &agent.working_directory.display().to_string(),
    );
    context.insert("description", &agent.description);

    match Tera::one_off(template, &context, false) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!("Failed to render prompt template for '{}': {}", agent.name, e);
            template.to_string()
        }
    }
}

/// Render caller context as prompt text. Strings are used as-is, anything
/// else is pretty-printed JSON.
pub fn format_context(context: &Value) -> String {
    match context {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn push_context(prompt: &mut String, context: Option<&Value>) {
    if let Some(context) = context.filter(|c| !c.is_null()) {
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(&format_context(context));
    }
}

/// Full prompt for a task run by the swarm orchestrator.
///
/// `roster` lists every agent as `(name, description)`; the agent itself is
/// left out of the catalogue.
pub fn build_task_prompt(
    agent: &AgentDefinition,
    task: &str,
    context: Option<&Value>,
    roster: &[(String, String)],
) -> String {
    let mut prompt = render_base_prompt(agent);
    push_context(&mut prompt, context);

    prompt.push_str("\n\nTask:\n");
    prompt.push_str(task);

    let others: Vec<&(String, String)> = roster.iter().filter(|(name, _)| *name != agent.name).collect();
    if !others.is_empty() {
        prompt.push_str("\n\nOther agents in this team:\n");
        for (name, description) in others {
            if description.is_empty() {
                prompt.push_str(&format!("- {}\n", name));
            } else {
                prompt.push_str(&format!("- {}: {}\n", name, description));
            }
        }
    }

    if !agent.connections.is_empty() {
        let allowed: Vec<&str> = agent.connections.iter().map(String::as_str).collect();
        prompt.push_str(&format!(
            "\nYou may delegate to: {}\nTo delegate, write one line per sub-task in the form:\n{}\n",
            allowed.join(", "),
            DELEGATION_SYNTAX
        ));
    }

    prompt
}

/// Conversational prompt with recent history replayed
pub fn build_chat_prompt(
    agent: &AgentDefinition,
    message: &str,
    history: &[String],
    context: Option<&Value>,
) -> String {
    let mut prompt = render_base_prompt(agent);
    push_context(&mut prompt, context);

    if !history.is_empty() {
        prompt.push_str("\n\nConversation so far:\n");
        prompt.push_str(&history.join("\n"));
    }

    prompt.push_str(&format!("\n\nUser: {}\nAgent:", message));
    prompt
}

pub fn build_ask_prompt(agent: &AgentDefinition, question: &str, context: Option<&Value>) -> String {
    let mut prompt = render_base_prompt(agent);
    push_context(&mut prompt, context);
    prompt.push_str(&format!(
        "\n\nQuestion:\n{}\n\nAnswer directly and concisely.",
        question
    ));
    prompt
}

pub fn build_delegate_prompt(
    agent: &AgentDefinition,
    task: &str,
    from_agent: Option<&str>,
    context: Option<&Value>,
) -> String {
    let mut prompt = render_base_prompt(agent);
    push_context(&mut prompt, context);
    match from_agent {
        Some(from) => prompt.push_str(&format!("\n\nTask delegated by {}:\n{}", from, task)),
        None => prompt.push_str(&format!("\n\nDelegated task:\n{}", task)),
    }
    prompt.push_str("\n\nComplete the task and report the result.");
    prompt
}

/// Requested thoroughness of an expertise answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExpertiseDepth {
    Brief,
    #[default]
    Detailed,
    Comprehensive,
}

impl ExpertiseDepth {
    fn guidance(&self) -> &'static str {
        match self {
            ExpertiseDepth::Brief => "Give a short answer of a few sentences.",
            ExpertiseDepth::Detailed => {
                "Give a detailed answer covering the key considerations and trade-offs."
            }
            ExpertiseDepth::Comprehensive => {
                "Give a comprehensive analysis including alternatives, risks and concrete recommendations."
            }
        }
    }
}

pub fn build_expertise_prompt(
    agent: &AgentDefinition,
    topic: &str,
    depth: ExpertiseDepth,
    context: Option<&Value>,
) -> String {
    let mut prompt = render_base_prompt(agent);
    push_context(&mut prompt, context);
    prompt.push_str(&format!(
        "\n\nYour expertise is requested on:\n{}\n\n{}",
        topic,
        depth.guidance()
    ));
    prompt
}
