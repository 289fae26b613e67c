use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::config::{AgentDefinition, Settings, ToolServerConfig};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Cross-reference error: {0}")]
    CrossReference(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),
}

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(settings: &Settings) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_swarm(settings) {
            errors.extend(e);
        }

        if let Err(e) = Self::validate_agents(&settings.agents) {
            errors.extend(e);
        }

        if let Err(e) = Self::validate_tool_servers(&settings.tool_servers) {
            errors.extend(e);
        }

        if let Err(e) = Self::validate_cross_references(settings) {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_swarm(settings: &Settings) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let swarm = &settings.swarm;

        if let Some(main) = &swarm.main_agent {
            if main.is_empty() {
                errors.push(ValidationError::MissingField("swarm.main_agent".to_string()));
            } else if settings.agent(main).is_none() {
                errors.push(ValidationError::CrossReference(format!(
                    "Main agent '{}' is not defined",
                    main
                )));
            }
        }

        if swarm.call_timeout_secs == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "swarm.call_timeout_secs".to_string(),
                reason: "Timeout must be greater than 0".to_string(),
            });
        }

        if swarm.model_timeout_secs == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "swarm.model_timeout_secs".to_string(),
                reason: "Timeout must be greater than 0".to_string(),
            });
        }

        if let Some(command) = &swarm.agent_server_command {
            if command.is_empty() || command[0].is_empty() {
                errors.push(ValidationError::InvalidValue {
                    field: "swarm.agent_server_command".to_string(),
                    reason: "Command must name an executable".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_agents(agents: &[AgentDefinition]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut seen_names = HashMap::new();

        for (idx, agent) in agents.iter().enumerate() {
            if let Some(prev_idx) = seen_names.insert(&agent.name, idx) {
                errors.push(ValidationError::Duplicate(format!(
                    "Agent name '{}' appears at indices {} and {}",
                    agent.name, prev_idx, idx
                )));
            }

            if agent.name.is_empty() {
                errors.push(ValidationError::MissingField(format!("agents[{}].name", idx)));
            }

            if agent.model.is_empty() {
                errors.push(ValidationError::MissingField(format!("agents[{}].model", idx)));
            }

            if agent.listen_port == Some(0) {
                errors.push(ValidationError::InvalidValue {
                    field: format!("agents[{}].listen_port", idx),
                    reason: "Port must be greater than 0".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_tool_servers(servers: &[ToolServerConfig]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut seen_names = HashMap::new();

        for (idx, server) in servers.iter().enumerate() {
            if let Some(prev_idx) = seen_names.insert(&server.name, idx) {
                errors.push(ValidationError::Duplicate(format!(
                    "Tool server name '{}' appears at indices {} and {}",
                    server.name, prev_idx, idx
                )));
            }

            if server.name.is_empty() {
                errors.push(ValidationError::MissingField(format!("tool_servers[{}].name", idx)));
            }

            if server.command.is_some() == server.address.is_some() {
                errors.push(ValidationError::InvalidValue {
                    field: format!("tool_servers[{}]", idx),
                    reason: "Exactly one of 'command' or 'address' must be provided".to_string(),
                });
            }

            for entry in &server.env {
                if !entry.contains('=') {
                    errors.push(ValidationError::InvalidValue {
                        field: format!("tool_servers[{}].env", idx),
                        reason: format!("'{}' is not a KEY=VALUE pair", entry),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_cross_references(settings: &Settings) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let agent_names: HashSet<&str> = settings.agents.iter().map(|a| a.name.as_str()).collect();
        let server_names: HashSet<&str> = settings
            .tool_servers
            .iter()
            .map(|t| t.name.as_str())
            .collect();

        for agent in &settings.agents {
            for target in &agent.connections {
                if !agent_names.contains(target.as_str()) {
                    errors.push(ValidationError::CrossReference(format!(
                        "Agent '{}' connects to undefined agent '{}'",
                        agent.name, target
                    )));
                }
            }

            for server in &agent.tool_servers {
                if !server_names.contains(server.as_str()) {
                    errors.push(ValidationError::CrossReference(format!(
                        "Agent '{}' references undefined tool server '{}'",
                        agent.name, server
                    )));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
