use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub mod mcp_types;

/// Tool advertised by a protocol server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "default_input_schema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    json!({ "type": "object" })
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Prompt {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One content block of a tool result.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
    Json { data: Value },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Result payload of `tools/call`.
///
/// `is_error` marks a failure the tool itself reported. The request still
/// succeeded at the protocol level.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: true,
        }
    }

    pub fn json(data: Value) -> Self {
        Self {
            content: vec![Content::Json { data }],
            is_error: false,
        }
    }

    /// Concatenated text of every content block; JSON blocks are rendered compactly.
    pub fn text(&self) -> String {
        let mut output = String::new();
        for item in &self.content {
            if !output.is_empty() {
                output.push('\n');
            }
            match item {
                Content::Text { text } => output.push_str(text),
                Content::Json { data } => output.push_str(&data.to_string()),
            }
        }
        output
    }
}

/// Failures a tool handler reports back to the protocol server.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),
}

impl ToolError {
    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i64 {
        match self {
            ToolError::NotFound(_) => mcp_types::METHOD_NOT_FOUND,
            ToolError::InvalidArguments(_) => mcp_types::INVALID_PARAMS,
            ToolError::Execution(_) => mcp_types::INTERNAL_ERROR,
        }
    }
}

#[async_trait]
pub trait ToolPort: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>>;

    async fn execute_tool(&self, name: &str, args: Value) -> Result<CallToolResult, ToolError>;

    async fn list_resources(&self) -> anyhow::Result<Vec<Resource>> {
        Ok(Vec::new())
    }

    async fn list_prompts(&self) -> anyhow::Result<Vec<Prompt>> {
        Ok(Vec::new())
    }
}
