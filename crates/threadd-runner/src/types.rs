//! Types for Claude CLI stream-json output

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result subtype emitted when the CLI stops at `--max-turns`
pub const MAX_TURNS_SUBTYPE: &str = "error_max_turns";

/// Runner configuration options
pub struct RunOptions {
    /// The prompt to send
    pub prompt: String,
    /// Appended to the CLI's default system prompt
    pub system_prompt: Option<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Resume session ID
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    /// Tools the CLI may run without asking; empty leaves its defaults
    pub allowed_tools: Vec<String>,
    /// Timeout duration (default: 10 minutes)
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// Progress callback
    pub on_progress: Option<ProgressCallback>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            system_prompt: None,
            cwd: None,
            session_id: None,
            model: None,
            max_turns: None,
            allowed_tools: Vec::new(),
            timeout: Duration::from_secs(10 * 60),
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }
}

/// Progress callback type
pub type ProgressCallback = Box<dyn Fn(&StreamEvent) + Send + Sync>;

/// Execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Session ID (can be used for --resume)
    pub session_id: String,
    /// Final result text
    pub result: String,
    pub subtype: String,
    pub is_error: bool,
    pub duration_ms: u64,
    pub num_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    pub usage: Usage,
    /// Model reported by the init event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Every assistant block and tool result, in stream order
    pub blocks: Vec<ContentBlock>,
}

impl RunResult {
    pub fn hit_max_turns(&self) -> bool {
        self.subtype == MAX_TURNS_SUBTYPE
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

/// Stream event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    User(UserEvent),
    Result(ResultEvent),
}

/// System event (`init` carries the session and model)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Assistant event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
}

/// Assistant message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
}

/// User event; carries tool results back to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEvent {
    pub message: UserMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: UserContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Result event from stream-json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub subtype: String,
    pub session_id: String,
    /// Absent on `error_max_turns`
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<RawUsage>,
}

/// Raw usage from Claude CLI (snake_case)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl From<RawUsage> for Usage {
    fn from(u: RawUsage) -> Self {
        Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_input_tokens: u.cache_read_input_tokens,
            cache_creation_input_tokens: u.cache_creation_input_tokens,
        }
    }
}

/// Content block in assistant / user messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        /// String or list of `{type: text}` parts
        #[serde(default)]
        content: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
}

/// Flatten a tool result payload to plain text
pub fn tool_result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Run cancelled")]
    Cancelled,

    #[error("Run timed out after {0:?}")]
    Timeout(Duration),

    #[error("Claude CLI failed: {0}")]
    CliFailed(String),

    #[error("No result from Claude CLI: {0}")]
    NoResult(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
