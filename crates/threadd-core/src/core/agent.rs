//! Reasoning agent boundary
//!
//! The orchestrator only needs: send messages (fresh or resumed), get back
//! content blocks, usage, a stop reason and the session handle to resume with.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::types::{content_text, ContentBlock, Direction, TokenUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub direction: Direction,
    pub actor: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub thread_id: String,
    /// Resume this session instead of starting fresh
    pub session_id: Option<String>,
    /// Context layers to prepend (full stack or delta)
    pub context: Option<String>,
    /// Prior conversation, replayed only for fresh sessions
    pub history: Vec<AgentMessage>,
    /// Message for this turn
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    /// The agent ran out of turns mid-task; a continuation turn can resume it
    MaxTurns,
    Other(String),
}

impl StopReason {
    pub fn as_str(&self) -> &str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTurns => "max_turns",
            StopReason::Other(s) => s.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub content: Vec<ContentBlock>,
    pub session_id: Option<String>,
    pub usage: TokenUsage,
    pub stop_reason: StopReason,
    pub model: Option<String>,
}

impl AgentResponse {
    pub fn text(&self) -> String {
        content_text(&self.content)
    }

    pub fn tool_call_count(&self) -> usize {
        self.content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolCall { .. }))
            .count()
    }

    /// Text of every tool result block
    pub fn tool_results(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("cancelled")]
    Cancelled,

    #[error("timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

impl From<AgentError> for CoreError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Cancelled => CoreError::Aborted,
            other => CoreError::Agent(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    async fn run(&self, request: AgentRequest, cancel: CancellationToken) -> Result<AgentResponse, AgentError>;
}
