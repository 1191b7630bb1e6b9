//! Collaborators backed by external CLIs: the Claude runner as agent and
//! summarizer, `gh api` as forge client.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use threadd_core::compaction::Summarizer;
use threadd_core::config::AgentConfig;
use threadd_core::context::{ForgeClient, ForgeIssue};
use threadd_core::core::{AgentError, AgentRequest, AgentResponse, ReasoningAgent, StopReason};
use threadd_core::error::{CoreError, Result as CoreResult};
use threadd_core::types::{ContentBlock, Direction, ThreadEvent, TokenUsage};
use threadd_runner::{
    tool_result_text, ClaudeRunner, ContentBlock as RunnerBlock, RunOptions, RunResult,
    RunnerError,
};

const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 30 * 60;
const SUMMARY_TIMEOUT_SECS: u64 = 5 * 60;

fn runner_for(config: &AgentConfig) -> ClaudeRunner {
    match &config.claude_path {
        Some(path) => ClaudeRunner::with_program(path.clone()),
        None => ClaudeRunner::new(),
    }
}

// ============ Agent ============

pub struct ClaudeAgent {
    runner: ClaudeRunner,
    config: AgentConfig,
}

impl ClaudeAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            runner: runner_for(&config),
            config,
        }
    }
}

/// Single prompt for the CLI: context, replayed history, then the message
pub fn render_prompt(request: &AgentRequest) -> String {
    let mut out = String::new();
    if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        out.push_str("<context>\n");
        out.push_str(context.trim_end());
        out.push_str("\n</context>\n\n");
    }
    if !request.history.is_empty() {
        out.push_str("<history>\n");
        for msg in &request.history {
            let who = match msg.direction {
                Direction::Inbound => msg.actor.as_str(),
                Direction::Outbound => "assistant",
            };
            out.push_str(&format!("[{}] {}\n", who, msg.text.trim()));
        }
        out.push_str("</history>\n\n");
    }
    out.push_str(&request.prompt);
    out
}

/// Map a finished CLI run onto the agent boundary
pub fn to_agent_response(result: RunResult) -> std::result::Result<AgentResponse, AgentError> {
    let stop_reason = if result.hit_max_turns() {
        StopReason::MaxTurns
    } else if result.subtype == "success" {
        StopReason::EndTurn
    } else {
        StopReason::Other(result.subtype.clone())
    };
    if result.is_error && stop_reason != StopReason::MaxTurns {
        return Err(AgentError::Failed(format!("{}: {}", result.subtype, result.result)));
    }

    let mut content: Vec<ContentBlock> = result
        .blocks
        .into_iter()
        .filter_map(|block| match block {
            RunnerBlock::Text { text } => Some(ContentBlock::Text { text }),
            RunnerBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolCall { id, name, input }),
            RunnerBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(ContentBlock::ToolResult {
                tool_call_id: tool_use_id,
                content: tool_result_text(&content),
                is_error,
            }),
            RunnerBlock::Thinking { .. } => None,
        })
        .collect();
    if !content.iter().any(|b| matches!(b, ContentBlock::Text { .. })) && !result.result.is_empty() {
        content.push(ContentBlock::Text {
            text: result.result.clone(),
        });
    }

    Ok(AgentResponse {
        content,
        session_id: (!result.session_id.is_empty()).then_some(result.session_id),
        usage: TokenUsage {
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
            cache_read_tokens: result.usage.cache_read_input_tokens,
            cache_creation_tokens: result.usage.cache_creation_input_tokens,
        },
        stop_reason,
        model: result.model,
    })
}

fn map_runner_error(e: RunnerError) -> AgentError {
    match e {
        RunnerError::Cancelled => AgentError::Cancelled,
        RunnerError::Timeout(_) => AgentError::Timeout,
        other => AgentError::Failed(other.to_string()),
    }
}

#[async_trait]
impl ReasoningAgent for ClaudeAgent {
    async fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<AgentResponse, AgentError> {
        let options = RunOptions {
            prompt: render_prompt(&request),
            system_prompt: self.config.system_prompt.clone(),
            cwd: self.config.cwd.clone(),
            session_id: request.session_id.clone(),
            model: self.config.model.clone(),
            max_turns: self.config.max_turns,
            timeout: Duration::from_secs(self.config.timeout_secs.unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS)),
            cancel,
            ..Default::default()
        };
        debug!(thread_id = %request.thread_id, resume = request.session_id.is_some(), "Invoking Claude CLI");
        let result = self.runner.run(options).await.map_err(map_runner_error)?;
        to_agent_response(result)
    }
}

// ============ Summarizer ============

pub struct ClaudeSummarizer {
    runner: ClaudeRunner,
    model: Option<String>,
    cwd: Option<PathBuf>,
}

impl ClaudeSummarizer {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            runner: runner_for(config),
            model: config.summary_model.clone().or_else(|| config.model.clone()),
            cwd: config.cwd.clone(),
        }
    }
}

pub fn summary_prompt(events: &[ThreadEvent], previous: Option<&str>) -> String {
    let mut out = String::from(
        "Summarize the conversation below for a teammate who will continue it. \
         Keep decisions, open questions, linked issues and pull requests, and unfinished work. \
         Reply with the summary only.\n\n",
    );
    if let Some(prev) = previous {
        out.push_str("Earlier summary:\n");
        out.push_str(prev.trim());
        out.push_str("\n\n");
    }
    out.push_str("Conversation:\n");
    for event in events {
        let text = event.text();
        if text.trim().is_empty() {
            continue;
        }
        out.push_str(&format!(
            "[{} {} {}] {}\n",
            event.channel.as_str(),
            event.direction.as_str(),
            event.actor,
            text.trim()
        ));
    }
    out
}

#[async_trait]
impl Summarizer for ClaudeSummarizer {
    async fn summarize(&self, events: &[ThreadEvent], previous_summary: Option<&str>) -> CoreResult<String> {
        let result = self
            .runner
            .run(RunOptions {
                prompt: summary_prompt(events, previous_summary),
                cwd: self.cwd.clone(),
                model: self.model.clone(),
                max_turns: Some(1),
                timeout: Duration::from_secs(SUMMARY_TIMEOUT_SECS),
                ..Default::default()
            })
            .await
            .map_err(|e| CoreError::Agent(e.to_string()))?;
        let summary = result.result.trim().to_string();
        if result.is_error || summary.is_empty() {
            return Err(CoreError::Agent(format!("empty summary ({})", result.subtype)));
        }
        Ok(summary)
    }
}

// ============ Forge ============

/// Forge reads through the GitHub CLI
pub struct GhForge {
    program: String,
}

impl Default for GhForge {
    fn default() -> Self {
        Self {
            program: "gh".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: i64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

pub fn parse_issue(json: &str) -> CoreResult<ForgeIssue> {
    let raw: GhIssue = serde_json::from_str(json)?;
    Ok(ForgeIssue {
        number: raw.number,
        title: raw.title,
        body: raw.body.unwrap_or_default(),
        state: raw.state,
        labels: raw.labels.into_iter().map(|l| l.name).collect(),
    })
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("Not Found") || stderr.contains("HTTP 404")
}

impl GhForge {
    async fn api(&self, args: &[&str]) -> CoreResult<std::result::Result<String, String>> {
        let output = Command::new(&self.program)
            .arg("api")
            .args(args)
            .output()
            .await
            .map_err(|e| CoreError::Upstream(format!("failed to run `{} api`: {}", self.program, e)))?;
        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).to_string()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).to_string()))
        }
    }
}

#[async_trait]
impl ForgeClient for GhForge {
    async fn fetch_file(&self, repo: &str, path: &str) -> CoreResult<Option<String>> {
        let endpoint = format!("repos/{}/contents/{}", repo, path);
        match self
            .api(&["-H", "Accept: application/vnd.github.raw", &endpoint])
            .await?
        {
            Ok(body) => Ok(Some(body)),
            Err(stderr) if is_not_found(&stderr) => Ok(None),
            Err(stderr) => {
                warn!(repo = %repo, path = %path, stderr = %stderr.trim(), "gh api contents failed");
                Err(CoreError::Upstream(format!("{}: {}", endpoint, stderr.trim())))
            }
        }
    }

    async fn fetch_issue(&self, repo: &str, number: i64) -> CoreResult<ForgeIssue> {
        let endpoint = format!("repos/{}/issues/{}", repo, number);
        match self.api(&[&endpoint]).await? {
            Ok(body) => parse_issue(&body),
            Err(stderr) => Err(CoreError::Upstream(format!("{}: {}", endpoint, stderr.trim()))),
        }
    }
}
