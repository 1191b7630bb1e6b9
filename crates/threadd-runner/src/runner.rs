//! Claude CLI Runner implementation
//!
//! Wraps the `claude` CLI with stream-json output parsing.

use crate::types::*;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Claude Code CLI Runner
///
/// Wraps `claude --print --output-format stream-json` execution.
#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    program: String,
}

impl Default for ClaudeRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates what one run streamed
#[derive(Default)]
struct StreamState {
    result: Option<ResultEvent>,
    model: Option<String>,
    blocks: Vec<ContentBlock>,
}

impl StreamState {
    fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::System(sys) => {
                if sys.subtype == "init" && sys.model.is_some() {
                    self.model = sys.model.clone();
                }
            }
            StreamEvent::Assistant(evt) => self.blocks.extend(evt.message.content.iter().cloned()),
            StreamEvent::User(evt) => {
                if let UserContent::Blocks(blocks) = &evt.message.content {
                    self.blocks.extend(
                        blocks
                            .iter()
                            .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
                            .cloned(),
                    );
                }
            }
            StreamEvent::Result(evt) => self.result = Some(evt.clone()),
        }
    }
}

/// Parse one stdout line. Non-JSON and unknown event types yield `None`.
pub fn parse_stream_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            // Non-JSON line, might be debug output
            debug!(?line, ?e, "Non-JSON line from Claude CLI");
            return None;
        }
    };
    let event_type = value.get("type").and_then(|v| v.as_str())?.to_owned();
    let parsed = match event_type.as_str() {
        "result" => serde_json::from_value::<ResultEvent>(value).map(StreamEvent::Result),
        "assistant" => serde_json::from_value::<AssistantEvent>(value).map(StreamEvent::Assistant),
        "user" => serde_json::from_value::<UserEvent>(value).map(StreamEvent::User),
        "system" => serde_json::from_value::<SystemEvent>(value).map(StreamEvent::System),
        other => {
            debug!(event_type = other, "Unknown event type");
            return None;
        }
    };
    match parsed {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(event_type = %event_type, error = %e, "Malformed stream event");
            None
        }
    }
}

impl ClaudeRunner {
    /// Runner invoking `claude` from PATH
    pub fn new() -> Self {
        Self {
            program: "claude".to_string(),
        }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_args(options: &RunOptions) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            options.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(sid) = &options.session_id {
            args.push("--resume".to_string());
            args.push(sid.clone());
        }
        if let Some(model) = &options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(turns) = options.max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }
        if let Some(system) = &options.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system.clone());
        }
        if !options.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(options.allowed_tools.join(","));
        }
        args
    }

    /// Execute Claude CLI
    pub async fn run(&self, options: RunOptions) -> Result<RunResult, RunnerError> {
        let args = Self::build_args(&options);

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &options.cwd {
            cmd.current_dir(dir);
        }

        debug!(program = %self.program, resume = options.session_id.is_some(), "Starting Claude CLI");

        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::CliFailed("Failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::CliFailed("Failed to capture stderr".into()))?;

        // Spawn stderr reader
        let errors = Arc::new(Mutex::new(Vec::<String>::new()));
        let errors_handle = {
            let errors_ref = errors.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim().to_string();
                    if !line.is_empty() {
                        errors_ref.lock().await.push(line);
                    }
                }
            })
        };

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut state = StreamState::default();
        let cancel = options.cancel.clone();
        let on_progress = options.on_progress.as_ref();

        let process_result = tokio::time::timeout(options.timeout, async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
                    line = stdout_reader.next_line() => {
                        let line = match line {
                            Ok(Some(line)) => line,
                            Ok(None) => return Ok(()),
                            Err(e) => return Err(RunnerError::Io(e)),
                        };
                        if let Some(event) = parse_stream_line(&line) {
                            if let Some(cb) = on_progress {
                                cb(&event);
                            }
                            state.apply(&event);
                        }
                    }
                }
            }
        })
        .await;

        match process_result {
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(?e, "Failed to kill Claude CLI process");
                }
                return Err(RunnerError::Timeout(options.timeout));
            }
            Ok(Err(e)) => {
                if let Err(kill_err) = child.kill().await {
                    warn!(?kill_err, "Failed to kill Claude CLI process");
                }
                return Err(e);
            }
            Ok(Ok(())) => {}
        }

        let status = child.wait().await?;
        let _ = errors_handle.await;
        let stderr_lines = errors.lock().await.clone();

        let Some(result) = state.result else {
            if !status.success() {
                return Err(RunnerError::CliFailed(format!(
                    "exit {}: {}",
                    status,
                    stderr_lines.join("\n")
                )));
            }
            return Err(RunnerError::NoResult(stderr_lines.join("\n")));
        };

        Ok(RunResult {
            session_id: result.session_id,
            result: result.result,
            subtype: result.subtype,
            is_error: result.is_error,
            duration_ms: result.duration_ms,
            num_turns: result.num_turns,
            total_cost_usd: result.total_cost_usd,
            usage: result.usage.map(Usage::from).unwrap_or_default(),
            model: state.model,
            blocks: state.blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_event() {
        let json = r#"{
            "type": "result",
            "subtype": "success",
            "session_id": "abc123",
            "result": "Hello, world!",
            "is_error": false,
            "duration_ms": 1000,
            "duration_api_ms": 800,
            "num_turns": 1,
            "total_cost_usd": 0.001,
            "usage": {
                "input_tokens": 100,
                "output_tokens": 50,
                "cache_read_input_tokens": 30
            }
        }"#;

        let Some(StreamEvent::Result(event)) = parse_stream_line(&json.replace('\n', " ")) else {
            panic!("expected result event");
        };
        assert_eq!(event.session_id, "abc123");
        assert_eq!(event.result, "Hello, world!");
        assert!(!event.is_error);
        assert_eq!(event.usage.unwrap().cache_read_input_tokens, 30);
    }

    #[test]
    fn test_parse_max_turns_result() {
        let line = r#"{"type":"result","subtype":"error_max_turns","session_id":"s1","is_error":true,"num_turns":5}"#;
        let Some(StreamEvent::Result(event)) = parse_stream_line(line) else {
            panic!("expected result event");
        };
        assert_eq!(event.subtype, MAX_TURNS_SUBTYPE);
        assert!(event.result.is_empty());
    }

    #[test]
    fn test_stream_state_collects_blocks() {
        let lines = [
            r#"{"type":"system","subtype":"init","session_id":"s1","model":"claude-sonnet","tools":["Bash"]}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Opening PR"},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"gh pr create"}}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"https://github.com/acme/app/pull/9"}]}]}}"#,
            "not json at all",
            r#"{"type":"rate_limit","x":1}"#,
            r#"{"type":"result","subtype":"success","session_id":"s1","result":"done"}"#,
        ];

        let mut state = StreamState::default();
        for line in lines {
            if let Some(event) = parse_stream_line(line) {
                state.apply(&event);
            }
        }

        assert_eq!(state.model.as_deref(), Some("claude-sonnet"));
        assert_eq!(state.blocks.len(), 3);
        let ContentBlock::ToolResult { content, .. } = &state.blocks[2] else {
            panic!("expected tool result");
        };
        assert_eq!(tool_result_text(content), "https://github.com/acme/app/pull/9");
        assert_eq!(state.result.unwrap().result, "done");
    }

    #[test]
    fn test_plain_user_message() {
        let line = r#"{"type":"user","message":{"content":"hello"}}"#;
        let Some(StreamEvent::User(evt)) = parse_stream_line(line) else {
            panic!("expected user event");
        };
        assert!(matches!(evt.message.content, UserContent::Text(_)));
    }

    #[test]
    fn test_build_args() {
        let args = ClaudeRunner::build_args(&RunOptions {
            prompt: "hi".to_string(),
            session_id: Some("s1".to_string()),
            max_turns: Some(8),
            ..Default::default()
        });
        assert_eq!(&args[..2], &["--print".to_string(), "hi".to_string()]);
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "s1");
        let turns = args.iter().position(|a| a == "--max-turns").unwrap();
        assert_eq!(args[turns + 1], "8");
        assert!(!args.contains(&"--model".to_string()));
    }
}
