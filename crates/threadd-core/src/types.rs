//! Core types for threadd
//!
//! Threads, their linked external references, the timeline of events, and the
//! per-task completion state tracked by the enforcer.

use serde::{Deserialize, Serialize};

// ============ Thread ============

/// Thread lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Paused,
    Stopped,
    Archived,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Paused => "paused",
            ThreadStatus::Stopped => "stopped",
            ThreadStatus::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ThreadStatus::Active),
            "paused" => Some(ThreadStatus::Paused),
            "stopped" => Some(ThreadStatus::Stopped),
            "archived" => Some(ThreadStatus::Archived),
            _ => None,
        }
    }

    /// Whether `self -> next` is an edge of the status graph.
    /// Same-state transitions are accepted as no-ops.
    pub fn can_transition_to(&self, next: ThreadStatus) -> bool {
        use ThreadStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Active, Paused)
                | (Active, Stopped)
                | (Active, Archived)
                | (Paused, Active)
                | (Paused, Stopped)
                | (Paused, Archived)
                | (Stopped, Active)
                | (Stopped, Archived)
                | (Archived, Active)
        )
    }
}

/// Thread kind. Task threads get the execution-plan context layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreadKind {
    #[default]
    Chat,
    Task,
}

impl ThreadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadKind::Chat => "chat",
            ThreadKind::Task => "task",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(ThreadKind::Chat),
            "task" => Some(ThreadKind::Task),
            _ => None,
        }
    }
}

/// A cross-channel conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    /// Conversation id from an older channel integration, resolvable by `get_thread`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub kind: ThreadKind,
    pub status: ThreadStatus,
    /// Resumable agent session handle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_point_event_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<i64>,
}

/// Input for creating a thread
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadInput {
    pub topic: Option<String>,
    #[serde(default)]
    pub kind: ThreadKind,
    pub legacy_id: Option<String>,
}

/// Filters for `list_threads`
#[derive(Debug, Clone, Default)]
pub struct ThreadFilter {
    pub status: Option<ThreadStatus>,
    pub kind: Option<ThreadKind>,
    pub parent_thread_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ============ Thread Refs ============

/// External artifact kind a thread can link to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Issue,
    PullRequest,
    Commit,
    Branch,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefType::Issue => "issue",
            RefType::PullRequest => "pull_request",
            RefType::Commit => "commit",
            RefType::Branch => "branch",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "issue" => Some(RefType::Issue),
            "pull_request" | "pr" => Some(RefType::PullRequest),
            "commit" => Some(RefType::Commit),
            "branch" => Some(RefType::Branch),
            _ => None,
        }
    }
}

/// A link from a thread to an issue, PR, commit or branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRef {
    pub id: i64,
    pub thread_id: String,
    pub ref_type: RefType,
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub created_at: i64,
}

/// Input for `add_thread_ref`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewThreadRef {
    pub ref_type: RefType,
    pub repo: String,
    pub number: Option<i64>,
    pub ref_name: Option<String>,
    pub url: Option<String>,
    pub status: Option<String>,
}

impl NewThreadRef {
    pub fn issue(repo: &str, number: i64) -> Self {
        Self {
            ref_type: RefType::Issue,
            repo: repo.to_string(),
            number: Some(number),
            ref_name: None,
            url: None,
            status: None,
        }
    }

    pub fn pull_request(repo: &str, number: i64) -> Self {
        Self {
            ref_type: RefType::PullRequest,
            ..Self::issue(repo, number)
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

// ============ Thread Events ============

/// Channel an event arrived on or was delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Web,
    Bot,
    ForgeComment,
    ForgeReview,
    Webhook,
    System,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "web",
            Channel::Bot => "bot",
            Channel::ForgeComment => "forge_comment",
            Channel::ForgeReview => "forge_review",
            Channel::Webhook => "webhook",
            Channel::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "web" => Some(Channel::Web),
            "bot" => Some(Channel::Bot),
            "forge_comment" => Some(Channel::ForgeComment),
            "forge_review" => Some(Channel::ForgeReview),
            "webhook" => Some(Channel::Webhook),
            "system" => Some(Channel::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    /// Synthetic event written by compaction; never compacted itself
    Summary,
    ExecutionPlan,
    /// Follow-up turn forced by the enforcer or a continuation
    Directive,
    /// Turn cancelled by the caller
    Stopped,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Summary => "summary",
            MessageType::ExecutionPlan => "execution_plan",
            MessageType::Directive => "directive",
            MessageType::Stopped => "stopped",
            MessageType::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageType::Text),
            "summary" => Some(MessageType::Summary),
            "execution_plan" => Some(MessageType::ExecutionPlan),
            "directive" => Some(MessageType::Directive),
            "stopped" => Some(MessageType::Stopped),
            "error" => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// One block of role-agnostic message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Concatenate the text blocks of a content list
pub fn content_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Token usage reported for one agent invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }
}

/// One immutable timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEvent {
    pub id: i64,
    pub thread_id: String,
    pub channel: Channel,
    pub direction: Direction,
    pub actor: String,
    pub content: Vec<ContentBlock>,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub metadata: serde_json::Value,
    pub is_compacted: bool,
    pub created_at: i64,
}

impl ThreadEvent {
    pub fn text(&self) -> String {
        content_text(&self.content)
    }
}

/// Input for `add_thread_event`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewThreadEvent {
    pub channel: Channel,
    pub direction: Direction,
    pub actor: String,
    pub content: Vec<ContentBlock>,
    pub message_type: MessageType,
    pub usage: Option<TokenUsage>,
    pub metadata: serde_json::Value,
    /// Explicit timestamp (epoch millis); defaults to now
    pub created_at: Option<i64>,
}

impl NewThreadEvent {
    pub fn text(channel: Channel, direction: Direction, actor: &str, text: &str) -> Self {
        Self {
            channel,
            direction,
            actor: actor.to_string(),
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            message_type: MessageType::Text,
            usage: None,
            metadata: serde_json::json!({}),
            created_at: None,
        }
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Filters for `get_thread_events`
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub channel: Option<Channel>,
    pub direction: Option<Direction>,
    pub message_type: Option<MessageType>,
    /// Inclusive lower bound on `created_at`
    pub since: Option<i64>,
    /// Exclusive upper bound on `created_at`
    pub until: Option<i64>,
    pub include_compacted: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ============ Fork / Lineage ============

/// How a fork is seeded
#[derive(Debug, Clone, PartialEq)]
pub enum ForkMode {
    /// Copy every event up to the fork point verbatim
    Copy,
    /// Store only the given summary
    Summary(String),
}

#[derive(Debug, Clone)]
pub struct ForkOptions {
    /// Defaults to the source thread's head event
    pub at_event_id: Option<i64>,
    pub mode: ForkMode,
    /// Defaults to the source topic
    pub topic: Option<String>,
}

impl Default for ForkOptions {
    fn default() -> Self {
        Self {
            at_event_id: None,
            mode: ForkMode::Copy,
            topic: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadLineage {
    pub parent: Option<Thread>,
    pub fork_point_event: Option<ThreadEvent>,
    pub children: Vec<Thread>,
}

// ============ Task Context ============

/// Completion workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStep {
    CodeChanged,
    PrCreated,
    Notified,
}

impl TaskStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStep::CodeChanged => "code_changed",
            TaskStep::PrCreated => "pr_created",
            TaskStep::Notified => "notified",
        }
    }
}

/// Captured workspace state used for change detection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSnapshot {
    pub head_commit: Option<String>,
    pub dirty_files: i64,
}

/// Per-(thread, repo, issue) tracked unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub id: String,
    pub thread_id: String,
    pub repo: String,
    pub issue_number: i64,
    pub has_code_changes: bool,
    pub pr_created: bool,
    pub notified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    pub baseline: WorkspaceSnapshot,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl TaskContext {
    /// Current position in `started -> code_changed -> pr_created -> notified`
    pub fn stage(&self) -> &'static str {
        if self.notified {
            "notified"
        } else if self.pr_created {
            "pr_created"
        } else if self.has_code_changes {
            "code_changed"
        } else {
            "started"
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
