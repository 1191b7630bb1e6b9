//! Core module for threadd
//!
//! - ConversationLocks: per-thread exclusion and message queue
//! - ReasoningAgent: the agent boundary
//! - ThreadOrchestrator: main coordinator

mod agent;
mod directives;
mod lock;
mod orchestrator;

pub use agent::{AgentError, AgentMessage, AgentRequest, AgentResponse, ReasoningAgent, StopReason};
pub use directives::{extract_forge_links, parse_issue_directive, ForgeLink, IssueDirective};
pub use lock::{ConversationLocks, LockGuard, LockInfo, QueuedMessage, DEFAULT_LOCK_TIMEOUT};
pub use orchestrator::{
    InboundMessage, OrchestratorDeps, ThreadOrchestrator, TurnOutcome, TurnReport, AGENT_ACTOR,
};
