//! threadd-core - thread orchestration
//!
//! Threads are durable conversations bound to forge refs. Every inbound
//! message runs under a per-thread lock through a chained agent turn with
//! layered context, then the completion enforcer checks the workspace for
//! unfinished steps and the compaction engine keeps history bounded.
//!
//! # Example
//!
//! ```no_run
//! use threadd_core::{InboundMessage, OrchestratorDeps, ThreadOrchestrator, ThreaddConfig};
//! use threadd_core::types::Channel;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(deps: OrchestratorDeps) -> threadd_core::Result<()> {
//! let config = ThreaddConfig::default();
//! let orchestrator = ThreadOrchestrator::new(deps, &config);
//! let outcome = orchestrator
//!     .handle_message(
//!         InboundMessage::new(Some("chat-42"), Channel::Web, "alice", "/issue acme/app#7"),
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod compaction;
pub mod config;
pub mod context;
pub mod core;
pub mod db;
pub mod enforcer;
pub mod error;
pub mod types;

pub use crate::core::{
    ConversationLocks, InboundMessage, OrchestratorDeps, ReasoningAgent, ThreadOrchestrator,
    TurnOutcome, TurnReport,
};
pub use compaction::{CompactionEngine, Summarizer};
pub use config::ThreaddConfig;
pub use context::{ContextCache, ContextStackBuilder, ForgeClient};
pub use db::ThreadDB;
pub use enforcer::{CompletionEnforcer, WorkspaceProbe};
pub use error::{CoreError, Result};
