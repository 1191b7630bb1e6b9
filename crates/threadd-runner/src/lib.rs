//! threadd-runner - Claude CLI wrapper
//!
//! Executes `claude --print --output-format stream-json` and collects the
//! streamed content blocks, usage and session id of one run.
//!
//! # Example
//!
//! ```no_run
//! use threadd_runner::{ClaudeRunner, RunOptions, StreamEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = ClaudeRunner::new();
//!
//!     let result = runner.run(RunOptions {
//!         prompt: "Say hello".to_string(),
//!         cwd: Some("/path/to/project".into()),
//!         on_progress: Some(Box::new(|event: &StreamEvent| {
//!             println!("Event: {:?}", event);
//!         })),
//!         ..Default::default()
//!     }).await?;
//!
//!     println!("Result: {}", result.result);
//!     Ok(())
//! }
//! ```

mod runner;
mod types;

pub use runner::{parse_stream_line, ClaudeRunner};
pub use types::*;
