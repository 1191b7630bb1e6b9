//! threadd - thread orchestration driver
//!
//! Usage:
//!   threadd send --thread chat-42 "/issue acme/app#7 login is broken"
//!   threadd chat --thread chat-42          (one turn per stdin line)
//!   threadd threads --status active
//!   threadd compact <thread> --keep 10

mod adapters;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use adapters::{ClaudeAgent, ClaudeSummarizer, GhForge};
use threadd_core::context::{WebhookEvent, WebhookEventType};
use threadd_core::core::{InboundMessage, OrchestratorDeps, ThreadOrchestrator, TurnOutcome};
use threadd_core::enforcer::GitProbe;
use threadd_core::types::{
    Channel, EventFilter, ForkMode, ForkOptions, NewThreadRef, ThreadFilter, ThreadKind, ThreadStatus,
};
use threadd_core::{ThreadDB, ThreaddConfig};

#[derive(Parser, Debug)]
#[command(name = "threadd")]
#[command(about = "Cross-channel conversation threads driving a coding agent")]
#[command(version)]
struct Cli {
    /// State directory (default: $THREADD_HOME or ~/.threadd)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Config file (default: <home>/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one message through a thread
    Send {
        /// Thread id or external conversation id (new thread if omitted)
        #[arg(short, long)]
        thread: Option<String>,
        #[arg(long, default_value = "web", value_parser = parse_channel)]
        channel: Channel,
        #[arg(long, default_value = "cli")]
        actor: String,
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Interactive: every stdin line is a message to the same thread
    Chat {
        #[arg(short, long)]
        thread: Option<String>,
        #[arg(long, default_value = "web", value_parser = parse_channel)]
        channel: Channel,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// List threads, most recently active first
    Threads {
        #[arg(long, value_parser = parse_status)]
        status: Option<ThreadStatus>,
        #[arg(long, value_parser = parse_kind)]
        kind: Option<ThreadKind>,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Thread with refs, tasks and lineage
    Show { thread: String },
    /// Event timeline
    Events {
        thread: String,
        /// Include compacted events
        #[arg(long)]
        all: bool,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Stop a thread (reopened by the next message)
    Stop { thread: String },
    /// Link an issue or pull request to a thread
    Link {
        thread: String,
        repo: String,
        number: i64,
        #[arg(long)]
        pr: bool,
        #[arg(long)]
        url: Option<String>,
    },
    /// Summarize old events in place
    Compact {
        thread: String,
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Start a new thread seeded with a summary of this one
    ForkCompact { thread: String },
    /// Fork a thread at an event
    Fork {
        thread: String,
        /// Fork point event id (default: latest)
        #[arg(long)]
        at: Option<i64>,
        /// Seed the fork with this summary instead of copying events
        #[arg(long)]
        summary: Option<String>,
        #[arg(long)]
        topic: Option<String>,
    },
    /// Run the completion check for a thread's open tasks
    Check { thread: String },
    /// Apply a forge webhook (issue_update, issue_close, pr_merge, pr_close, push)
    Webhook {
        #[arg(value_parser = parse_webhook_type)]
        event_type: WebhookEventType,
        repo: String,
        #[arg(long)]
        number: Option<i64>,
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
    },
}

fn parse_channel(s: &str) -> std::result::Result<Channel, String> {
    Channel::from_str(s).ok_or_else(|| format!("unknown channel: {}", s))
}

fn parse_status(s: &str) -> std::result::Result<ThreadStatus, String> {
    ThreadStatus::from_str(s).ok_or_else(|| format!("unknown status: {}", s))
}

fn parse_kind(s: &str) -> std::result::Result<ThreadKind, String> {
    ThreadKind::from_str(s).ok_or_else(|| format!("unknown kind: {}", s))
}

fn parse_webhook_type(s: &str) -> std::result::Result<WebhookEventType, String> {
    WebhookEventType::from_str(s).ok_or_else(|| format!("unknown webhook event: {}", s))
}

fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("THREADD_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".threadd")
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("THREADD_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_orchestrator(home: &Path, config: &ThreaddConfig) -> Result<ThreadOrchestrator> {
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| home.join("threadd.db"));
    let db = Arc::new(
        ThreadDB::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?,
    );

    Ok(ThreadOrchestrator::new(
        OrchestratorDeps {
            db,
            agent: Arc::new(ClaudeAgent::new(config.agent.clone())),
            forge: Arc::new(GhForge::default()),
            probe: Arc::new(GitProbe),
            summarizer: Some(Arc::new(ClaudeSummarizer::new(&config.agent))),
            detector: None,
        },
        config,
    ))
}

/// Cancel the token on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping turn");
            token.cancel();
        }
    });
    cancel
}

async fn send(
    orchestrator: &ThreadOrchestrator,
    thread: Option<&str>,
    channel: Channel,
    actor: &str,
    text: &str,
) -> Result<TurnOutcome> {
    let outcome = orchestrator
        .handle_message(
            InboundMessage::new(thread, channel, actor, text),
            cancel_on_ctrl_c(),
        )
        .await?;
    Ok(outcome)
}

async fn chat(
    orchestrator: &ThreadOrchestrator,
    thread: Option<String>,
    channel: Channel,
    actor: &str,
) -> Result<()> {
    let mut thread = thread;
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match send(orchestrator, thread.as_deref(), channel, actor, &line).await? {
            TurnOutcome::Completed(report) => {
                println!("{}", report.response);
                if let Some(advice) = report.compaction.filter(|a| a.should_compact) {
                    eprintln!(
                        "(thread has {} events; consider `threadd compact {}`)",
                        advice.event_count, report.thread_id
                    );
                }
                thread = Some(report.thread_id);
            }
            TurnOutcome::Queued { thread_id, position } => {
                eprintln!("(queued at position {} on {})", position, thread_id);
                thread = Some(thread_id);
            }
            TurnOutcome::Stopped { thread_id } => {
                eprintln!("(stopped)");
                thread = Some(thread_id);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let home = cli.home.clone().unwrap_or_else(default_home);
    std::fs::create_dir_all(&home).ok();

    // Dual-layer logging: stderr + file (daily rotation)
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "threadd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    let config_path = cli.config.clone().unwrap_or_else(|| home.join("config.yaml"));
    let config = ThreaddConfig::load(&config_path);
    let orchestrator = build_orchestrator(&home, &config)?;
    let db = orchestrator.db().clone();

    match cli.command {
        Command::Send {
            thread,
            channel,
            actor,
            text,
        } => {
            let outcome = send(&orchestrator, thread.as_deref(), channel, &actor, &text.join(" ")).await?;
            print_json(&outcome)?;
        }
        Command::Chat {
            thread,
            channel,
            actor,
        } => chat(&orchestrator, thread, channel, &actor).await?,
        Command::Threads {
            status,
            kind,
            limit,
        } => {
            let threads = db.list_threads(&ThreadFilter {
                status,
                kind,
                limit: Some(limit),
                ..Default::default()
            })?;
            print_json(&threads)?;
        }
        Command::Show { thread } => {
            let thread = db.get_thread(&thread)?;
            print_json(&serde_json::json!({
                "thread": thread,
                "refs": db.get_thread_refs(&thread.id)?,
                "tasks": db.list_tasks(&thread.id)?,
                "lineage": db.get_thread_lineage(&thread.id)?,
                "compaction": orchestrator.should_compact(&thread.id)?,
            }))?;
        }
        Command::Events { thread, all, limit } => {
            let events = db.get_thread_events(
                &thread,
                &EventFilter {
                    include_compacted: all,
                    limit,
                    ..Default::default()
                },
            )?;
            print_json(&events)?;
        }
        Command::Stop { thread } => {
            let thread = orchestrator.stop_thread(&thread)?;
            info!(thread_id = %thread.id, "Thread stopped");
            print_json(&thread)?;
        }
        Command::Link {
            thread,
            repo,
            number,
            pr,
            url,
        } => {
            let mut new_ref = if pr {
                NewThreadRef::pull_request(&repo, number)
            } else {
                NewThreadRef::issue(&repo, number)
            };
            if let Some(url) = url {
                new_ref = new_ref.with_url(url);
            }
            print_json(&db.add_thread_ref(&thread, &new_ref)?)?;
        }
        Command::Compact { thread, keep } => {
            let keep = keep.unwrap_or(config.orchestrator.keep_recent);
            print_json(&orchestrator.compact(&thread, keep).await?)?;
        }
        Command::ForkCompact { thread } => {
            print_json(&orchestrator.fork_compact(&thread).await?)?;
        }
        Command::Fork {
            thread,
            at,
            summary,
            topic,
        } => {
            let options = ForkOptions {
                at_event_id: at,
                mode: summary.map(ForkMode::Summary).unwrap_or(ForkMode::Copy),
                topic,
            };
            print_json(&orchestrator.fork(&thread, &options).await?)?;
        }
        Command::Check { thread } => {
            let thread = db.get_thread(&thread)?;
            let actions = orchestrator.enforcer().check_thread(&thread.id).await?;
            print_json(&actions)?;
        }
        Command::Webhook {
            event_type,
            repo,
            number,
            files,
        } => {
            if matches!(event_type, WebhookEventType::PrMerge | WebhookEventType::PrClose | WebhookEventType::IssueClose)
                && number.is_none()
            {
                return Err(anyhow!("--number is required for this event"));
            }
            let removed = orchestrator.apply_webhook(&WebhookEvent {
                event_type,
                repo,
                number,
                changed_files: files,
            })?;
            print_json(&serde_json::json!({ "invalidated": removed }))?;
        }
    }

    Ok(())
}
