//! Compaction engine
//!
//! Shrinks a thread's live history either in place (older events flagged
//! compacted behind one summary event) or by forking into a fresh thread that
//! starts from a summary.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::ThreadDB;
use crate::error::{CoreError, Result};
use crate::types::{EventFilter, ForkMode, ForkOptions, MessageType, Thread, ThreadEvent};

pub const DEFAULT_KEEP_RECENT: usize = 10;
pub const DEFAULT_COMPACT_THRESHOLD: usize = 50;

/// Secondary model call used to condense old events
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, events: &[ThreadEvent], previous_summary: Option<&str>) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionAdvice {
    pub should_compact: bool,
    pub event_count: usize,
    pub threshold: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionOutcome {
    pub compacted: usize,
    pub kept: usize,
    pub summary_event_id: i64,
    pub summary: String,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkCompactOutcome {
    pub thread: Thread,
    pub summarized_events: usize,
    pub used_fallback: bool,
}

pub struct CompactionEngine {
    db: Arc<ThreadDB>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl CompactionEngine {
    pub fn new(db: Arc<ThreadDB>, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        Self { db, summarizer }
    }

    /// Advisory: does the live (non-compacted) history exceed `threshold`?
    pub fn should_compact(&self, thread_id: &str, threshold: usize) -> Result<CompactionAdvice> {
        let event_count = self.db.count_thread_events(thread_id, false)? as usize;
        Ok(CompactionAdvice {
            should_compact: event_count > threshold,
            event_count,
            threshold,
        })
    }

    /// Summarize everything but the newest `keep_recent` live events
    pub async fn compact_thread(&self, thread_id: &str, keep_recent: usize) -> Result<CompactionOutcome> {
        let thread = self.db.get_thread(thread_id)?;
        let candidates: Vec<ThreadEvent> = self
            .db
            .get_thread_events(&thread.id, &EventFilter::default())?
            .into_iter()
            .filter(|e| e.message_type != MessageType::Summary)
            .collect();

        if candidates.len() <= keep_recent {
            return Err(CoreError::NothingToCompact {
                events: candidates.len(),
                keep_recent,
            });
        }

        let split = candidates.len() - keep_recent;
        let (old, kept) = candidates.split_at(split);
        let (summary, used_fallback) = self.summarize(old, thread.summary.as_deref()).await;

        let last_old = &old[old.len() - 1];
        let summary_at = kept
            .first()
            .map(|e| e.created_at - 1)
            .unwrap_or(last_old.created_at);
        let metadata = serde_json::json!({
            "compactedCount": old.len(),
            "fromEventId": old[0].id,
            "throughEventId": last_old.id,
            "fallback": used_fallback,
        });

        let (compacted, event) =
            self.db
                .apply_compaction(&thread.id, last_old.id, &summary, summary_at, metadata)?;

        info!(
            thread_id = %thread.id,
            compacted,
            kept = kept.len(),
            fallback = used_fallback,
            "Thread compacted"
        );
        Ok(CompactionOutcome {
            compacted,
            kept: kept.len(),
            summary_event_id: event.id,
            summary,
            used_fallback,
        })
    }

    /// Summarize the whole thread, compacted history included, into a new
    /// child thread. The source thread is left untouched.
    pub async fn fork_compact(&self, thread_id: &str) -> Result<ForkCompactOutcome> {
        let thread = self.db.get_thread(thread_id)?;
        let events = self.db.get_thread_events(
            &thread.id,
            &EventFilter {
                include_compacted: true,
                ..Default::default()
            },
        )?;
        let Some(last) = events.last() else {
            return Err(CoreError::NothingToCompact {
                events: 0,
                keep_recent: 0,
            });
        };

        let (summary, used_fallback) = self.summarize(&events, None).await;
        let child = self.db.fork_thread(
            &thread.id,
            &ForkOptions {
                at_event_id: Some(last.id),
                mode: ForkMode::Summary(summary),
                topic: None,
            },
        )?;

        info!(
            source = %thread.id,
            child = %child.id,
            events = events.len(),
            fallback = used_fallback,
            "Thread fork-compacted"
        );
        Ok(ForkCompactOutcome {
            thread: child,
            summarized_events: events.len(),
            used_fallback,
        })
    }

    async fn summarize(&self, events: &[ThreadEvent], previous: Option<&str>) -> (String, bool) {
        if let Some(summarizer) = &self.summarizer {
            match summarizer.summarize(events, previous).await {
                Ok(text) if !text.trim().is_empty() => return (text, false),
                Ok(_) => warn!("Summarizer returned empty text, using fallback"),
                Err(e) => warn!(error = %e, "Summarizer failed, using fallback"),
            }
        }
        (fallback_summary(events, previous), true)
    }
}

/// Deterministic summary: event count, channels, actors and date range
pub fn fallback_summary(events: &[ThreadEvent], previous: Option<&str>) -> String {
    let channels: BTreeSet<&str> = events.iter().map(|e| e.channel.as_str()).collect();
    let actors: BTreeSet<&str> = events.iter().map(|e| e.actor.as_str()).collect();
    let first = events.iter().map(|e| e.created_at).min();
    let last = events.iter().map(|e| e.created_at).max();

    let mut out = format!(
        "Compacted {} earlier events. Channels: {}. Participants: {}.",
        events.len(),
        channels.into_iter().collect::<Vec<_>>().join(", "),
        actors.into_iter().collect::<Vec<_>>().join(", "),
    );
    if let (Some(first), Some(last)) = (first, last) {
        out.push_str(&format!(" Period: {} to {}.", format_millis(first), format_millis(last)));
    }
    if let Some(prev) = previous {
        out.push_str("\n\nEarlier summary:\n");
        out.push_str(prev);
    }
    out
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}
