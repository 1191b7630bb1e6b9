//! Thread event timeline

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{ensure_thread, ThreadDB};
use crate::error::{CoreError, Result};
use crate::types::{
    now_millis, Channel, ContentBlock, Direction, EventFilter, MessageType, NewThreadEvent,
    ThreadEvent, TokenUsage,
};

/// Actor recorded on events the daemon writes itself
pub const SYSTEM_ACTOR: &str = "threadd";

impl ThreadDB {
    /// Append an event and bump the thread's `updated_at`
    pub fn add_thread_event(&self, thread_id: &str, event: &NewThreadEvent) -> Result<ThreadEvent> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        ensure_thread(&tx, thread_id)?;
        let stored = insert_event(&tx, thread_id, event)?;
        tx.execute(
            "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
            params![now_millis(), thread_id],
        )?;
        tx.commit()?;
        Ok(stored)
    }

    /// Events of a thread ordered by `(created_at, id)`
    pub fn get_thread_events(&self, thread_id: &str, filter: &EventFilter) -> Result<Vec<ThreadEvent>> {
        let conn = self.conn();
        ensure_thread(&conn, thread_id)?;

        let mut sql = String::from("SELECT * FROM thread_events WHERE thread_id = ?1");
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(thread_id.to_string())];

        if !filter.include_compacted {
            sql.push_str(" AND is_compacted = 0");
        }
        if let Some(channel) = filter.channel {
            values.push(Box::new(channel.as_str().to_string()));
            sql.push_str(&format!(" AND channel = ?{}", values.len()));
        }
        if let Some(direction) = filter.direction {
            values.push(Box::new(direction.as_str().to_string()));
            sql.push_str(&format!(" AND direction = ?{}", values.len()));
        }
        if let Some(message_type) = filter.message_type {
            values.push(Box::new(message_type.as_str().to_string()));
            sql.push_str(&format!(" AND message_type = ?{}", values.len()));
        }
        if let Some(since) = filter.since {
            values.push(Box::new(since));
            sql.push_str(&format!(" AND created_at >= ?{}", values.len()));
        }
        if let Some(until) = filter.until {
            values.push(Box::new(until));
            sql.push_str(&format!(" AND created_at < ?{}", values.len()));
        }
        values.push(Box::new(filter.limit.unwrap_or(-1)));
        sql.push_str(&format!(" ORDER BY created_at ASC, id ASC LIMIT ?{}", values.len()));
        values.push(Box::new(filter.offset.unwrap_or(0)));
        sql.push_str(&format!(" OFFSET ?{}", values.len()));

        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), row_to_event)?;
        let mut events = Vec::new();
        for e in rows {
            events.push(e?);
        }
        Ok(events)
    }

    pub fn get_event(&self, event_id: i64) -> Result<ThreadEvent> {
        let conn = self.conn();
        find_event(&conn, event_id)?.ok_or_else(|| CoreError::not_found("event", event_id))
    }

    /// Newest event of a thread, compacted or not, optionally of one type
    pub fn latest_event(
        &self,
        thread_id: &str,
        message_type: Option<MessageType>,
    ) -> Result<Option<ThreadEvent>> {
        let conn = self.conn();
        ensure_thread(&conn, thread_id)?;
        let event = conn
            .query_row(
                "SELECT * FROM thread_events
                 WHERE thread_id = ?1 AND (?2 IS NULL OR message_type = ?2)
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![thread_id, message_type.map(|m| m.as_str())],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    pub fn count_thread_events(&self, thread_id: &str, include_compacted: bool) -> Result<i64> {
        let conn = self.conn();
        ensure_thread(&conn, thread_id)?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM thread_events WHERE thread_id = ?1 AND (?2 OR is_compacted = 0)",
            params![thread_id, include_compacted],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Flag non-summary events created strictly before `before` as compacted.
    /// Returns the number of events newly flagged.
    pub fn mark_events_compacted(&self, thread_id: &str, before: i64) -> Result<usize> {
        let conn = self.conn();
        ensure_thread(&conn, thread_id)?;
        let n = conn.execute(
            "UPDATE thread_events SET is_compacted = 1
             WHERE thread_id = ?1 AND created_at < ?2 AND is_compacted = 0 AND message_type != 'summary'",
            params![thread_id, before],
        )?;
        debug!(thread_id = %thread_id, before, flagged = n, "Events compacted");
        Ok(n)
    }

    /// Flag non-summary events up to and including `event_id` in timeline order
    pub fn mark_events_compacted_through(&self, thread_id: &str, event_id: i64) -> Result<usize> {
        let conn = self.conn();
        ensure_thread(&conn, thread_id)?;
        mark_through(&conn, thread_id, event_id)
    }

    /// Atomically flag everything through `through_event_id`, insert the
    /// summary event at `summary_at` and store the summary on the thread.
    pub fn apply_compaction(
        &self,
        thread_id: &str,
        through_event_id: i64,
        summary: &str,
        summary_at: i64,
        metadata: serde_json::Value,
    ) -> Result<(usize, ThreadEvent)> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        ensure_thread(&tx, thread_id)?;

        let flagged = mark_through(&tx, thread_id, through_event_id)?;
        let event = NewThreadEvent::text(Channel::System, Direction::Outbound, SYSTEM_ACTOR, summary)
            .with_type(MessageType::Summary)
            .with_metadata(metadata)
            .at(summary_at);
        let stored = insert_event(&tx, thread_id, &event)?;
        tx.execute(
            "UPDATE threads SET summary = ?1, updated_at = ?2 WHERE id = ?3",
            params![summary, now_millis(), thread_id],
        )?;
        tx.commit()?;
        Ok((flagged, stored))
    }
}

fn mark_through(conn: &Connection, thread_id: &str, event_id: i64) -> Result<usize> {
    let anchor: i64 = conn
        .query_row(
            "SELECT created_at FROM thread_events WHERE id = ?1 AND thread_id = ?2",
            params![event_id, thread_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| CoreError::not_found("event", event_id))?;

    let n = conn.execute(
        "UPDATE thread_events SET is_compacted = 1
         WHERE thread_id = ?1 AND is_compacted = 0 AND message_type != 'summary'
           AND (created_at < ?2 OR (created_at = ?2 AND id <= ?3))",
        params![thread_id, anchor, event_id],
    )?;
    Ok(n)
}

fn insert_event(conn: &Connection, thread_id: &str, event: &NewThreadEvent) -> Result<ThreadEvent> {
    let created_at = event.created_at.unwrap_or_else(now_millis);
    let content = serde_json::to_string(&event.content)?;
    let usage = event.usage.map(|u| serde_json::to_string(&u)).transpose()?;
    let metadata = serde_json::to_string(&event.metadata)?;

    conn.execute(
        "INSERT INTO thread_events (thread_id, channel, direction, actor, content, message_type, usage, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            thread_id,
            event.channel.as_str(),
            event.direction.as_str(),
            event.actor,
            content,
            event.message_type.as_str(),
            usage,
            metadata,
            created_at,
        ],
    )?;

    Ok(ThreadEvent {
        id: conn.last_insert_rowid(),
        thread_id: thread_id.to_string(),
        channel: event.channel,
        direction: event.direction,
        actor: event.actor.clone(),
        content: event.content.clone(),
        message_type: event.message_type,
        usage: event.usage,
        metadata: event.metadata.clone(),
        is_compacted: false,
        created_at,
    })
}

/// Seed event for a summary-mode fork
pub(super) fn insert_summary_event(
    conn: &Connection,
    thread_id: &str,
    summary: &str,
    created_at: i64,
    forked_from: &str,
) -> Result<ThreadEvent> {
    let event = NewThreadEvent::text(Channel::System, Direction::Outbound, SYSTEM_ACTOR, summary)
        .with_type(MessageType::Summary)
        .with_metadata(serde_json::json!({ "forkedFrom": forked_from }))
        .at(created_at);
    insert_event(conn, thread_id, &event)
}

pub(super) fn find_event(conn: &Connection, event_id: i64) -> Result<Option<ThreadEvent>> {
    let event = conn
        .query_row(
            "SELECT * FROM thread_events WHERE id = ?1",
            params![event_id],
            row_to_event,
        )
        .optional()?;
    Ok(event)
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<ThreadEvent> {
    let channel: String = row.get("channel")?;
    let direction: String = row.get("direction")?;
    let message_type: String = row.get("message_type")?;
    let content: String = row.get("content")?;
    let usage: Option<String> = row.get("usage")?;
    let metadata: Option<String> = row.get("metadata")?;

    Ok(ThreadEvent {
        id: row.get("id")?,
        thread_id: row.get("thread_id")?,
        channel: Channel::from_str(&channel).unwrap_or(Channel::System),
        direction: Direction::from_str(&direction).unwrap_or(Direction::Inbound),
        actor: row.get("actor")?,
        content: serde_json::from_str::<Vec<ContentBlock>>(&content).unwrap_or_default(),
        message_type: MessageType::from_str(&message_type).unwrap_or(MessageType::Text),
        usage: usage.and_then(|u| serde_json::from_str::<TokenUsage>(&u).ok()),
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_else(|| serde_json::json!({})),
        is_compacted: row.get::<_, i64>("is_compacted")? != 0,
        created_at: row.get("created_at")?,
    })
}
