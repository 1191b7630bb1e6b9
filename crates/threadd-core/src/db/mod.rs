//! SQLite persistence for threads, thread refs, thread events and task contexts
//!
//! `ThreadDB` is the only writer of thread state. Callers go through its
//! transition functions; nothing outside this module issues SQL.

mod events;
mod tasks;

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::types::{
    now_millis, CreateThreadInput, ForkMode, ForkOptions, NewThreadRef, RefType, Thread,
    ThreadFilter, ThreadKind, ThreadLineage, ThreadRef, ThreadStatus,
};

pub use events::SYSTEM_ACTOR;
pub use tasks::TaskUpdate;

const SCHEMA: &str = r#"
-- Threads (cross-channel conversations)
CREATE TABLE IF NOT EXISTS threads (
  id TEXT PRIMARY KEY,
  legacy_id TEXT,
  topic TEXT,
  kind TEXT NOT NULL DEFAULT 'chat',
  status TEXT NOT NULL DEFAULT 'active',
  session_id TEXT,
  summary TEXT,
  parent_thread_id TEXT REFERENCES threads(id),
  fork_point_event_id INTEGER,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  closed_at INTEGER,
  archived_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_threads_status ON threads(status);
CREATE INDEX IF NOT EXISTS idx_threads_parent ON threads(parent_thread_id);
CREATE INDEX IF NOT EXISTS idx_threads_updated ON threads(updated_at);

-- Links to issues / pull requests / commits / branches
CREATE TABLE IF NOT EXISTS thread_refs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
  ref_type TEXT NOT NULL,
  repo TEXT NOT NULL,
  number INTEGER,
  ref_name TEXT,
  url TEXT,
  status TEXT,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_thread_refs_lookup ON thread_refs(ref_type, repo, number);
CREATE INDEX IF NOT EXISTS idx_thread_refs_thread ON thread_refs(thread_id);

-- Timeline events (append-only)
CREATE TABLE IF NOT EXISTS thread_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
  channel TEXT NOT NULL,
  direction TEXT NOT NULL,
  actor TEXT NOT NULL,
  content TEXT NOT NULL,
  message_type TEXT NOT NULL DEFAULT 'text',
  usage TEXT,
  metadata TEXT,
  is_compacted INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_thread_events_timeline ON thread_events(thread_id, created_at);

-- Tracked units of work (completion enforcement)
CREATE TABLE IF NOT EXISTS task_contexts (
  id TEXT PRIMARY KEY,
  thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
  repo TEXT NOT NULL,
  issue_number INTEGER NOT NULL,
  has_code_changes INTEGER NOT NULL DEFAULT 0,
  pr_created INTEGER NOT NULL DEFAULT 0,
  notified INTEGER NOT NULL DEFAULT 0,
  branch TEXT,
  workspace_path TEXT,
  head_commit TEXT,
  dirty_files INTEGER NOT NULL DEFAULT 0,
  started_at INTEGER NOT NULL,
  completed_at INTEGER,
  UNIQUE(thread_id, repo, issue_number)
);
CREATE INDEX IF NOT EXISTS idx_task_contexts_open ON task_contexts(thread_id) WHERE completed_at IS NULL;
"#;

/// SQLite database for the thread store
pub struct ThreadDB {
    conn: Mutex<Connection>,
}

impl ThreadDB {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        info!(path = %db_path.as_ref().display(), "Thread store opened");
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("ThreadDB mutex poisoned")
    }

    fn init(&self) -> Result<()> {
        {
            let conn = self.conn();
            conn.execute_batch(SCHEMA)?;
        }
        self.migrate()
    }

    /// Additive migrations for databases created by earlier versions
    fn migrate(&self) -> Result<()> {
        let conn = self.conn();

        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(threads)")?
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();

        if !columns.iter().any(|c| c == "legacy_id") {
            conn.execute_batch("ALTER TABLE threads ADD COLUMN legacy_id TEXT;")?;
        }
        if !columns.iter().any(|c| c == "kind") {
            conn.execute_batch("ALTER TABLE threads ADD COLUMN kind TEXT NOT NULL DEFAULT 'chat';")?;
        }

        conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_legacy ON threads(legacy_id) WHERE legacy_id IS NOT NULL;",
        )?;
        Ok(())
    }

    // ============ Threads ============

    /// Create a new active thread
    pub fn create_thread(&self, input: &CreateThreadInput) -> Result<Thread> {
        let now = now_millis();
        let thread = Thread {
            id: Uuid::new_v4().to_string(),
            legacy_id: input.legacy_id.clone(),
            topic: input.topic.clone(),
            kind: input.kind,
            status: ThreadStatus::Active,
            session_id: None,
            summary: None,
            parent_thread_id: None,
            fork_point_event_id: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            archived_at: None,
        };
        let conn = self.conn();
        insert_thread(&conn, &thread)?;
        debug!(thread_id = %thread.id, kind = thread.kind.as_str(), "Thread created");
        Ok(thread)
    }

    /// Look up a thread by id or legacy conversation id
    pub fn find_thread(&self, id: &str) -> Result<Option<Thread>> {
        let conn = self.conn();
        find_thread(&conn, id)
    }

    /// Like `find_thread`, but a missing thread is an error
    pub fn get_thread(&self, id: &str) -> Result<Thread> {
        self.find_thread(id)?
            .ok_or_else(|| CoreError::not_found("thread", id))
    }

    /// List threads, most recently updated first
    pub fn list_threads(&self, filter: &ThreadFilter) -> Result<Vec<Thread>> {
        let mut sql = String::from("SELECT * FROM threads WHERE 1=1");
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            values.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(kind) = filter.kind {
            values.push(Box::new(kind.as_str().to_string()));
            sql.push_str(&format!(" AND kind = ?{}", values.len()));
        }
        if let Some(parent) = &filter.parent_thread_id {
            values.push(Box::new(parent.clone()));
            sql.push_str(&format!(" AND parent_thread_id = ?{}", values.len()));
        }
        values.push(Box::new(filter.limit.unwrap_or(-1)));
        sql.push_str(&format!(" ORDER BY updated_at DESC, id ASC LIMIT ?{}", values.len()));
        values.push(Box::new(filter.offset.unwrap_or(0)));
        sql.push_str(&format!(" OFFSET ?{}", values.len()));

        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), row_to_thread)?;
        let mut threads = Vec::new();
        for t in rows {
            threads.push(t?);
        }
        Ok(threads)
    }

    /// Move a thread along the status graph.
    ///
    /// `closed_at` is stamped entering `stopped`, `archived_at` entering
    /// `archived`; reopening to `active` clears both.
    pub fn update_thread_status(&self, id: &str, status: ThreadStatus) -> Result<Thread> {
        let conn = self.conn();
        let mut thread =
            find_thread(&conn, id)?.ok_or_else(|| CoreError::not_found("thread", id))?;

        if thread.status == status {
            return Ok(thread);
        }
        if !thread.status.can_transition_to(status) {
            return Err(CoreError::InvalidTransition(format!(
                "thread {} cannot move from {} to {}",
                thread.id,
                thread.status.as_str(),
                status.as_str()
            )));
        }

        let now = now_millis();
        match status {
            ThreadStatus::Active => {
                thread.closed_at = None;
                thread.archived_at = None;
            }
            ThreadStatus::Stopped => thread.closed_at = Some(now),
            ThreadStatus::Archived => thread.archived_at = Some(now),
            ThreadStatus::Paused => {}
        }
        let previous = thread.status;
        thread.status = status;
        thread.updated_at = now;

        conn.execute(
            "UPDATE threads SET status = ?1, closed_at = ?2, archived_at = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                status.as_str(),
                thread.closed_at,
                thread.archived_at,
                now,
                thread.id
            ],
        )?;
        info!(
            thread_id = %thread.id,
            from = previous.as_str(),
            to = status.as_str(),
            "Thread status changed"
        );
        Ok(thread)
    }

    /// Set or clear the resumable agent session handle
    pub fn set_thread_session(&self, id: &str, session_id: Option<&str>) -> Result<()> {
        self.update_thread_column(id, "session_id", session_id)
    }

    pub fn update_thread_topic(&self, id: &str, topic: &str) -> Result<()> {
        self.update_thread_column(id, "topic", Some(topic))
    }

    pub fn update_thread_summary(&self, id: &str, summary: &str) -> Result<()> {
        self.update_thread_column(id, "summary", Some(summary))
    }

    pub fn update_thread_kind(&self, id: &str, kind: ThreadKind) -> Result<()> {
        self.update_thread_column(id, "kind", Some(kind.as_str()))
    }

    fn update_thread_column(&self, id: &str, column: &str, value: Option<&str>) -> Result<()> {
        let sql = format!(
            "UPDATE threads SET {} = ?1, updated_at = ?2 WHERE id = ?3",
            column
        );
        let conn = self.conn();
        let changed = conn.execute(&sql, params![value, now_millis(), id])?;
        if changed == 0 {
            return Err(CoreError::not_found("thread", id));
        }
        Ok(())
    }

    // ============ Thread Refs ============

    /// Link a thread to an external artifact.
    ///
    /// At most one row exists per (thread, ref_type, repo, number); refs
    /// without a number are keyed by `ref_name` instead. A repeated link only
    /// refreshes url / status / ref_name.
    pub fn add_thread_ref(&self, thread_id: &str, new_ref: &NewThreadRef) -> Result<ThreadRef> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        ensure_thread(&tx, thread_id)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM thread_refs
                 WHERE thread_id = ?1 AND ref_type = ?2 AND repo = ?3 AND number IS ?4
                   AND (?4 IS NOT NULL OR ref_name IS ?5)",
                params![
                    thread_id,
                    new_ref.ref_type.as_str(),
                    new_ref.repo,
                    new_ref.number,
                    new_ref.ref_name
                ],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE thread_refs SET
                        url = COALESCE(?1, url),
                        status = COALESCE(?2, status),
                        ref_name = COALESCE(?3, ref_name)
                     WHERE id = ?4",
                    params![new_ref.url, new_ref.status, new_ref.ref_name, id],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO thread_refs (thread_id, ref_type, repo, number, ref_name, url, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        thread_id,
                        new_ref.ref_type.as_str(),
                        new_ref.repo,
                        new_ref.number,
                        new_ref.ref_name,
                        new_ref.url,
                        new_ref.status,
                        now_millis()
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        let stored = tx.query_row(
            "SELECT * FROM thread_refs WHERE id = ?1",
            params![id],
            row_to_thread_ref,
        )?;
        tx.commit()?;
        debug!(
            thread_id = %thread_id,
            ref_type = stored.ref_type.as_str(),
            repo = %stored.repo,
            number = ?stored.number,
            "Thread ref linked"
        );
        Ok(stored)
    }

    pub fn get_thread_refs(&self, thread_id: &str) -> Result<Vec<ThreadRef>> {
        let conn = self.conn();
        ensure_thread(&conn, thread_id)?;
        refs_for_thread(&conn, thread_id)
    }

    /// Most recently updated thread linked to the given artifact
    pub fn find_thread_by_ref(
        &self,
        ref_type: RefType,
        repo: &str,
        number: i64,
    ) -> Result<Option<Thread>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.* FROM threads t
             JOIN thread_refs r ON r.thread_id = t.id
             WHERE r.ref_type = ?1 AND r.repo = ?2 AND r.number = ?3
             ORDER BY t.updated_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![ref_type.as_str(), repo, number])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_thread(row)?))
        } else {
            Ok(None)
        }
    }

    /// Update the status of every ref pointing at an artifact (e.g. a merged PR).
    /// Returns the number of refs updated.
    pub fn update_thread_ref_status(
        &self,
        ref_type: RefType,
        repo: &str,
        number: i64,
        status: &str,
    ) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE thread_refs SET status = ?1 WHERE ref_type = ?2 AND repo = ?3 AND number = ?4",
            params![status, ref_type.as_str(), repo, number],
        )?;
        Ok(n)
    }

    // ============ Fork / Lineage ============

    /// Create a child thread derived from `source_id`.
    ///
    /// The fork point defaults to the source's head event. Copy mode clones
    /// every event up to and including the fork point; summary mode seeds the
    /// child with a single summary event. Refs are copied in both modes.
    pub fn fork_thread(&self, source_id: &str, options: &ForkOptions) -> Result<Thread> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let source =
            find_thread(&tx, source_id)?.ok_or_else(|| CoreError::not_found("thread", source_id))?;

        let fork_point: Option<(i64, i64)> = match options.at_event_id {
            Some(event_id) => Some(
                tx.query_row(
                    "SELECT id, created_at FROM thread_events WHERE id = ?1 AND thread_id = ?2",
                    params![event_id, source.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| CoreError::not_found("event", event_id))?,
            ),
            None => tx
                .query_row(
                    "SELECT id, created_at FROM thread_events WHERE thread_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![source.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
        };

        let now = now_millis();
        let summary = match &options.mode {
            ForkMode::Summary(text) => Some(text.clone()),
            ForkMode::Copy => source.summary.clone(),
        };
        let child = Thread {
            id: Uuid::new_v4().to_string(),
            legacy_id: None,
            topic: options.topic.clone().or_else(|| source.topic.clone()),
            kind: source.kind,
            status: ThreadStatus::Active,
            session_id: None,
            summary,
            parent_thread_id: Some(source.id.clone()),
            fork_point_event_id: fork_point.map(|(id, _)| id),
            created_at: now,
            updated_at: now,
            closed_at: None,
            archived_at: None,
        };
        insert_thread(&tx, &child)?;

        let copied = match (&options.mode, fork_point) {
            (ForkMode::Copy, Some((fp_id, fp_ts))) => tx.execute(
                "INSERT INTO thread_events
                    (thread_id, channel, direction, actor, content, message_type, usage, metadata, is_compacted, created_at)
                 SELECT ?1, channel, direction, actor, content, message_type, usage, metadata, is_compacted, created_at
                 FROM thread_events
                 WHERE thread_id = ?2 AND (created_at < ?3 OR (created_at = ?3 AND id <= ?4))
                 ORDER BY created_at ASC, id ASC",
                params![child.id, source.id, fp_ts, fp_id],
            )?,
            (ForkMode::Copy, None) => 0,
            (ForkMode::Summary(text), _) => {
                events::insert_summary_event(&tx, &child.id, text, now, &source.id)?;
                1
            }
        };

        tx.execute(
            "INSERT INTO thread_refs (thread_id, ref_type, repo, number, ref_name, url, status, created_at)
             SELECT ?1, ref_type, repo, number, ref_name, url, status, created_at
             FROM thread_refs WHERE thread_id = ?2 ORDER BY id ASC",
            params![child.id, source.id],
        )?;
        tx.commit()?;

        info!(
            source = %source.id,
            child = %child.id,
            fork_point = ?child.fork_point_event_id,
            events = copied,
            summary_mode = matches!(options.mode, ForkMode::Summary(_)),
            "Thread forked"
        );
        Ok(child)
    }

    /// Parent, fork-point event and direct children of a thread
    pub fn get_thread_lineage(&self, thread_id: &str) -> Result<ThreadLineage> {
        let conn = self.conn();
        let thread =
            find_thread(&conn, thread_id)?.ok_or_else(|| CoreError::not_found("thread", thread_id))?;

        let parent = match &thread.parent_thread_id {
            Some(pid) => find_thread(&conn, pid)?,
            None => None,
        };
        let fork_point_event = match thread.fork_point_event_id {
            Some(eid) => events::find_event(&conn, eid)?,
            None => None,
        };

        let mut stmt = conn.prepare(
            "SELECT * FROM threads WHERE parent_thread_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![thread.id], row_to_thread)?;
        let mut children = Vec::new();
        for c in rows {
            children.push(c?);
        }

        Ok(ThreadLineage {
            parent,
            fork_point_event,
            children,
        })
    }
}

// ============ Row helpers ============

fn insert_thread(conn: &Connection, thread: &Thread) -> Result<()> {
    conn.execute(
        "INSERT INTO threads (id, legacy_id, topic, kind, status, session_id, summary, parent_thread_id,
                              fork_point_event_id, created_at, updated_at, closed_at, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            thread.id,
            thread.legacy_id,
            thread.topic,
            thread.kind.as_str(),
            thread.status.as_str(),
            thread.session_id,
            thread.summary,
            thread.parent_thread_id,
            thread.fork_point_event_id,
            thread.created_at,
            thread.updated_at,
            thread.closed_at,
            thread.archived_at,
        ],
    )?;
    Ok(())
}

fn find_thread(conn: &Connection, id: &str) -> Result<Option<Thread>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM threads WHERE id = ?1 OR legacy_id = ?1 ORDER BY (id = ?1) DESC LIMIT 1",
    )?;
    let mut rows = stmt.query(params![id])?;
    if let Some(row) = rows.next()? {
        Ok(Some(row_to_thread(row)?))
    } else {
        Ok(None)
    }
}

fn ensure_thread(conn: &Connection, id: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM threads WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(CoreError::not_found("thread", id))
    }
}

fn refs_for_thread(conn: &Connection, thread_id: &str) -> Result<Vec<ThreadRef>> {
    let mut stmt =
        conn.prepare("SELECT * FROM thread_refs WHERE thread_id = ?1 ORDER BY id ASC")?;
    let rows = stmt.query_map(params![thread_id], row_to_thread_ref)?;
    let mut refs = Vec::new();
    for r in rows {
        refs.push(r?);
    }
    Ok(refs)
}

fn row_to_thread(row: &rusqlite::Row) -> rusqlite::Result<Thread> {
    let status: String = row.get("status")?;
    let kind: String = row.get("kind")?;
    Ok(Thread {
        id: row.get("id")?,
        legacy_id: row.get("legacy_id")?,
        topic: row.get("topic")?,
        kind: ThreadKind::from_str(&kind).unwrap_or_default(),
        status: ThreadStatus::from_str(&status).unwrap_or(ThreadStatus::Active),
        session_id: row.get("session_id")?,
        summary: row.get("summary")?,
        parent_thread_id: row.get("parent_thread_id")?,
        fork_point_event_id: row.get("fork_point_event_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        closed_at: row.get("closed_at")?,
        archived_at: row.get("archived_at")?,
    })
}

fn row_to_thread_ref(row: &rusqlite::Row) -> rusqlite::Result<ThreadRef> {
    let ref_type: String = row.get("ref_type")?;
    Ok(ThreadRef {
        id: row.get("id")?,
        thread_id: row.get("thread_id")?,
        ref_type: RefType::from_str(&ref_type).unwrap_or(RefType::Issue),
        repo: row.get("repo")?,
        number: row.get("number")?,
        ref_name: row.get("ref_name")?,
        url: row.get("url")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
    })
}
