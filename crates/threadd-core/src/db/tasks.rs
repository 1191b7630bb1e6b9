//! Task contexts: per-(thread, repo, issue) completion state

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use super::{ensure_thread, ThreadDB};
use crate::error::{CoreError, Result};
use crate::types::{now_millis, TaskContext, WorkspaceSnapshot};

/// Partial update for a task context
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub has_code_changes: Option<bool>,
    pub pr_created: Option<bool>,
    pub notified: Option<bool>,
    pub branch: Option<String>,
    pub completed_at: Option<i64>,
}

impl ThreadDB {
    /// Open a task for `(thread, repo, issue)`.
    ///
    /// Opening the same task again returns the existing row untouched, so the
    /// original baseline keeps driving change detection.
    pub fn upsert_task_context(
        &self,
        thread_id: &str,
        repo: &str,
        issue_number: i64,
        workspace_path: Option<&str>,
        baseline: &WorkspaceSnapshot,
    ) -> Result<TaskContext> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        ensure_thread(&tx, thread_id)?;

        let inserted = tx.execute(
            "INSERT INTO task_contexts (id, thread_id, repo, issue_number, workspace_path, head_commit, dirty_files, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(thread_id, repo, issue_number) DO NOTHING",
            params![
                Uuid::new_v4().to_string(),
                thread_id,
                repo,
                issue_number,
                workspace_path,
                baseline.head_commit,
                baseline.dirty_files,
                now_millis(),
            ],
        )?;

        let task = find_task(&tx, thread_id, repo, issue_number)?
            .ok_or_else(|| CoreError::not_found("task", format!("{}#{}", repo, issue_number)))?;
        tx.commit()?;
        debug!(
            task_id = %task.id,
            thread_id = %thread_id,
            repo = %repo,
            issue = issue_number,
            new = inserted > 0,
            "Task context opened"
        );
        Ok(task)
    }

    pub fn get_task_context(&self, id: &str) -> Result<TaskContext> {
        let conn = self.conn();
        let task = conn
            .query_row(
                "SELECT * FROM task_contexts WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()?;
        task.ok_or_else(|| CoreError::not_found("task", id))
    }

    pub fn find_task_context(
        &self,
        thread_id: &str,
        repo: &str,
        issue_number: i64,
    ) -> Result<Option<TaskContext>> {
        let conn = self.conn();
        find_task(&conn, thread_id, repo, issue_number)
    }

    /// Incomplete tasks of a thread, oldest first
    pub fn list_open_tasks(&self, thread_id: &str) -> Result<Vec<TaskContext>> {
        let conn = self.conn();
        ensure_thread(&conn, thread_id)?;
        let mut stmt = conn.prepare(
            "SELECT * FROM task_contexts WHERE thread_id = ?1 AND completed_at IS NULL
             ORDER BY started_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![thread_id], row_to_task)?;
        let mut tasks = Vec::new();
        for t in rows {
            tasks.push(t?);
        }
        Ok(tasks)
    }

    pub fn list_tasks(&self, thread_id: &str) -> Result<Vec<TaskContext>> {
        let conn = self.conn();
        ensure_thread(&conn, thread_id)?;
        let mut stmt = conn.prepare(
            "SELECT * FROM task_contexts WHERE thread_id = ?1 ORDER BY started_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![thread_id], row_to_task)?;
        let mut tasks = Vec::new();
        for t in rows {
            tasks.push(t?);
        }
        Ok(tasks)
    }

    pub fn update_task_flags(&self, id: &str, update: &TaskUpdate) -> Result<TaskContext> {
        let mut fields = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(v) = update.has_code_changes {
            fields.push("has_code_changes = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.pr_created {
            fields.push("pr_created = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.notified {
            fields.push("notified = ?");
            values.push(Box::new(v));
        }
        if let Some(branch) = &update.branch {
            fields.push("branch = ?");
            values.push(Box::new(branch.clone()));
        }
        if let Some(completed_at) = update.completed_at {
            fields.push("completed_at = ?");
            values.push(Box::new(completed_at));
        }

        if !fields.is_empty() {
            let sql = format!("UPDATE task_contexts SET {} WHERE id = ?", fields.join(", "));
            values.push(Box::new(id.to_string()));
            let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let changed = self.conn().execute(&sql, params.as_slice())?;
            if changed == 0 {
                return Err(CoreError::not_found("task", id));
            }
        }
        self.get_task_context(id)
    }
}

fn find_task(
    conn: &Connection,
    thread_id: &str,
    repo: &str,
    issue_number: i64,
) -> Result<Option<TaskContext>> {
    let task = conn
        .query_row(
            "SELECT * FROM task_contexts WHERE thread_id = ?1 AND repo = ?2 AND issue_number = ?3",
            params![thread_id, repo, issue_number],
            row_to_task,
        )
        .optional()?;
    Ok(task)
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<TaskContext> {
    Ok(TaskContext {
        id: row.get("id")?,
        thread_id: row.get("thread_id")?,
        repo: row.get("repo")?,
        issue_number: row.get("issue_number")?,
        has_code_changes: row.get::<_, i64>("has_code_changes")? != 0,
        pr_created: row.get::<_, i64>("pr_created")? != 0,
        notified: row.get::<_, i64>("notified")? != 0,
        branch: row.get("branch")?,
        workspace_path: row.get("workspace_path")?,
        baseline: WorkspaceSnapshot {
            head_commit: row.get("head_commit")?,
            dirty_files: row.get("dirty_files")?,
        },
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CreateThreadInput;

    fn setup() -> (ThreadDB, String) {
        let db = ThreadDB::in_memory().unwrap();
        let thread = db.create_thread(&CreateThreadInput::default()).unwrap();
        (db, thread.id)
    }

    fn baseline() -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            head_commit: Some("abc123".to_string()),
            dirty_files: 2,
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (db, id) = setup();
        let first = db
            .upsert_task_context(&id, "acme/app", 7, Some("/work/app"), &baseline())
            .unwrap();
        let second = db
            .upsert_task_context(&id, "acme/app", 7, None, &WorkspaceSnapshot::default())
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.baseline, baseline());
        assert_eq!(second.workspace_path.as_deref(), Some("/work/app"));
        assert_eq!(db.list_tasks(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_update_and_open_listing() {
        let (db, id) = setup();
        let a = db
            .upsert_task_context(&id, "acme/app", 1, None, &baseline())
            .unwrap();
        db.upsert_task_context(&id, "acme/app", 2, None, &baseline())
            .unwrap();
        assert_eq!(db.list_open_tasks(&id).unwrap().len(), 2);

        let updated = db
            .update_task_flags(
                &a.id,
                &TaskUpdate {
                    has_code_changes: Some(true),
                    branch: Some("fix/one".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.has_code_changes);
        assert_eq!(updated.branch.as_deref(), Some("fix/one"));

        db.update_task_flags(
            &a.id,
            &TaskUpdate {
                completed_at: Some(now_millis()),
                ..Default::default()
            },
        )
        .unwrap();
        let open = db.list_open_tasks(&id).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].issue_number, 2);
    }

    #[test]
    fn test_missing_task() {
        let (db, id) = setup();
        assert!(db.find_task_context(&id, "acme/app", 1).unwrap().is_none());
        assert!(matches!(
            db.get_task_context("nope").unwrap_err(),
            CoreError::NotFound { kind: "task", .. }
        ));
        assert!(db
            .update_task_flags(
                "nope",
                &TaskUpdate {
                    notified: Some(true),
                    ..Default::default()
                }
            )
            .is_err());
        assert!(db
            .upsert_task_context("ghost", "acme/app", 1, None, &baseline())
            .is_err());
    }
}
