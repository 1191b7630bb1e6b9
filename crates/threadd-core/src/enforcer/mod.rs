//! Completion enforcer
//!
//! Tracks each opened task through `started -> code_changed -> pr_created ->
//! notified` and reports the next step that still needs a forced follow-up
//! turn. It never talks to the agent itself; the orchestrator turns actions
//! into directive turns and then calls `mark_step`.

mod intent;
mod workspace;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::db::{TaskUpdate, ThreadDB};
use crate::error::{CoreError, Result};
use crate::types::{now_millis, TaskContext, TaskStep, WorkspaceSnapshot};

pub use intent::{completion_check_directive, HeuristicIntentDetector, IntentDetector, IntentSignal};
pub use workspace::{GitProbe, WorkspaceProbe, WorkspaceState};

/// A step detected as due for a task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementAction {
    pub task_id: String,
    pub thread_id: String,
    pub repo: String,
    pub issue_number: i64,
    pub step: TaskStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl EnforcementAction {
    /// Message for the forced follow-up turn
    pub fn directive(&self) -> String {
        let target = format!("{}#{}", self.repo, self.issue_number);
        match self.step {
            TaskStep::CodeChanged => format!(
                "[enforcer: code_changed] The workspace for {} has uncommitted or new changes. \
                 Commit them on a feature branch, push the branch, and open a pull request that references {}.",
                target, target
            ),
            TaskStep::PrCreated => format!(
                "[enforcer: pr_created] Branch `{}` for {} is pushed. Make sure a pull request is open for it \
                 and reply with the pull request URL.",
                self.branch.as_deref().unwrap_or("?"),
                target
            ),
            TaskStep::Notified => format!(
                "[enforcer: notified] The pull request for {} is open. Post a short completion notice: \
                 what changed, how it was verified, and the pull request link.",
                target
            ),
        }
    }
}

pub struct CompletionEnforcer {
    db: Arc<ThreadDB>,
    probe: Arc<dyn WorkspaceProbe>,
}

impl CompletionEnforcer {
    pub fn new(db: Arc<ThreadDB>, probe: Arc<dyn WorkspaceProbe>) -> Self {
        Self { db, probe }
    }

    /// Start tracking `(thread, repo, issue)`, capturing the workspace baseline.
    /// A probe failure leaves an empty baseline.
    pub async fn open_task(
        &self,
        thread_id: &str,
        repo: &str,
        issue_number: i64,
        workspace_path: Option<&Path>,
    ) -> Result<TaskContext> {
        if let Some(existing) = self.db.find_task_context(thread_id, repo, issue_number)? {
            return Ok(existing);
        }

        let baseline = match workspace_path {
            Some(path) => match self.probe.inspect(path).await {
                Ok(state) => state.snapshot,
                Err(e) => {
                    warn!(repo = %repo, path = %path.display(), error = %e, "Baseline probe failed");
                    WorkspaceSnapshot::default()
                }
            },
            None => WorkspaceSnapshot::default(),
        };

        let path_str = workspace_path.map(|p| p.to_string_lossy().to_string());
        let task = self.db.upsert_task_context(
            thread_id,
            repo,
            issue_number,
            path_str.as_deref(),
            &baseline,
        )?;
        info!(
            task_id = %task.id,
            thread_id = %thread_id,
            repo = %repo,
            issue = issue_number,
            head = ?baseline.head_commit,
            dirty = baseline.dirty_files,
            "Task opened"
        );
        Ok(task)
    }

    /// Next due step for one task, if any
    pub async fn check(&self, task_id: &str) -> Result<Option<EnforcementAction>> {
        let task = self.db.get_task_context(task_id)?;
        if task.is_completed() {
            return Ok(None);
        }

        if task.pr_created {
            return Ok((!task.notified).then(|| action(&task, TaskStep::Notified, task.branch.clone())));
        }

        let Some(state) = self.inspect(&task).await else {
            return Ok(None);
        };

        if !task.has_code_changes {
            let head_moved = state.snapshot.head_commit != task.baseline.head_commit;
            let more_dirty = state.snapshot.dirty_files > task.baseline.dirty_files;
            if head_moved || more_dirty {
                return Ok(Some(action(&task, TaskStep::CodeChanged, state.branch)));
            }
            return Ok(None);
        }

        if state.is_pushed_feature_branch() {
            return Ok(Some(action(&task, TaskStep::PrCreated, state.branch)));
        }
        Ok(None)
    }

    /// Due steps across every open task of a thread
    pub async fn check_thread(&self, thread_id: &str) -> Result<Vec<EnforcementAction>> {
        let mut actions = Vec::new();
        for task in self.db.list_open_tasks(thread_id)? {
            if let Some(a) = self.check(&task.id).await? {
                actions.push(a);
            }
        }
        Ok(actions)
    }

    /// Record a step as done. `Notified` requires a recorded PR and completes the task.
    pub fn mark_step(&self, task_id: &str, step: TaskStep, branch: Option<String>) -> Result<TaskContext> {
        let task = self.db.get_task_context(task_id)?;
        let update = match step {
            TaskStep::CodeChanged => TaskUpdate {
                has_code_changes: Some(true),
                branch,
                ..Default::default()
            },
            TaskStep::PrCreated => TaskUpdate {
                has_code_changes: Some(true),
                pr_created: Some(true),
                branch,
                ..Default::default()
            },
            TaskStep::Notified => {
                if !task.pr_created {
                    return Err(CoreError::InvalidTransition(format!(
                        "task {} cannot be notified before a pull request is recorded",
                        task.id
                    )));
                }
                TaskUpdate {
                    notified: Some(true),
                    completed_at: Some(now_millis()),
                    branch,
                    ..Default::default()
                }
            }
        };

        let updated = self.db.update_task_flags(task_id, &update)?;
        info!(
            task_id = %task_id,
            repo = %updated.repo,
            issue = updated.issue_number,
            step = step.as_str(),
            stage = updated.stage(),
            "Task step recorded"
        );
        Ok(updated)
    }

    async fn inspect(&self, task: &TaskContext) -> Option<WorkspaceState> {
        let path = task.workspace_path.as_deref()?;
        match self.probe.inspect(Path::new(path)).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(task_id = %task.id, path = %path, error = %e, "Workspace probe failed, skipping enforcement");
                None
            }
        }
    }
}

fn action(task: &TaskContext, step: TaskStep, branch: Option<String>) -> EnforcementAction {
    EnforcementAction {
        task_id: task.id.clone(),
        thread_id: task.thread_id.clone(),
        repo: task.repo.clone(),
        issue_number: task.issue_number,
        step,
        branch,
    }
}
