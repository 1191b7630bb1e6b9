//! Context stack builder
//!
//! Assembles the bounded layers injected on top of the system prompt:
//! repo knowledge, linked issue chain, parent-thread lineage and, for task
//! threads, the execution plan. A failing upstream fetch drops only its layer.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    claude_md_key, estimate_tokens, issue_key, stack_key, ContextCache, ContextLayer,
    ContextStack, ForgeClient, ForgeIssue, LayerKind, TRUNCATION_MARKER,
};
use crate::db::ThreadDB;
use crate::error::Result;
use crate::types::{MessageType, RefType, Thread, ThreadKind};

static PARENT_ISSUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:part of|parent:)\s*#(\d+)").expect("valid regex"));

/// Per-layer token budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerBudgets {
    pub repo: usize,
    pub ticket: usize,
    pub lineage: usize,
    pub execution: usize,
    pub total: usize,
    /// Raw knowledge file cap before token bounding
    pub knowledge_max_bytes: usize,
}

impl Default for LayerBudgets {
    fn default() -> Self {
        Self {
            repo: 4000,
            ticket: 2000,
            lineage: 1000,
            execution: 1000,
            total: 7000,
            knowledge_max_bytes: 16 * 1024,
        }
    }
}

impl LayerBudgets {
    fn for_kind(&self, kind: LayerKind) -> usize {
        match kind {
            LayerKind::Repo => self.repo,
            LayerKind::Ticket => self.ticket,
            LayerKind::Lineage => self.lineage,
            LayerKind::Execution => self.execution,
        }
    }
}

/// What to inject for this turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    /// Fresh session or no live baseline
    Full,
    /// Only these layers changed since the last injection
    Delta(Vec<String>),
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ContextBuild {
    pub stack: ContextStack,
    pub from_cache: bool,
    pub injection: Injection,
}

impl ContextBuild {
    /// Text to send for this injection decision
    pub fn injected_text(&self) -> String {
        match &self.injection {
            Injection::Full => self.stack.formatted.clone(),
            Injection::Delta(layers) => self.stack.format_subset(layers),
            Injection::Unchanged => String::new(),
        }
    }
}

/// One step of an execution plan event
#[derive(Debug, Clone, Deserialize)]
struct PlanStep {
    title: String,
    #[serde(default)]
    status: String,
}

pub struct ContextStackBuilder {
    db: Arc<ThreadDB>,
    cache: Arc<ContextCache>,
    forge: Arc<dyn ForgeClient>,
    budgets: LayerBudgets,
}

impl ContextStackBuilder {
    pub fn new(
        db: Arc<ThreadDB>,
        cache: Arc<ContextCache>,
        forge: Arc<dyn ForgeClient>,
        budgets: LayerBudgets,
    ) -> Self {
        Self {
            db,
            cache,
            forge,
            budgets,
        }
    }

    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.cache
    }

    /// Build every applicable layer from scratch (upstream results still go through the cache)
    pub async fn build_context_stack(&self, thread_id: &str) -> Result<ContextStack> {
        let thread = self.db.get_thread(thread_id)?;
        let mut raw: Vec<(LayerKind, String)> = Vec::new();

        if let Some(text) = self.repo_layer(&thread).await? {
            raw.push((LayerKind::Repo, text));
        }
        if let Some(text) = self.ticket_layer(&thread).await? {
            raw.push((LayerKind::Ticket, text));
        }
        if let Some(text) = self.lineage_layer(&thread)? {
            raw.push((LayerKind::Lineage, text));
        }
        if let Some(text) = self.execution_layer(&thread)? {
            raw.push((LayerKind::Execution, text));
        }

        let stack = ContextStack::new(&thread.id, self.bound_layers(raw));
        debug!(
            thread_id = %thread.id,
            layers = stack.layers.len(),
            tokens = stack.total_tokens,
            "Context stack built"
        );
        Ok(stack)
    }

    /// Cached build with per-session delta detection.
    ///
    /// With a session id, the result says which layers changed since that
    /// session's last injection. The baseline is left untouched; call
    /// [`Self::mark_injected`] once the agent has actually received the text.
    pub async fn build_context_stack_cached(
        &self,
        thread_id: &str,
        session_id: Option<&str>,
    ) -> Result<ContextBuild> {
        let thread = self.db.get_thread(thread_id)?;
        let key = stack_key(&thread.id);

        let (stack, from_cache) = match self.cache.get::<ContextStack>(&key) {
            Some(stack) => (stack, true),
            None => {
                let stack = self.build_context_stack(&thread.id).await?;
                self.cache
                    .set(&key, &stack, self.cache.config().stack_ttl())?;
                (stack, false)
            }
        };

        let injection = match session_id {
            None => Injection::Full,
            Some(session) => match self.cache.detect_changes(session, &stack.checksums()) {
                None => Injection::Full,
                Some(changed) if changed.is_empty() => Injection::Unchanged,
                Some(changed) => Injection::Delta(changed),
            },
        };

        debug!(
            thread_id = %thread.id,
            from_cache,
            injection = ?injection,
            "Context stack resolved"
        );
        Ok(ContextBuild {
            stack,
            from_cache,
            injection,
        })
    }

    /// Freshly built lineage layer, used to override a parent's cached stack on fork
    pub fn lineage_layer_for(&self, thread_id: &str) -> Result<Option<ContextLayer>> {
        let thread = self.db.get_thread(thread_id)?;
        Ok(self
            .lineage_layer(&thread)?
            .map(|text| ContextLayer::bounded(LayerKind::Lineage, &text, self.budgets.lineage)))
    }

    /// Record `stack` as what `session_id` has seen
    pub fn mark_injected(&self, session_id: &str, stack: &ContextStack) {
        self.cache
            .record_injection(session_id, &stack.thread_id, stack.checksums());
    }

    /// Apply per-layer caps, then shave the overflow of the combined cap off
    /// the lowest-priority layers (repo first).
    fn bound_layers(&self, raw: Vec<(LayerKind, String)>) -> Vec<ContextLayer> {
        let mut caps: Vec<usize> = raw
            .iter()
            .map(|(kind, text)| estimate_tokens(text).min(self.budgets.for_kind(*kind)))
            .collect();

        let mut overflow = caps.iter().sum::<usize>().saturating_sub(self.budgets.total);
        for kind in [
            LayerKind::Repo,
            LayerKind::Ticket,
            LayerKind::Lineage,
            LayerKind::Execution,
        ] {
            if overflow == 0 {
                break;
            }
            if let Some(i) = raw.iter().position(|(k, _)| *k == kind) {
                let cut = overflow.min(caps[i]);
                caps[i] -= cut;
                overflow -= cut;
            }
        }

        raw.into_iter()
            .zip(caps)
            .filter(|(_, cap)| *cap > 0)
            .map(|((kind, text), cap)| ContextLayer::bounded(kind, &text, cap))
            .collect()
    }

    async fn repo_layer(&self, thread: &Thread) -> Result<Option<String>> {
        let mut repos: Vec<String> = Vec::new();
        for r in self.db.get_thread_refs(&thread.id)? {
            if !repos.contains(&r.repo) {
                repos.push(r.repo);
            }
        }

        let mut sections = Vec::new();
        for repo in repos {
            if let Some(text) = self.knowledge_file(&repo).await {
                sections.push(format!("### {}\n\n{}", repo, text));
            }
        }
        Ok((!sections.is_empty()).then(|| sections.join("\n\n")))
    }

    async fn knowledge_file(&self, repo: &str) -> Option<String> {
        let key = claude_md_key(repo);
        if let Some(text) = self.cache.get::<String>(&key) {
            return Some(text).filter(|t| !t.is_empty());
        }

        let path = self.cache.config().knowledge_file.clone();
        match self.forge.fetch_file(repo, &path).await {
            Ok(content) => {
                let text = content
                    .map(|c| truncate_bytes(&c, self.budgets.knowledge_max_bytes))
                    .unwrap_or_default();
                // Missing files are cached as empty so they are not refetched every turn
                if let Err(e) = self
                    .cache
                    .set(&key, &text, self.cache.config().knowledge_ttl())
                {
                    warn!(repo = %repo, error = %e, "Failed to cache knowledge file");
                }
                Some(text).filter(|t| !t.is_empty())
            }
            Err(e) => {
                warn!(repo = %repo, path = %path, error = %e, "Knowledge file fetch failed, layer degraded");
                None
            }
        }
    }

    async fn ticket_layer(&self, thread: &Thread) -> Result<Option<String>> {
        let refs = self.db.get_thread_refs(&thread.id)?;
        let linked: Vec<(String, i64)> = refs
            .into_iter()
            .filter(|r| r.ref_type == RefType::Issue)
            .filter_map(|r| r.number.map(|n| (r.repo, n)))
            .collect();

        let mut chain: Vec<(String, ForgeIssue)> = Vec::new();
        for (repo, number) in &linked {
            let Some(issue) = self.issue(repo, *number).await else {
                continue;
            };

            if let Some(parent_number) = parent_issue_number(&issue.body) {
                let already = chain
                    .iter()
                    .any(|(r, i)| r == repo && i.number == parent_number)
                    || linked.iter().any(|(r, n)| r == repo && *n == parent_number);
                if parent_number != *number && !already {
                    if let Some(parent) = self.issue(repo, parent_number).await {
                        chain.push((repo.clone(), parent));
                    }
                }
            }
            if !chain.iter().any(|(r, i)| r == repo && i.number == issue.number) {
                chain.push((repo.clone(), issue));
            }
        }

        if chain.is_empty() {
            return Ok(None);
        }
        let rendered: Vec<String> = chain
            .iter()
            .map(|(repo, issue)| render_issue(repo, issue))
            .collect();
        Ok(Some(rendered.join("\n\n")))
    }

    async fn issue(&self, repo: &str, number: i64) -> Option<ForgeIssue> {
        let key = issue_key(repo, number);
        if let Some(issue) = self.cache.get::<ForgeIssue>(&key) {
            return Some(issue);
        }
        match self.forge.fetch_issue(repo, number).await {
            Ok(issue) => {
                if let Err(e) = self
                    .cache
                    .set(&key, &issue, self.cache.config().issue_ttl())
                {
                    warn!(repo = %repo, number, error = %e, "Failed to cache issue");
                }
                Some(issue)
            }
            Err(e) => {
                warn!(repo = %repo, number, error = %e, "Issue fetch failed, skipping");
                None
            }
        }
    }

    fn lineage_layer(&self, thread: &Thread) -> Result<Option<String>> {
        let Some(parent_id) = &thread.parent_thread_id else {
            return Ok(None);
        };
        let Some(parent) = self.db.find_thread(parent_id)? else {
            warn!(thread_id = %thread.id, parent = %parent_id, "Parent thread missing");
            return Ok(None);
        };

        let mut text = String::new();
        let headline = parent
            .summary
            .clone()
            .or_else(|| parent.topic.clone().map(|t| format!("Topic: {}", t)));
        if let Some(h) = headline {
            text.push_str(&h);
        }

        let refs = self.db.get_thread_refs(&parent.id)?;
        if !refs.is_empty() {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str("Linked:");
            for r in refs {
                let target = match (r.number, &r.ref_name) {
                    (Some(n), _) => format!("{}#{}", r.repo, n),
                    (None, Some(name)) => format!("{}@{}", r.repo, name),
                    (None, None) => r.repo.clone(),
                };
                let status = r.status.map(|s| format!(" ({})", s)).unwrap_or_default();
                text.push_str(&format!("\n- {} {}{}", r.ref_type.as_str(), target, status));
            }
        }

        Ok((!text.is_empty()).then_some(text))
    }

    fn execution_layer(&self, thread: &Thread) -> Result<Option<String>> {
        if thread.kind != ThreadKind::Task {
            return Ok(None);
        }
        let Some(event) = self
            .db
            .latest_event(&thread.id, Some(MessageType::ExecutionPlan))?
        else {
            return Ok(None);
        };

        let steps: Option<Vec<PlanStep>> = event
            .metadata
            .get("steps")
            .and_then(|s| serde_json::from_value(s.clone()).ok());

        let text = match steps {
            Some(steps) if !steps.is_empty() => steps
                .iter()
                .enumerate()
                .map(|(i, s)| format!("{}. {} {}", i + 1, status_icon(&s.status), s.title))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => event.text(),
        };
        Ok((!text.trim().is_empty()).then_some(text))
    }
}

pub(crate) fn parent_issue_number(body: &str) -> Option<i64> {
    PARENT_ISSUE_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn render_issue(repo: &str, issue: &ForgeIssue) -> String {
    let state = if issue.state.is_empty() {
        String::new()
    } else {
        format!(" [{}]", issue.state)
    };
    let mut out = format!("### {}#{}: {}{}", repo, issue.number, issue.title, state);
    if !issue.body.trim().is_empty() {
        out.push_str("\n\n");
        out.push_str(issue.body.trim());
    }
    out
}

fn status_icon(status: &str) -> &'static str {
    match status {
        "done" | "completed" => "✅",
        "in_progress" | "running" => "🔄",
        "failed" | "error" => "❌",
        "skipped" => "⏭️",
        _ => "⬜",
    }
}

fn truncate_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n{}", &text[..end], TRUNCATION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CacheConfig;
    use crate::error::CoreError;
    use crate::types::{
        Channel, CreateThreadInput, Direction, ForkOptions, NewThreadEvent, NewThreadRef,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeForge {
        files: HashMap<String, String>,
        issues: HashMap<i64, ForgeIssue>,
        fail_files: bool,
        calls: AtomicUsize,
    }

    impl FakeForge {
        fn with_issue(mut self, number: i64, title: &str, body: &str) -> Self {
            self.issues.insert(
                number,
                ForgeIssue {
                    number,
                    title: title.to_string(),
                    body: body.to_string(),
                    state: "open".to_string(),
                    labels: vec![],
                },
            );
            self
        }
    }

    #[async_trait]
    impl ForgeClient for FakeForge {
        async fn fetch_file(&self, repo: &str, _path: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_files {
                return Err(CoreError::Upstream("forge unavailable".to_string()));
            }
            Ok(self.files.get(repo).cloned())
        }

        async fn fetch_issue(&self, _repo: &str, number: i64) -> Result<ForgeIssue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.issues
                .get(&number)
                .cloned()
                .ok_or_else(|| CoreError::Upstream(format!("issue {} missing", number)))
        }
    }

    fn setup(forge: FakeForge) -> (Arc<ThreadDB>, Arc<FakeForge>, ContextStackBuilder) {
        let db = Arc::new(ThreadDB::in_memory().unwrap());
        let forge = Arc::new(forge);
        let builder = ContextStackBuilder::new(
            Arc::clone(&db),
            Arc::new(ContextCache::new(CacheConfig::default())),
            forge.clone(),
            LayerBudgets::default(),
        );
        (db, forge, builder)
    }

    #[test]
    fn test_parent_issue_pattern() {
        assert_eq!(parent_issue_number("Part of #12 rollout"), Some(12));
        assert_eq!(parent_issue_number("parent: #7"), Some(7));
        assert_eq!(parent_issue_number("see #7"), None);
    }

    #[tokio::test]
    async fn test_ticket_chain_puts_parent_first() {
        let forge = FakeForge::default()
            .with_issue(10, "Epic: auth", "Overall plan")
            .with_issue(11, "Fix login", "Part of #10\n\nLogin fails on Safari");
        let (db, _, builder) = setup(forge);
        let thread = db.create_thread(&CreateThreadInput::default()).unwrap();
        db.add_thread_ref(&thread.id, &NewThreadRef::issue("acme/app", 11))
            .unwrap();

        let stack = builder.build_context_stack(&thread.id).await.unwrap();
        let ticket = &stack.layer(LayerKind::Ticket).unwrap().content;
        let parent_pos = ticket.find("#10: Epic").unwrap();
        let child_pos = ticket.find("#11: Fix login").unwrap();
        assert!(parent_pos < child_pos);
    }

    #[tokio::test]
    async fn test_repo_layer_truncated_to_budget() {
        let mut forge = FakeForge::default();
        forge
            .files
            .insert("acme/app".to_string(), "rule\n".repeat(10_000));
        let (db, _, builder) = setup(forge);
        let thread = db.create_thread(&CreateThreadInput::default()).unwrap();
        db.add_thread_ref(&thread.id, &NewThreadRef::issue("acme/app", 1))
            .unwrap();

        let stack = builder.build_context_stack(&thread.id).await.unwrap();
        let repo = stack.layer(LayerKind::Repo).unwrap();
        assert!(repo.truncated);
        assert!(repo.content.ends_with(TRUNCATION_MARKER));
        assert!(repo.tokens <= 4000);
        assert!(stack.total_tokens <= 7000);
        // Issue #1 is unknown to the forge: ticket layer degrades to absent
        assert!(stack.layer(LayerKind::Ticket).is_none());
    }

    #[tokio::test]
    async fn test_upstream_failure_degrades_layer() {
        let forge = FakeForge {
            fail_files: true,
            ..Default::default()
        }
        .with_issue(2, "Bug", "");
        let (db, _, builder) = setup(forge);
        let thread = db.create_thread(&CreateThreadInput::default()).unwrap();
        db.add_thread_ref(&thread.id, &NewThreadRef::issue("acme/app", 2))
            .unwrap();

        let stack = builder.build_context_stack(&thread.id).await.unwrap();
        assert!(stack.layer(LayerKind::Repo).is_none());
        assert!(stack.layer(LayerKind::Ticket).is_some());
    }

    #[tokio::test]
    async fn test_lineage_and_execution_layers() {
        let (db, _, builder) = setup(FakeForge::default());
        let parent = db
            .create_thread(&CreateThreadInput {
                topic: Some("Auth overhaul".to_string()),
                kind: ThreadKind::Task,
                ..Default::default()
            })
            .unwrap();
        db.add_thread_ref(
            &parent.id,
            &NewThreadRef::pull_request("acme/app", 5).with_status("open"),
        )
        .unwrap();
        db.add_thread_event(
            &parent.id,
            &NewThreadEvent::text(Channel::System, Direction::Outbound, "threadd", "plan")
                .with_type(MessageType::ExecutionPlan)
                .with_metadata(serde_json::json!({
                    "steps": [
                        {"title": "Reproduce", "status": "done"},
                        {"title": "Patch", "status": "in_progress"},
                        {"title": "Open PR"}
                    ]
                })),
        )
        .unwrap();
        let child = db.fork_thread(&parent.id, &ForkOptions::default()).unwrap();

        let stack = builder.build_context_stack(&child.id).await.unwrap();
        let lineage = &stack.layer(LayerKind::Lineage).unwrap().content;
        assert!(lineage.contains("Topic: Auth overhaul"));
        assert!(lineage.contains("pull_request acme/app#5 (open)"));

        let execution = &stack.layer(LayerKind::Execution).unwrap().content;
        assert_eq!(execution, "1. ✅ Reproduce\n2. 🔄 Patch\n3. ⬜ Open PR");

        // The root has no parent, so no lineage layer
        let root = builder.build_context_stack(&parent.id).await.unwrap();
        assert!(root.layer(LayerKind::Lineage).is_none());
    }

    #[tokio::test]
    async fn test_cached_build_and_delta() {
        let forge = FakeForge::default().with_issue(3, "Bug", "body");
        let (db, forge, builder) = setup(forge);
        let thread = db.create_thread(&CreateThreadInput::default()).unwrap();
        db.add_thread_ref(&thread.id, &NewThreadRef::issue("acme/app", 3))
            .unwrap();

        let first = builder
            .build_context_stack_cached(&thread.id, Some("s1"))
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.injection, Injection::Full);
        let calls = forge.calls.load(Ordering::SeqCst);

        // Not delivered yet: the next build still injects everything
        let retry = builder
            .build_context_stack_cached(&thread.id, Some("s1"))
            .await
            .unwrap();
        assert_eq!(retry.injection, Injection::Full);
        builder.mark_injected("s1", &retry.stack);

        let second = builder
            .build_context_stack_cached(&thread.id, Some("s1"))
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.injection, Injection::Unchanged);
        assert_eq!(second.injected_text(), "");
        assert_eq!(forge.calls.load(Ordering::SeqCst), calls);

        // A parent link shows up: only the lineage layer is new
        let parent = db.create_thread(&CreateThreadInput {
            topic: Some("Parent".to_string()),
            ..Default::default()
        })
        .unwrap();
        db.add_thread_event(
            &parent.id,
            &NewThreadEvent::text(Channel::Web, Direction::Inbound, "alice", "hi"),
        )
        .unwrap();
        let child = db.fork_thread(&parent.id, &ForkOptions::default()).unwrap();
        db.add_thread_ref(&child.id, &NewThreadRef::issue("acme/app", 3))
            .unwrap();
        let stack = builder.build_context_stack(&child.id).await.unwrap();
        builder
            .cache()
            .record_injection("s2", &child.id, {
                let mut sums = stack.checksums();
                sums.remove("lineage");
                sums
            });

        let delta = builder
            .build_context_stack_cached(&child.id, Some("s2"))
            .await
            .unwrap();
        assert_eq!(delta.injection, Injection::Delta(vec!["lineage".to_string()]));
        assert!(delta.injected_text().contains("Topic: Parent"));
        assert!(!delta.injected_text().contains("Linked issues"));
    }

    #[tokio::test]
    async fn test_missing_thread() {
        let (_, _, builder) = setup(FakeForge::default());
        assert!(builder.build_context_stack("nope").await.is_err());
    }

    #[test]
    fn test_truncate_bytes_char_boundary() {
        let text = "héllo wörld";
        let cut = truncate_bytes(text, 2);
        assert!(cut.starts_with('h'));
        assert!(cut.ends_with(TRUNCATION_MARKER));
    }
}
