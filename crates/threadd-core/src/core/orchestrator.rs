//! Thread Orchestrator - main coordinator
//!
//! Owns the lock table, context cache, stack builder, compaction engine and
//! completion enforcer, and runs one inbound message through the whole chained
//! turn: agent call, continuations, enforced follow-ups, completion check and
//! compaction advisory. Messages arriving meanwhile are queued and drained by
//! the same holder before the lock is given up.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::agent::{AgentMessage, AgentRequest, AgentResponse, ReasoningAgent, StopReason};
use super::directives::{extract_forge_links, parse_issue_directive};
use super::lock::{ConversationLocks, LockGuard, QueuedMessage};
use crate::compaction::{
    CompactionAdvice, CompactionEngine, CompactionOutcome, ForkCompactOutcome, Summarizer,
};
use crate::config::{OrchestratorConfig, ThreaddConfig};
use crate::context::{
    stack_key, ContextCache, ContextStackBuilder, ForgeClient, WebhookEvent, WebhookEventType,
};
use crate::db::{ThreadDB, SYSTEM_ACTOR};
use crate::enforcer::{
    completion_check_directive, CompletionEnforcer, EnforcementAction, HeuristicIntentDetector,
    IntentDetector, WorkspaceProbe,
};
use crate::error::{CoreError, Result};
use crate::types::{
    Channel, CreateThreadInput, Direction, EventFilter, ForkOptions, MessageType, NewThreadEvent,
    NewThreadRef, RefType, TaskStep, Thread, ThreadKind, ThreadRef, ThreadStatus, TokenUsage,
};

/// Actor recorded on agent replies
pub const AGENT_ACTOR: &str = "agent";

const CONTINUE_PROMPT: &str =
    "[continuation] You stopped at your turn limit. Continue the task from where you left off.";

/// Collaborators the orchestrator is wired with
pub struct OrchestratorDeps {
    pub db: Arc<ThreadDB>,
    pub agent: Arc<dyn ReasoningAgent>,
    pub forge: Arc<dyn ForgeClient>,
    pub probe: Arc<dyn WorkspaceProbe>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    /// Defaults to the regex heuristic
    pub detector: Option<Arc<dyn IntentDetector>>,
}

/// One message from a channel
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Thread id or legacy conversation id. Unknown ids become the legacy id of a new thread.
    pub thread_id: Option<String>,
    pub text: String,
    pub channel: Channel,
    pub actor: String,
    /// Kind for a newly created thread
    pub kind: ThreadKind,
}

impl InboundMessage {
    pub fn new(thread_id: Option<&str>, channel: Channel, actor: &str, text: &str) -> Self {
        Self {
            thread_id: thread_id.map(str::to_string),
            text: text.to_string(),
            channel,
            actor: actor.to_string(),
            kind: ThreadKind::Chat,
        }
    }
}

/// Summary of a completed chained turn
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReport {
    pub thread_id: String,
    /// Text of the last agent reply
    pub response: String,
    pub session_id: Option<String>,
    pub usage: TokenUsage,
    pub agent_calls: usize,
    pub continuations: usize,
    pub enforced: Vec<EnforcementAction>,
    pub completion_checked: bool,
    pub linked_refs: Vec<ThreadRef>,
    pub compaction: Option<CompactionAdvice>,
    pub compacted: Option<CompactionOutcome>,
    /// Queued messages processed after this turn
    pub drained: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum TurnOutcome {
    Completed(TurnReport),
    Queued { thread_id: String, position: usize },
    Stopped { thread_id: String },
}

/// Thread Orchestrator
pub struct ThreadOrchestrator {
    db: Arc<ThreadDB>,
    locks: ConversationLocks,
    cache: Arc<ContextCache>,
    builder: ContextStackBuilder,
    compaction: CompactionEngine,
    enforcer: CompletionEnforcer,
    detector: Arc<dyn IntentDetector>,
    agent: Arc<dyn ReasoningAgent>,
    config: OrchestratorConfig,
}

impl ThreadOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: &ThreaddConfig) -> Self {
        let cache = Arc::new(ContextCache::new(config.cache.clone()));
        let builder = ContextStackBuilder::new(
            Arc::clone(&deps.db),
            Arc::clone(&cache),
            deps.forge,
            config.budgets.clone(),
        );
        let compaction = CompactionEngine::new(Arc::clone(&deps.db), deps.summarizer);
        let enforcer = CompletionEnforcer::new(Arc::clone(&deps.db), deps.probe);
        let detector = deps
            .detector
            .unwrap_or_else(|| Arc::new(HeuristicIntentDetector));

        info!(
            holder = %config.orchestrator.holder,
            auto_compact = config.orchestrator.auto_compact,
            "ThreadOrchestrator initialized"
        );
        Self {
            db: deps.db,
            locks: ConversationLocks::new(),
            cache,
            builder,
            compaction,
            enforcer,
            detector,
            agent: deps.agent,
            config: config.orchestrator.clone(),
        }
    }

    pub fn db(&self) -> &Arc<ThreadDB> {
        &self.db
    }

    pub fn locks(&self) -> &ConversationLocks {
        &self.locks
    }

    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.cache
    }

    pub fn builder(&self) -> &ContextStackBuilder {
        &self.builder
    }

    pub fn enforcer(&self) -> &CompletionEnforcer {
        &self.enforcer
    }

    // ============ Inbound ============

    /// Run one inbound message through the full chained turn.
    ///
    /// If the thread is busy the message is queued and `Queued` is returned
    /// immediately; the current holder processes it before releasing.
    pub async fn handle_message(
        &self,
        msg: InboundMessage,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let thread = self.resolve_thread(&msg)?;

        let mut guard = match self.locks.try_acquire_or_enqueue(
            &thread.id,
            &self.config.holder,
            &msg.text,
            msg.channel,
            &msg.actor,
        ) {
            Ok(guard) => guard,
            Err(position) => {
                info!(thread_id = %thread.id, position, channel = msg.channel.as_str(), "Thread busy, message queued");
                return Ok(TurnOutcome::Queued {
                    thread_id: thread.id,
                    position,
                });
            }
        };

        // A stopped turn can leave older messages queued behind a free lock.
        // They run first, with this one appended after them.
        let backlog = self.locks.queue_len(&thread.id);
        if backlog > 0 {
            self.locks
                .enqueue_message(&thread.id, &msg.text, msg.channel, &msg.actor);
            info!(thread_id = %thread.id, backlog, "Draining backlog ahead of new message");
            let (drained, idle) = self.drain_queued(&mut guard, &thread.id, &cancel).await;
            guard.release();
            if !idle {
                return Ok(TurnOutcome::Stopped {
                    thread_id: thread.id,
                });
            }
            return Ok(TurnOutcome::Completed(TurnReport {
                thread_id: thread.id,
                drained,
                ..Default::default()
            }));
        }

        let result = self
            .process(&thread.id, &msg.text, msg.channel, &msg.actor, &cancel)
            .await;

        match result {
            Ok(mut report) => {
                report.drained = self.drain_queued(&mut guard, &thread.id, &cancel).await.0;
                guard.release();
                Ok(TurnOutcome::Completed(report))
            }
            Err(CoreError::Aborted) => {
                guard.release();
                let pending = self.locks.queue_len(&thread.id);
                if pending > 0 {
                    info!(thread_id = %thread.id, pending, "Turn stopped, queued messages left for the next turn");
                }
                Ok(TurnOutcome::Stopped {
                    thread_id: thread.id,
                })
            }
            Err(e) => {
                self.drain_queued(&mut guard, &thread.id, &cancel).await;
                guard.release();
                Err(e)
            }
        }
    }

    fn resolve_thread(&self, msg: &InboundMessage) -> Result<Thread> {
        let thread = match &msg.thread_id {
            Some(id) => match self.db.find_thread(id)? {
                Some(thread) => thread,
                None => self.db.create_thread(&CreateThreadInput {
                    topic: None,
                    kind: msg.kind,
                    legacy_id: Some(id.clone()),
                })?,
            },
            None => self.db.create_thread(&CreateThreadInput {
                topic: None,
                kind: msg.kind,
                legacy_id: None,
            })?,
        };

        if thread.status != ThreadStatus::Active {
            info!(thread_id = %thread.id, from = thread.status.as_str(), "Reopening thread on new message");
            return self.db.update_thread_status(&thread.id, ThreadStatus::Active);
        }
        Ok(thread)
    }

    /// Process queued messages until the queue stays empty, then release.
    ///
    /// Returns the number processed and whether the lock was released idle;
    /// `false` means a cancellation stopped the drain with messages left queued.
    async fn drain_queued(
        &self,
        guard: &mut LockGuard,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> (usize, bool) {
        let mut drained = 0;
        loop {
            if cancel.is_cancelled() {
                return (drained, false);
            }
            let mut batch: Vec<QueuedMessage> = self.locks.drain_queue(thread_id);
            if batch.is_empty() {
                if guard.release_if_idle() {
                    return (drained, true);
                }
                continue;
            }

            debug!(thread_id = %thread_id, count = batch.len(), "Draining queued messages");
            while !batch.is_empty() {
                let queued = batch.remove(0);
                let result = self
                    .process(thread_id, &queued.text, queued.channel, &queued.actor, cancel)
                    .await;
                match result {
                    Ok(_) => drained += 1,
                    Err(CoreError::Aborted) => {
                        self.locks.requeue_front(thread_id, batch);
                        return (drained, false);
                    }
                    Err(e) => {
                        error!(thread_id = %thread_id, error = %e, "Queued message failed");
                        drained += 1;
                    }
                }
            }
        }
    }

    /// One message's chained turn, with stopped/error events recorded
    async fn process(
        &self,
        thread_id: &str,
        text: &str,
        channel: Channel,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnReport> {
        match self.run_turn(thread_id, text, channel, actor, cancel).await {
            Ok(report) => Ok(report),
            Err(CoreError::Aborted) => {
                info!(thread_id = %thread_id, "Turn cancelled");
                let event = NewThreadEvent::text(
                    channel,
                    Direction::Outbound,
                    SYSTEM_ACTOR,
                    "Stopped by request.",
                )
                .with_type(MessageType::Stopped);
                if let Err(e) = self.db.add_thread_event(thread_id, &event) {
                    warn!(thread_id = %thread_id, error = %e, "Failed to record stopped event");
                }
                Err(CoreError::Aborted)
            }
            Err(e) => {
                error!(thread_id = %thread_id, error = %e, "Turn failed");
                let event = NewThreadEvent::text(
                    channel,
                    Direction::Outbound,
                    SYSTEM_ACTOR,
                    &format!("Turn failed: {}", e),
                )
                .with_type(MessageType::Error);
                if let Err(persist) = self.db.add_thread_event(thread_id, &event) {
                    warn!(thread_id = %thread_id, error = %persist, "Failed to record error event");
                }
                Err(e)
            }
        }
    }

    async fn run_turn(
        &self,
        thread_id: &str,
        text: &str,
        channel: Channel,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnReport> {
        let inbound = self.db.add_thread_event(
            thread_id,
            &NewThreadEvent::text(channel, Direction::Inbound, actor, text),
        )?;
        self.ensure_topic(thread_id, text);

        let mut report = TurnReport {
            thread_id: thread_id.to_string(),
            ..Default::default()
        };

        if let Some(directive) = parse_issue_directive(text) {
            self.open_issue_task(thread_id, &directive.repo, directive.number)
                .await?;
        }

        let mut response = self
            .call_agent(thread_id, text, inbound.id, channel, cancel, &mut report)
            .await?;

        while response.stop_reason == StopReason::MaxTurns
            && report.continuations < self.config.max_continuations
        {
            report.continuations += 1;
            info!(thread_id = %thread_id, round = report.continuations, "Agent hit turn limit, continuing");
            response = self
                .directive_turn(thread_id, CONTINUE_PROMPT, channel, cancel, &mut report)
                .await?;
        }

        for round in 0..self.config.max_enforcement_rounds {
            let actions = self.enforcer.check_thread(thread_id).await?;
            if actions.is_empty() {
                break;
            }
            debug!(thread_id = %thread_id, round, actions = actions.len(), "Enforcement round");
            for action in actions {
                response = self
                    .directive_turn(thread_id, &action.directive(), channel, cancel, &mut report)
                    .await?;
                if let Err(e) =
                    self.enforcer
                        .mark_step(&action.task_id, action.step, action.branch.clone())
                {
                    warn!(task_id = %action.task_id, step = action.step.as_str(), error = %e, "Failed to record step");
                }
                report.enforced.push(action);
            }
        }

        if self.config.completion_check && report.enforced.is_empty() {
            let signals = self.detector.detect(&response.text());
            if !signals.is_empty() {
                info!(thread_id = %thread_id, ?signals, "Reply lacks follow-through, forcing completion check");
                report.completion_checked = true;
                response = self
                    .directive_turn(
                        thread_id,
                        &completion_check_directive(&signals),
                        channel,
                        cancel,
                        &mut report,
                    )
                    .await?;
            }
        }

        report.response = response.text();
        report.session_id = self.db.get_thread(thread_id)?.session_id;

        let advice = self
            .compaction
            .should_compact(thread_id, self.config.compact_threshold)?;
        if advice.should_compact {
            info!(
                thread_id = %thread_id,
                events = advice.event_count,
                threshold = advice.threshold,
                "Thread over compaction threshold"
            );
            if self.config.auto_compact {
                match self.compact_locked(thread_id, self.config.keep_recent).await {
                    Ok(outcome) => report.compacted = Some(outcome),
                    Err(e) => warn!(thread_id = %thread_id, error = %e, "Auto-compaction failed"),
                }
            }
        }
        report.compaction = Some(advice);

        Ok(report)
    }

    /// Persist a directive as an inbound system event and run it through the agent
    async fn directive_turn(
        &self,
        thread_id: &str,
        directive: &str,
        reply_channel: Channel,
        cancel: &CancellationToken,
        report: &mut TurnReport,
    ) -> Result<AgentResponse> {
        let event = self.db.add_thread_event(
            thread_id,
            &NewThreadEvent::text(Channel::System, Direction::Inbound, SYSTEM_ACTOR, directive)
                .with_type(MessageType::Directive),
        )?;
        self.call_agent(thread_id, directive, event.id, reply_channel, cancel, report)
            .await
    }

    /// Build the request (fresh or resumed), invoke the agent and record the reply
    async fn call_agent(
        &self,
        thread_id: &str,
        prompt: &str,
        prompt_event_id: i64,
        reply_channel: Channel,
        cancel: &CancellationToken,
        report: &mut TurnReport,
    ) -> Result<AgentResponse> {
        if cancel.is_cancelled() {
            return Err(CoreError::Aborted);
        }
        let thread = self.db.get_thread(thread_id)?;

        let (request, injected_stack) = match &thread.session_id {
            Some(session) => {
                let build = self
                    .builder
                    .build_context_stack_cached(&thread.id, Some(session.as_str()))
                    .await?;
                let context = build.injected_text();
                debug!(thread_id = %thread.id, injection = ?build.injection, "Resuming agent session");
                let delivered = (!context.is_empty()).then_some(build.stack);
                let request = AgentRequest {
                    thread_id: thread.id.clone(),
                    session_id: Some(session.clone()),
                    context: (!context.is_empty()).then_some(context),
                    history: Vec::new(),
                    prompt: prompt.to_string(),
                };
                (request, delivered)
            }
            None => {
                let build = self
                    .builder
                    .build_context_stack_cached(&thread.id, None)
                    .await?;
                let context = build.injected_text();
                let request = AgentRequest {
                    thread_id: thread.id.clone(),
                    session_id: None,
                    context: (!context.is_empty()).then_some(context),
                    history: self.history_before(&thread.id, prompt_event_id)?,
                    prompt: prompt.to_string(),
                };
                (request, Some(build.stack))
            }
        };

        let response = self
            .agent
            .run(request, cancel.clone())
            .await
            .map_err(CoreError::from)?;
        report.agent_calls += 1;
        report.usage.add(&response.usage);

        let metadata = serde_json::json!({
            "stopReason": response.stop_reason.as_str(),
            "toolCalls": response.tool_call_count(),
            "model": response.model,
            "sessionId": response.session_id,
            "replyTo": prompt_event_id,
        });
        self.db.add_thread_event(
            &thread.id,
            &NewThreadEvent {
                channel: reply_channel,
                direction: Direction::Outbound,
                actor: AGENT_ACTOR.to_string(),
                content: response.content.clone(),
                message_type: MessageType::Text,
                usage: Some(response.usage),
                metadata,
                created_at: None,
            },
        )?;

        if let Some(session) = &response.session_id {
            if thread.session_id.as_deref() != Some(session.as_str()) {
                self.db.set_thread_session(&thread.id, Some(session.as_str()))?;
            }
            // Baseline only moves once the agent has actually seen the context
            if let Some(stack) = &injected_stack {
                self.builder.mark_injected(session, stack);
            }
        }

        let linked = self.auto_link(&thread.id, &response);
        report.linked_refs.extend(linked);

        info!(
            thread_id = %thread.id,
            stop_reason = response.stop_reason.as_str(),
            tool_calls = response.tool_call_count(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Agent turn recorded"
        );
        Ok(response)
    }

    /// Live events before `event_id`, newest `history_limit` of them
    fn history_before(&self, thread_id: &str, event_id: i64) -> Result<Vec<AgentMessage>> {
        let events = self
            .db
            .get_thread_events(thread_id, &EventFilter::default())?;
        let prior: Vec<AgentMessage> = events
            .into_iter()
            .filter(|e| e.id != event_id)
            .filter(|e| !matches!(e.message_type, MessageType::Stopped | MessageType::Error))
            .map(|e| AgentMessage {
                direction: e.direction,
                actor: e.actor.clone(),
                text: e.text(),
            })
            .filter(|m| !m.text.trim().is_empty())
            .collect();
        let skip = prior.len().saturating_sub(self.config.history_limit);
        Ok(prior.into_iter().skip(skip).collect())
    }

    /// Link issue / PR URLs found in tool results. A new PR also records the
    /// PR step for open tasks of the same repo.
    fn auto_link(&self, thread_id: &str, response: &AgentResponse) -> Vec<ThreadRef> {
        let mut linked = Vec::new();
        for output in response.tool_results() {
            for link in extract_forge_links(output) {
                let new_ref = NewThreadRef {
                    ref_type: link.ref_type,
                    repo: link.repo.clone(),
                    number: Some(link.number),
                    ref_name: None,
                    url: Some(link.url.clone()),
                    status: Some("open".to_string()),
                };
                match self.db.add_thread_ref(thread_id, &new_ref) {
                    Ok(r) => {
                        info!(thread_id = %thread_id, ref_type = r.ref_type.as_str(), repo = %r.repo, number = link.number, "Auto-linked ref");
                        linked.push(r);
                    }
                    Err(e) => {
                        warn!(thread_id = %thread_id, url = %link.url, error = %e, "Auto-link failed");
                        continue;
                    }
                }

                if link.ref_type == RefType::PullRequest {
                    self.record_pr_for_tasks(thread_id, &link.repo);
                }
            }
        }
        if !linked.is_empty() {
            self.cache.invalidate_key(&stack_key(thread_id));
        }
        linked
    }

    fn record_pr_for_tasks(&self, thread_id: &str, repo: &str) {
        let tasks = match self.db.list_open_tasks(thread_id) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Failed to list open tasks");
                return;
            }
        };
        for task in tasks.iter().filter(|t| t.repo == repo && !t.pr_created) {
            if let Err(e) = self.enforcer.mark_step(&task.id, TaskStep::PrCreated, None) {
                warn!(task_id = %task.id, error = %e, "Failed to record PR step");
            }
        }
    }

    async fn open_issue_task(&self, thread_id: &str, repo: &str, number: i64) -> Result<()> {
        self.db
            .add_thread_ref(thread_id, &NewThreadRef::issue(repo, number))?;
        let workspace: Option<PathBuf> = self.config.workspace_for(repo);
        self.enforcer
            .open_task(thread_id, repo, number, workspace.as_deref())
            .await?;
        if let Err(e) = self.db.update_thread_kind(thread_id, ThreadKind::Task) {
            warn!(thread_id = %thread_id, error = %e, "Failed to mark thread as task");
        }
        self.cache.invalidate_key(&stack_key(thread_id));
        Ok(())
    }

    /// First line of the first message becomes the topic. Best effort.
    fn ensure_topic(&self, thread_id: &str, text: &str) {
        let thread = match self.db.get_thread(thread_id) {
            Ok(t) => t,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Topic lookup failed");
                return;
            }
        };
        if thread.topic.is_some() {
            return;
        }
        let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
        if first_line.is_empty() {
            return;
        }
        let topic: String = first_line.chars().take(80).collect();
        if let Err(e) = self.db.update_thread_topic(thread_id, &topic) {
            warn!(thread_id = %thread_id, error = %e, "Failed to set topic");
        }
    }

    // ============ Maintenance ============

    /// Compact in place, waiting for any running turn first
    pub async fn compact(&self, thread_id: &str, keep_recent: usize) -> Result<CompactionOutcome> {
        let thread = self.db.get_thread(thread_id)?;
        let guard = self
            .locks
            .acquire(&thread.id, "compaction", self.config.lock_timeout())
            .await?;
        let result = self.compact_locked(&thread.id, keep_recent).await;
        self.release_after_maintenance(guard, &thread.id).await;
        result
    }

    async fn compact_locked(&self, thread_id: &str, keep_recent: usize) -> Result<CompactionOutcome> {
        let outcome = self.compaction.compact_thread(thread_id, keep_recent).await?;
        // The agent session still holds the full history; start fresh from the summary
        self.db.set_thread_session(thread_id, None)?;
        self.cache.invalidate_key(&stack_key(thread_id));
        Ok(outcome)
    }

    pub async fn fork_compact(&self, thread_id: &str) -> Result<ForkCompactOutcome> {
        let thread = self.db.get_thread(thread_id)?;
        let guard = self
            .locks
            .acquire(&thread.id, "fork-compaction", self.config.lock_timeout())
            .await?;
        let result = self.compaction.fork_compact(&thread.id).await;
        if let Ok(outcome) = &result {
            self.seed_child_stack(&thread.id, &outcome.thread.id);
        }
        self.release_after_maintenance(guard, &thread.id).await;
        result
    }

    /// Fork a thread and derive the child's context from the parent's cached stack
    pub async fn fork(&self, thread_id: &str, options: &ForkOptions) -> Result<Thread> {
        let thread = self.db.get_thread(thread_id)?;
        let guard = self
            .locks
            .acquire(&thread.id, "fork", self.config.lock_timeout())
            .await?;
        let result = self.db.fork_thread(&thread.id, options);
        if let Ok(child) = &result {
            self.seed_child_stack(&thread.id, &child.id);
        }
        self.release_after_maintenance(guard, &thread.id).await;
        result
    }

    /// Messages queued while maintenance held the lock are owed a turn
    async fn release_after_maintenance(&self, mut guard: LockGuard, thread_id: &str) {
        let (drained, _) = self
            .drain_queued(&mut guard, thread_id, &CancellationToken::new())
            .await;
        if drained > 0 {
            info!(thread_id = %thread_id, drained, "Processed messages queued during maintenance");
        }
        guard.release();
    }

    fn seed_child_stack(&self, parent_id: &str, child_id: &str) {
        let overrides = match self.builder.lineage_layer_for(child_id) {
            Ok(layer) => layer.into_iter().collect(),
            Err(e) => {
                warn!(child = %child_id, error = %e, "Lineage layer build failed");
                return;
            }
        };
        match self.cache.fork_context_stack(parent_id, child_id, overrides) {
            Ok(Some(stack)) => {
                debug!(child = %child_id, tokens = stack.total_tokens, "Child context seeded from parent")
            }
            Ok(None) => {}
            Err(e) => warn!(child = %child_id, error = %e, "Failed to seed child context"),
        }
    }

    pub fn should_compact(&self, thread_id: &str) -> Result<CompactionAdvice> {
        self.compaction
            .should_compact(thread_id, self.config.compact_threshold)
    }

    /// Invalidate cached context and refresh linked ref status for a forge event
    pub fn apply_webhook(&self, event: &WebhookEvent) -> Result<usize> {
        let removed = self.cache.apply_webhook(event);
        let status_update = match (event.event_type, event.number) {
            (WebhookEventType::PrMerge, Some(n)) => Some((RefType::PullRequest, n, "merged")),
            (WebhookEventType::PrClose, Some(n)) => Some((RefType::PullRequest, n, "closed")),
            (WebhookEventType::IssueClose, Some(n)) => Some((RefType::Issue, n, "closed")),
            _ => None,
        };
        if let Some((ref_type, number, status)) = status_update {
            let updated = self
                .db
                .update_thread_ref_status(ref_type, &event.repo, number, status)?;
            debug!(repo = %event.repo, number, status, updated, "Ref status refreshed from webhook");
        }
        Ok(removed)
    }

    /// Stop a thread: no more turns until it is reopened
    pub fn stop_thread(&self, thread_id: &str) -> Result<Thread> {
        let thread = self.db.update_thread_status(thread_id, ThreadStatus::Stopped)?;
        self.db.set_thread_session(&thread.id, None)?;
        Ok(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ForgeIssue;
    use crate::core::agent::AgentError;
    use crate::enforcer::tests::FakeProbe;
    use crate::types::ContentBlock;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct NoForge;

    #[async_trait]
    impl ForgeClient for NoForge {
        async fn fetch_file(&self, _repo: &str, _path: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn fetch_issue(&self, repo: &str, number: i64) -> Result<ForgeIssue> {
            Ok(ForgeIssue {
                number,
                title: format!("{} issue", repo),
                body: String::new(),
                state: "open".to_string(),
                labels: vec![],
            })
        }
    }

    /// Scripted agent: pops queued replies, defaults to a plain answer
    #[derive(Default)]
    struct ScriptedAgent {
        replies: Mutex<VecDeque<std::result::Result<AgentResponse, AgentError>>>,
        requests: Mutex<Vec<AgentRequest>>,
        gate: Option<Arc<Notify>>,
        /// Runs once, during the first call
        on_first_call: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl ScriptedAgent {
        fn push(&self, reply: AgentResponse) {
            self.replies.lock().unwrap().push_back(Ok(reply));
        }

        fn push_err(&self, err: AgentError) {
            self.replies.lock().unwrap().push_back(Err(err));
        }

        fn requests(&self) -> Vec<AgentRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn reply(text: &str) -> AgentResponse {
        AgentResponse {
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            session_id: Some("sess-1".to_string()),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
                ..Default::default()
            },
            stop_reason: StopReason::EndTurn,
            model: Some("test-model".to_string()),
        }
    }

    #[async_trait]
    impl ReasoningAgent for ScriptedAgent {
        async fn run(
            &self,
            request: AgentRequest,
            _cancel: CancellationToken,
        ) -> std::result::Result<AgentResponse, AgentError> {
            self.requests.lock().unwrap().push(request);
            let hook = self.on_first_call.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self.replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(reply("Here is the answer.")))
        }
    }

    struct Harness {
        orchestrator: Arc<ThreadOrchestrator>,
        agent: Arc<ScriptedAgent>,
        probe: Arc<FakeProbe>,
    }

    fn harness_with(agent: ScriptedAgent, tweak: impl FnOnce(&mut ThreaddConfig)) -> Harness {
        let db = Arc::new(ThreadDB::in_memory().unwrap());
        let agent = Arc::new(agent);
        let probe = Arc::new(FakeProbe::default());
        probe.set("aaa", 0, "main", false);
        let mut config = ThreaddConfig::default();
        config.orchestrator.workspace_root = Some(PathBuf::from("/work"));
        tweak(&mut config);
        let orchestrator = ThreadOrchestrator::new(
            OrchestratorDeps {
                db,
                agent: agent.clone(),
                forge: Arc::new(NoForge),
                probe: probe.clone(),
                summarizer: None,
                detector: None,
            },
            &config,
        );
        Harness {
            orchestrator: Arc::new(orchestrator),
            agent,
            probe,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedAgent::default(), |_| {})
    }

    fn completed(outcome: TurnOutcome) -> TurnReport {
        match outcome {
            TurnOutcome::Completed(report) => report,
            other => panic!("expected completed turn, got {:?}", other),
        }
    }

    async fn send(h: &Harness, thread: Option<&str>, text: &str) -> TurnReport {
        completed(
            h.orchestrator
                .handle_message(
                    InboundMessage::new(thread, Channel::Web, "alice", text),
                    CancellationToken::new(),
                )
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_first_message_creates_thread_and_session() {
        let h = harness();
        let report = send(&h, None, "Why does login fail?\nMore detail here").await;

        assert_eq!(report.agent_calls, 1);
        assert_eq!(report.response, "Here is the answer.");
        assert_eq!(report.session_id.as_deref(), Some("sess-1"));
        assert_eq!(report.usage.input_tokens, 100);

        let db = h.orchestrator.db();
        let thread = db.get_thread(&report.thread_id).unwrap();
        assert_eq!(thread.topic.as_deref(), Some("Why does login fail?"));
        let events = db
            .get_thread_events(&thread.id, &EventFilter::default())
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].direction, Direction::Inbound);
        assert_eq!(events[1].actor, AGENT_ACTOR);
        assert_eq!(events[1].metadata["stopReason"], "end_turn");
        assert!(!h.orchestrator.locks().is_locked(&thread.id));
    }

    #[tokio::test]
    async fn test_resumed_turn_sends_no_history() {
        let h = harness();
        let first = send(&h, Some("conv-9"), "hello").await;
        let second = send(&h, Some("conv-9"), "and again").await;
        assert_eq!(first.thread_id, second.thread_id);

        let requests = h.agent.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].session_id.is_none());
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[1].session_id.as_deref(), Some("sess-1"));
        assert!(requests[1].history.is_empty());
        assert_eq!(requests[1].prompt, "and again");
    }

    #[tokio::test]
    async fn test_fresh_session_replays_history() {
        let h = harness();
        let first = send(&h, None, "hello").await;
        h.orchestrator
            .db()
            .set_thread_session(&first.thread_id, None)
            .unwrap();
        send(&h, Some(first.thread_id.as_str()), "again").await;

        let last = h.agent.requests().pop().unwrap();
        assert!(last.session_id.is_none());
        let texts: Vec<&str> = last.history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "Here is the answer."]);
    }

    #[tokio::test]
    async fn test_max_turns_continuation() {
        let agent = ScriptedAgent::default();
        let mut partial = reply("halfway");
        partial.stop_reason = StopReason::MaxTurns;
        agent.push(partial);
        agent.push(reply("finished it all, done"));
        let h = harness_with(agent, |_| {});

        let report = send(&h, None, "big job").await;
        assert_eq!(report.continuations, 1);
        assert_eq!(report.agent_calls, 2);
        assert_eq!(report.response, "finished it all, done");
        assert_eq!(report.usage.output_tokens, 40);

        let directives = h
            .orchestrator
            .db()
            .get_thread_events(
                &report.thread_id,
                &EventFilter {
                    message_type: Some(MessageType::Directive),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(directives.len(), 1);
    }

    #[tokio::test]
    async fn test_issue_directive_opens_task_and_enforces() {
        let probe_slot: Arc<Mutex<Option<Arc<FakeProbe>>>> = Arc::new(Mutex::new(None));
        let slot = probe_slot.clone();
        let agent = ScriptedAgent {
            // The agent edits files during its turn
            on_first_call: Mutex::new(Some(Box::new(move || {
                if let Some(probe) = slot.lock().unwrap().as_ref() {
                    probe.set("bbb", 2, "main", false);
                }
            }) as Box<dyn FnOnce() + Send>)),
            ..Default::default()
        };
        let h = harness_with(agent, |_| {});
        *probe_slot.lock().unwrap() = Some(h.probe.clone());

        let report = send(&h, None, "/issue acme/app#7").await;

        let db = h.orchestrator.db();
        let tasks = db.list_tasks(&report.thread_id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].baseline.head_commit.as_deref(), Some("aaa"));
        assert_eq!(
            tasks[0].workspace_path.as_deref(),
            Some("/work/acme/app")
        );
        assert!(tasks[0].has_code_changes);
        assert_eq!(db.get_thread(&report.thread_id).unwrap().kind, ThreadKind::Task);
        assert_eq!(db.get_thread_refs(&report.thread_id).unwrap()[0].number, Some(7));

        assert_eq!(report.enforced.len(), 1);
        assert_eq!(report.enforced[0].step, TaskStep::CodeChanged);
        assert_eq!(report.agent_calls, 2);
        assert!(!report.completion_checked);
        let last = h.agent.requests().pop().unwrap();
        assert!(last.prompt.starts_with("[enforcer: code_changed]"));
    }

    #[tokio::test]
    async fn test_pr_link_in_tool_result_advances_task() {
        let h = harness();
        let thread = h
            .orchestrator
            .db()
            .create_thread(&CreateThreadInput::default())
            .unwrap();
        let enforcer = h.orchestrator.enforcer();
        let task = enforcer
            .open_task(&thread.id, "acme/app", 7, None)
            .await
            .unwrap();

        let mut with_pr = reply("Opened https://github.com/acme/app/pull/31");
        with_pr.content.push(ContentBlock::ToolResult {
            tool_call_id: "t1".to_string(),
            content: "https://github.com/acme/app/pull/31".to_string(),
            is_error: None,
        });
        h.agent.push(with_pr);

        let report = send(&h, Some(thread.id.as_str()), "ship it").await;
        assert_eq!(report.linked_refs.len(), 1);
        assert_eq!(report.linked_refs[0].ref_type, RefType::PullRequest);

        // PR recorded, so the enforcer demanded the notification and completed the task
        let task = h.orchestrator.db().get_task_context(&task.id).unwrap();
        assert!(task.pr_created);
        assert!(task.notified);
        assert!(task.completed_at.is_some());
        assert_eq!(report.enforced[0].step, TaskStep::Notified);
    }

    #[tokio::test]
    async fn test_completion_check_turn() {
        let agent = ScriptedAgent::default();
        agent.push(reply("I'll update the config next."));
        agent.push(reply("No code changes needed after all."));
        let h = harness_with(agent, |_| {});

        let report = send(&h, None, "fix config").await;
        assert!(report.completion_checked);
        assert_eq!(report.agent_calls, 2);
        let last = h.agent.requests().pop().unwrap();
        assert!(last.prompt.starts_with("[completion check: stated_intent]"));
    }

    #[tokio::test]
    async fn test_completion_check_disabled() {
        let agent = ScriptedAgent::default();
        agent.push(reply("I'll update the config next."));
        let h = harness_with(agent, |c| c.orchestrator.completion_check = false);
        let report = send(&h, None, "fix config").await;
        assert!(!report.completion_checked);
        assert_eq!(report.agent_calls, 1);
    }

    #[tokio::test]
    async fn test_cancellation_records_stopped() {
        let agent = ScriptedAgent::default();
        agent.push_err(AgentError::Cancelled);
        let h = harness_with(agent, |_| {});

        let outcome = h
            .orchestrator
            .handle_message(
                InboundMessage::new(Some("conv-1"), Channel::Bot, "bob", "long task"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let TurnOutcome::Stopped { thread_id } = outcome else {
            panic!("expected stopped");
        };
        let events = h
            .orchestrator
            .db()
            .get_thread_events(&thread_id, &EventFilter::default())
            .unwrap();
        assert_eq!(events.last().unwrap().message_type, MessageType::Stopped);
        assert!(!h.orchestrator.locks().is_locked(&thread_id));
    }

    #[tokio::test]
    async fn test_agent_failure_records_error_and_releases() {
        let agent = ScriptedAgent::default();
        agent.push_err(AgentError::Failed("process exited".to_string()));
        let h = harness_with(agent, |_| {});

        let err = h
            .orchestrator
            .handle_message(
                InboundMessage::new(Some("conv-2"), Channel::Web, "alice", "hi"),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Agent(_)));

        let thread = h.orchestrator.db().get_thread("conv-2").unwrap();
        let last = h
            .orchestrator
            .db()
            .latest_event(&thread.id, None)
            .unwrap()
            .unwrap();
        assert_eq!(last.message_type, MessageType::Error);
        assert!(!h.orchestrator.locks().is_locked(&thread.id));
    }

    #[tokio::test]
    async fn test_busy_thread_queues_and_drains() {
        let gate = Arc::new(Notify::new());
        let agent = ScriptedAgent {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let h = harness_with(agent, |c| c.orchestrator.completion_check = false);
        let thread = h
            .orchestrator
            .db()
            .create_thread(&CreateThreadInput::default())
            .unwrap();

        let first = {
            let orchestrator = h.orchestrator.clone();
            let id = thread.id.clone();
            tokio::spawn(async move {
                orchestrator
                    .handle_message(
                        InboundMessage::new(Some(id.as_str()), Channel::Web, "alice", "first"),
                        CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let queued = h
            .orchestrator
            .handle_message(
                InboundMessage::new(Some(thread.id.as_str()), Channel::Bot, "bob", "second"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(queued, TurnOutcome::Queued { position: 1, .. }));

        // Let both agent calls through
        gate.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.notify_one();

        let report = completed(first.await.unwrap().unwrap());
        assert_eq!(report.drained, 1);
        assert_eq!(h.orchestrator.locks().queue_len(&thread.id), 0);
        assert!(!h.orchestrator.locks().is_locked(&thread.id));

        let inbound: Vec<String> = h
            .orchestrator
            .db()
            .get_thread_events(
                &thread.id,
                &EventFilter {
                    direction: Some(Direction::Inbound),
                    ..Default::default()
                },
            )
            .unwrap()
            .iter()
            .map(|e| e.text())
            .collect();
        assert_eq!(inbound, vec!["first", "second"]);
    }

    fn inbound_texts(h: &Harness, thread_id: &str) -> Vec<String> {
        h.orchestrator
            .db()
            .get_thread_events(
                thread_id,
                &EventFilter {
                    direction: Some(Direction::Inbound),
                    ..Default::default()
                },
            )
            .unwrap()
            .iter()
            .map(|e| e.text())
            .collect()
    }

    #[tokio::test]
    async fn test_backlog_after_stop_runs_before_new_message() {
        let gate = Arc::new(Notify::new());
        let agent = ScriptedAgent {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        agent.push_err(AgentError::Cancelled);
        let h = harness_with(agent, |c| c.orchestrator.completion_check = false);
        let thread = h
            .orchestrator
            .db()
            .create_thread(&CreateThreadInput::default())
            .unwrap();

        let first = {
            let orchestrator = h.orchestrator.clone();
            let id = thread.id.clone();
            tokio::spawn(async move {
                orchestrator
                    .handle_message(
                        InboundMessage::new(Some(id.as_str()), Channel::Web, "alice", "first"),
                        CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let queued = h
            .orchestrator
            .handle_message(
                InboundMessage::new(Some(thread.id.as_str()), Channel::Bot, "bob", "second"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(queued, TurnOutcome::Queued { position: 1, .. }));

        gate.notify_one();
        assert!(matches!(
            first.await.unwrap().unwrap(),
            TurnOutcome::Stopped { .. }
        ));
        assert!(!h.orchestrator.locks().is_locked(&thread.id));
        assert_eq!(h.orchestrator.locks().queue_len(&thread.id), 1);

        let third = {
            let orchestrator = h.orchestrator.clone();
            let id = thread.id.clone();
            tokio::spawn(async move {
                orchestrator
                    .handle_message(
                        InboundMessage::new(Some(id.as_str()), Channel::Web, "alice", "third"),
                        CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.notify_one();

        let report = completed(third.await.unwrap().unwrap());
        assert_eq!(report.drained, 2);
        assert_eq!(h.orchestrator.locks().queue_len(&thread.id), 0);
        assert!(!h.orchestrator.locks().is_locked(&thread.id));
        assert_eq!(inbound_texts(&h, &thread.id), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_message_queued_during_compaction_is_answered() {
        let h = harness_with(ScriptedAgent::default(), |c| {
            c.orchestrator.completion_check = false;
        });
        let first = send(&h, Some("conv-m"), "one").await;
        let thread_id = first.thread_id.clone();

        let mut holder = h
            .orchestrator
            .locks()
            .acquire(&thread_id, "test", std::time::Duration::from_secs(1))
            .await
            .unwrap();
        let compaction = {
            let orchestrator = h.orchestrator.clone();
            let id = thread_id.clone();
            tokio::spawn(async move { orchestrator.compact(&id, 0).await })
        };
        let queued = h
            .orchestrator
            .handle_message(
                InboundMessage::new(Some(thread_id.as_str()), Channel::Web, "alice", "two"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(queued, TurnOutcome::Queued { .. }));
        holder.release();

        let outcome = compaction.await.unwrap().unwrap();
        assert_eq!(outcome.compacted, 2);
        assert_eq!(h.agent.requests().len(), 2);
        assert_eq!(h.agent.requests()[1].prompt, "two");
        assert_eq!(h.orchestrator.locks().queue_len(&thread_id), 0);
        assert!(!h.orchestrator.locks().is_locked(&thread_id));
    }

    #[tokio::test]
    async fn test_failed_resume_redelivers_changed_context() {
        let h = harness_with(ScriptedAgent::default(), |c| {
            c.orchestrator.completion_check = false;
        });
        let first = send(&h, Some("conv-r"), "hello").await;
        let db = h.orchestrator.db();
        db.add_thread_ref(&first.thread_id, &NewThreadRef::issue("acme/app", 12))
            .unwrap();
        h.orchestrator.cache().invalidate_key(&stack_key(&first.thread_id));

        h.agent
            .push_err(AgentError::Failed("process exited".to_string()));
        let failed = h
            .orchestrator
            .handle_message(
                InboundMessage::new(Some(first.thread_id.as_str()), Channel::Web, "alice", "status?"),
                CancellationToken::new(),
            )
            .await;
        assert!(failed.is_err());

        send(&h, Some(first.thread_id.as_str()), "status again?").await;
        let requests = h.agent.requests();
        assert_eq!(requests.len(), 3);
        for request in &requests[1..] {
            assert_eq!(request.session_id.as_deref(), Some("sess-1"));
            let context = request.context.as_deref().unwrap_or_default();
            assert!(context.contains("acme/app issue"), "context: {:?}", context);
        }
    }

    #[tokio::test]
    async fn test_auto_compaction_clears_session() {
        let h = harness_with(ScriptedAgent::default(), |c| {
            c.orchestrator.auto_compact = true;
            c.orchestrator.compact_threshold = 4;
            c.orchestrator.keep_recent = 2;
            c.orchestrator.completion_check = false;
        });
        let first = send(&h, Some("conv-c"), "one").await;
        assert!(first.compacted.is_none());
        let second = send(&h, Some("conv-c"), "two").await;
        assert!(second.compacted.is_none());
        let third = send(&h, Some("conv-c"), "three").await;

        let compacted = third.compacted.unwrap();
        assert_eq!(compacted.compacted, 4);
        assert!(compacted.used_fallback);
        let thread = h.orchestrator.db().get_thread("conv-c").unwrap();
        assert!(thread.session_id.is_none());
        assert!(thread.summary.is_some());
    }

    #[tokio::test]
    async fn test_stopped_thread_reopens() {
        let h = harness();
        let first = send(&h, None, "hello").await;
        h.orchestrator.stop_thread(&first.thread_id).unwrap();
        send(&h, Some(first.thread_id.as_str()), "back again").await;
        let thread = h.orchestrator.db().get_thread(&first.thread_id).unwrap();
        assert_eq!(thread.status, ThreadStatus::Active);
        assert!(thread.closed_at.is_none());
    }

    #[tokio::test]
    async fn test_fork_seeds_child_stack() {
        let h = harness();
        let first = send(&h, None, "/issue acme/app#3").await;
        let child = h
            .orchestrator
            .fork(&first.thread_id, &ForkOptions::default())
            .await
            .unwrap();

        let stack = h
            .orchestrator
            .cache()
            .get::<crate::context::ContextStack>(&stack_key(&child.id))
            .unwrap();
        assert!(stack.layer(crate::context::LayerKind::Ticket).is_some());
        assert!(stack.layer(crate::context::LayerKind::Lineage).is_some());
    }

    #[tokio::test]
    async fn test_webhook_updates_ref_status() {
        let h = harness();
        let thread = h
            .orchestrator
            .db()
            .create_thread(&CreateThreadInput::default())
            .unwrap();
        h.orchestrator
            .db()
            .add_thread_ref(&thread.id, &NewThreadRef::pull_request("acme/app", 4))
            .unwrap();

        h.orchestrator
            .apply_webhook(&WebhookEvent {
                event_type: WebhookEventType::PrMerge,
                repo: "acme/app".to_string(),
                number: Some(4),
                changed_files: vec![],
            })
            .unwrap();
        let refs = h.orchestrator.db().get_thread_refs(&thread.id).unwrap();
        assert_eq!(refs[0].status.as_deref(), Some("merged"));
    }
}
