//! Context cache
//!
//! In-memory TTL cache keyed by layer (`claude_md:{repo}`, `issue:{repo}#{n}`,
//! `context_stack:{thread}`), plus per-session records of which layer
//! checksums were last injected.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{claude_md_key, issue_key, stack_key, ContextLayer, ContextStack, STACK_KEY_PREFIX};
use crate::error::Result;
use crate::types::now_millis;

/// Hex content checksum. Not cryptographic.
pub fn checksum<T: Hash + ?Sized>(value: &T) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// TTLs and the knowledge file name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub knowledge_file: String,
    pub knowledge_ttl_secs: u64,
    pub issue_ttl_secs: u64,
    pub stack_ttl_secs: u64,
    pub injection_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            knowledge_file: "CLAUDE.md".to_string(),
            knowledge_ttl_secs: 3600,
            issue_ttl_secs: 600,
            stack_ttl_secs: 300,
            injection_ttl_secs: 1800,
        }
    }
}

impl CacheConfig {
    pub fn knowledge_ttl(&self) -> Duration {
        Duration::from_secs(self.knowledge_ttl_secs)
    }

    pub fn issue_ttl(&self) -> Duration {
        Duration::from_secs(self.issue_ttl_secs)
    }

    pub fn stack_ttl(&self) -> Duration {
        Duration::from_secs(self.stack_ttl_secs)
    }

    pub fn injection_ttl(&self) -> Duration {
        Duration::from_secs(self.injection_ttl_secs)
    }
}

struct CacheEntry {
    value: serde_json::Value,
    checksum: String,
    #[allow(dead_code)]
    created_at: i64,
    expires_at: i64,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Layer checksums last injected into an agent session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionRecord {
    pub session_id: String,
    pub thread_id: String,
    pub checksums: BTreeMap<String, String>,
    pub injected_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheGcStats {
    pub entries: usize,
    pub injections: usize,
}

/// Forge webhook kinds that affect cached context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    IssueUpdate,
    IssueClose,
    PrMerge,
    PrClose,
    Push,
}

impl WebhookEventType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "issue_update" => Some(WebhookEventType::IssueUpdate),
            "issue_close" => Some(WebhookEventType::IssueClose),
            "pr_merge" => Some(WebhookEventType::PrMerge),
            "pr_close" => Some(WebhookEventType::PrClose),
            "push" => Some(WebhookEventType::Push),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event_type: WebhookEventType,
    pub repo: String,
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(String),
    Prefix(String),
}

pub struct ContextCache {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    injections: Mutex<HashMap<String, InjectionRecord>>,
}

impl ContextCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            injections: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().expect("cache mutex poisoned")
    }

    fn injections(&self) -> MutexGuard<'_, HashMap<String, InjectionRecord>> {
        self.injections.lock().expect("injection mutex poisoned")
    }

    /// Store a value and return its checksum
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<String> {
        let value = serde_json::to_value(value)?;
        let sum = checksum(&serde_json::to_string(&value)?);
        let now = now_millis();
        self.entries().insert(
            key.to_string(),
            CacheEntry {
                value,
                checksum: sum.clone(),
                created_at: now,
                expires_at: now + ttl.as_millis() as i64,
            },
        );
        Ok(sum)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with_checksum(key).map(|(v, _)| v)
    }

    pub fn get_with_checksum<T: DeserializeOwned>(&self, key: &str) -> Option<(T, String)> {
        let mut entries = self.entries();
        let now = now_millis();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return None;
        }
        let entry = entries.get(key)?;
        match serde_json::from_value(entry.value.clone()) {
            Ok(v) => Some((v, entry.checksum.clone())),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    pub fn invalidate_key(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        before - entries.len()
    }

    /// Sweep expired entries and stale injection records
    pub fn gc(&self) -> CacheGcStats {
        let now = now_millis();
        let entries = {
            let mut entries = self.entries();
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired(now));
            before - entries.len()
        };
        let ttl = self.config.injection_ttl().as_millis() as i64;
        let injections = {
            let mut injections = self.injections();
            let before = injections.len();
            injections.retain(|_, r| now - r.injected_at < ttl);
            before - injections.len()
        };
        if entries + injections > 0 {
            debug!(entries, injections, "Context cache swept");
        }
        CacheGcStats {
            entries,
            injections,
        }
    }

    // ============ Session injection tracking ============

    pub fn record_injection(
        &self,
        session_id: &str,
        thread_id: &str,
        checksums: BTreeMap<String, String>,
    ) {
        self.injections().insert(
            session_id.to_string(),
            InjectionRecord {
                session_id: session_id.to_string(),
                thread_id: thread_id.to_string(),
                checksums,
                injected_at: now_millis(),
            },
        );
    }

    pub fn get_last_injection(&self, session_id: &str) -> Option<InjectionRecord> {
        let mut injections = self.injections();
        let ttl = self.config.injection_ttl().as_millis() as i64;
        let record = injections.get(session_id)?;
        if now_millis() - record.injected_at >= ttl {
            injections.remove(session_id);
            return None;
        }
        Some(record.clone())
    }

    /// Layers whose checksum differs from the last injection, including layers
    /// that appeared or disappeared. `None` when there is no live baseline.
    pub fn detect_changes(
        &self,
        session_id: &str,
        current: &BTreeMap<String, String>,
    ) -> Option<Vec<String>> {
        let last = self.get_last_injection(session_id)?;
        let mut changed: Vec<String> = current
            .iter()
            .filter(|(layer, sum)| last.checksums.get(*layer) != Some(*sum))
            .map(|(layer, _)| layer.clone())
            .collect();
        changed.extend(
            last.checksums
                .keys()
                .filter(|layer| !current.contains_key(*layer))
                .cloned(),
        );
        changed.sort();
        Some(changed)
    }

    // ============ Fork ============

    /// Derive a child's stack from the parent's cached one, replacing only the
    /// overridden layers. Returns `None` when the parent has nothing cached.
    pub fn fork_context_stack(
        &self,
        parent_thread_id: &str,
        child_thread_id: &str,
        overrides: Vec<ContextLayer>,
    ) -> Result<Option<ContextStack>> {
        let Some(parent) = self.get::<ContextStack>(&stack_key(parent_thread_id)) else {
            return Ok(None);
        };

        let mut layers = parent.layers;
        for layer in overrides {
            match layers.iter_mut().find(|l| l.kind == layer.kind) {
                Some(existing) => *existing = layer,
                None => layers.push(layer),
            }
        }

        let child = ContextStack::new(child_thread_id, layers);
        self.set(&stack_key(child_thread_id), &child, self.config.stack_ttl())?;
        debug!(
            parent = %parent_thread_id,
            child = %child_thread_id,
            tokens = child.total_tokens,
            "Context stack forked from cache"
        );
        Ok(Some(child))
    }

    // ============ Webhooks ============

    /// Which cache keys and prefixes a forge event makes stale
    pub fn invalidations_for(&self, event: &WebhookEvent) -> Vec<Invalidation> {
        let stacks = Invalidation::Prefix(STACK_KEY_PREFIX.to_string());
        match event.event_type {
            WebhookEventType::IssueUpdate | WebhookEventType::IssueClose => {
                let mut out = Vec::new();
                if let Some(n) = event.number {
                    out.push(Invalidation::Key(issue_key(&event.repo, n)));
                }
                out.push(stacks);
                out
            }
            WebhookEventType::PrMerge => vec![Invalidation::Key(claude_md_key(&event.repo)), stacks],
            WebhookEventType::PrClose => vec![stacks],
            WebhookEventType::Push => {
                let touches_knowledge = event.changed_files.iter().any(|f| {
                    f == &self.config.knowledge_file
                        || f.ends_with(&format!("/{}", self.config.knowledge_file))
                });
                if touches_knowledge {
                    vec![Invalidation::Key(claude_md_key(&event.repo)), stacks]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Apply a webhook's invalidations. Returns the number of entries removed.
    pub fn apply_webhook(&self, event: &WebhookEvent) -> usize {
        let mut removed = 0;
        for inv in self.invalidations_for(event) {
            removed += match inv {
                Invalidation::Key(key) => usize::from(self.invalidate_key(&key)),
                Invalidation::Prefix(prefix) => self.invalidate_by_prefix(&prefix),
            };
        }
        info!(
            event = ?event.event_type,
            repo = %event.repo,
            number = ?event.number,
            removed,
            "Webhook invalidation applied"
        );
        removed
    }
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LayerKind;

    const HOUR: Duration = Duration::from_secs(3600);

    fn short_config() -> CacheConfig {
        CacheConfig {
            injection_ttl_secs: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_set_get_and_checksum() {
        let cache = ContextCache::default();
        let a = cache.set("issue:acme/app#1", &"body one", HOUR).unwrap();
        let b = cache.set("issue:acme/app#2", &"body one", HOUR).unwrap();
        let c = cache.set("issue:acme/app#3", &"body two", HOUR).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let (value, sum) = cache
            .get_with_checksum::<String>("issue:acme/app#1")
            .unwrap();
        assert_eq!(value, "body one");
        assert_eq!(sum, a);
        assert!(cache.get::<String>("missing").is_none());
    }

    #[test]
    fn test_expired_entries() {
        let cache = ContextCache::default();
        cache.set("k", &1, Duration::ZERO).unwrap();
        assert!(cache.get::<i32>("k").is_none());

        cache.set("gone", &1, Duration::ZERO).unwrap();
        cache.set("kept", &1, HOUR).unwrap();
        assert_eq!(cache.gc().entries, 1);
        assert_eq!(cache.get::<i32>("kept"), Some(1));
    }

    #[test]
    fn test_invalidate() {
        let cache = ContextCache::default();
        cache.set("context_stack:a", &1, HOUR).unwrap();
        cache.set("context_stack:b", &1, HOUR).unwrap();
        cache.set("claude_md:acme/app", &1, HOUR).unwrap();

        assert_eq!(cache.invalidate_by_prefix(STACK_KEY_PREFIX), 2);
        assert!(cache.invalidate_key("claude_md:acme/app"));
        assert!(!cache.invalidate_key("claude_md:acme/app"));
    }

    #[test]
    fn test_detect_changes() {
        let cache = ContextCache::default();
        let mut sums = BTreeMap::new();
        sums.insert("repo".to_string(), "aaa".to_string());
        sums.insert("ticket".to_string(), "bbb".to_string());

        assert!(cache.detect_changes("s1", &sums).is_none());
        cache.record_injection("s1", "t1", sums.clone());
        assert_eq!(cache.detect_changes("s1", &sums), Some(vec![]));

        let mut current = sums.clone();
        current.insert("ticket".to_string(), "ccc".to_string());
        current.insert("lineage".to_string(), "ddd".to_string());
        current.remove("repo");
        assert_eq!(
            cache.detect_changes("s1", &current),
            Some(vec![
                "lineage".to_string(),
                "repo".to_string(),
                "ticket".to_string()
            ])
        );
    }

    #[test]
    fn test_injection_expires() {
        let cache = ContextCache::new(short_config());
        cache.record_injection("s1", "t1", BTreeMap::new());
        assert!(cache.get_last_injection("s1").is_none());

        cache.record_injection("s2", "t1", BTreeMap::new());
        assert_eq!(cache.gc().injections, 1);
    }

    #[test]
    fn test_fork_context_stack() {
        let cache = ContextCache::default();
        assert!(cache
            .fork_context_stack("parent", "child", vec![])
            .unwrap()
            .is_none());

        let parent = ContextStack::new(
            "parent",
            vec![
                ContextLayer::bounded(LayerKind::Repo, "shared repo notes", 100),
                ContextLayer::bounded(LayerKind::Ticket, "issue #1", 100),
            ],
        );
        cache
            .set(&stack_key("parent"), &parent, HOUR)
            .unwrap();

        let child = cache
            .fork_context_stack(
                "parent",
                "child",
                vec![
                    ContextLayer::bounded(LayerKind::Ticket, "issue #2", 100),
                    ContextLayer::bounded(LayerKind::Execution, "1. step", 100),
                ],
            )
            .unwrap()
            .unwrap();

        assert_eq!(child.thread_id, "child");
        assert_eq!(child.layers.len(), 3);
        assert_eq!(
            child.layer(LayerKind::Repo),
            parent.layer(LayerKind::Repo)
        );
        assert_eq!(child.layer(LayerKind::Ticket).unwrap().content, "issue #2");
        assert!(child.formatted.contains("1. step"));
        assert_eq!(
            child.total_tokens,
            child.layers.iter().map(|l| l.tokens).sum::<usize>()
        );
        assert!(cache.get::<ContextStack>(&stack_key("child")).is_some());
    }

    #[test]
    fn test_push_without_knowledge_file_keeps_cache() {
        let cache = ContextCache::default();
        cache.set("claude_md:acme/app", &"notes", HOUR).unwrap();
        cache.set("context_stack:t1", &1, HOUR).unwrap();

        let push = WebhookEvent {
            event_type: WebhookEventType::Push,
            repo: "acme/app".to_string(),
            number: None,
            changed_files: vec!["src/main.rs".to_string()],
        };
        assert!(cache.invalidations_for(&push).is_empty());
        assert_eq!(cache.apply_webhook(&push), 0);
        assert!(cache.get::<String>("claude_md:acme/app").is_some());

        let push = WebhookEvent {
            changed_files: vec!["src/main.rs".to_string(), "CLAUDE.md".to_string()],
            ..push
        };
        assert_eq!(cache.apply_webhook(&push), 2);
        assert!(cache.get::<String>("claude_md:acme/app").is_none());
        assert!(cache.get::<i32>("context_stack:t1").is_none());
    }

    #[test]
    fn test_issue_and_pr_invalidations() {
        let cache = ContextCache::default();
        let issue = WebhookEvent {
            event_type: WebhookEventType::IssueClose,
            repo: "acme/app".to_string(),
            number: Some(4),
            changed_files: vec![],
        };
        assert_eq!(
            cache.invalidations_for(&issue),
            vec![
                Invalidation::Key("issue:acme/app#4".to_string()),
                Invalidation::Prefix("context_stack:".to_string()),
            ]
        );

        let merge = WebhookEvent {
            event_type: WebhookEventType::PrMerge,
            ..issue.clone()
        };
        assert_eq!(
            cache.invalidations_for(&merge)[0],
            Invalidation::Key("claude_md:acme/app".to_string())
        );

        let close = WebhookEvent {
            event_type: WebhookEventType::PrClose,
            ..issue
        };
        assert_eq!(
            cache.invalidations_for(&close),
            vec![Invalidation::Prefix("context_stack:".to_string())]
        );
    }
}
