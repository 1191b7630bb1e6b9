//! Layered context assembly
//!
//! - ContextCache: checksum/TTL cache, session injection tracking, webhook invalidation
//! - ContextStackBuilder: bounded repo / ticket / lineage / execution layers
//! - ForgeClient: where layer content comes from

mod cache;
mod forge;
mod stack;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use cache::{
    checksum, CacheConfig, CacheGcStats, ContextCache, InjectionRecord, Invalidation,
    WebhookEvent, WebhookEventType,
};
pub use forge::{ForgeClient, ForgeIssue};
pub use stack::{ContextBuild, ContextStackBuilder, Injection, LayerBudgets};

/// Approximate characters per token
pub const CHARS_PER_TOKEN: usize = 4;
pub const TRUNCATION_MARKER: &str = "[truncated]";
pub const STACK_KEY_PREFIX: &str = "context_stack:";

pub fn claude_md_key(repo: &str) -> String {
    format!("claude_md:{}", repo)
}

pub fn issue_key(repo: &str, number: i64) -> String {
    format!("issue:{}#{}", repo, number)
}

pub fn stack_key(thread_id: &str) -> String {
    format!("{}{}", STACK_KEY_PREFIX, thread_id)
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Cut `text` to at most `max_tokens` (marker included), ending with the marker.
/// Returns the text unchanged when it already fits.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> (String, bool) {
    if estimate_tokens(text) <= max_tokens {
        return (text.to_string(), false);
    }
    let marker = format!("\n{}", TRUNCATION_MARKER);
    let budget_chars = (max_tokens * CHARS_PER_TOKEN).saturating_sub(marker.chars().count());
    let mut cut: String = text.chars().take(budget_chars).collect();
    cut.push_str(&marker);
    (cut, true)
}

/// The four layers, in injection order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Repo,
    Ticket,
    Lineage,
    Execution,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Repo => "repo",
            LayerKind::Ticket => "ticket",
            LayerKind::Lineage => "lineage",
            LayerKind::Execution => "execution",
        }
    }

    fn heading(&self) -> &'static str {
        match self {
            LayerKind::Repo => "Repository knowledge",
            LayerKind::Ticket => "Linked issues",
            LayerKind::Lineage => "Parent thread",
            LayerKind::Execution => "Execution plan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextLayer {
    pub kind: LayerKind,
    pub content: String,
    pub tokens: usize,
    pub checksum: String,
    pub truncated: bool,
}

impl ContextLayer {
    /// Build a layer bounded to `max_tokens`
    pub fn bounded(kind: LayerKind, content: &str, max_tokens: usize) -> Self {
        let (content, truncated) = truncate_to_tokens(content, max_tokens);
        Self {
            kind,
            tokens: estimate_tokens(&content),
            checksum: checksum(&content),
            content,
            truncated,
        }
    }
}

/// An assembled set of layers plus the text actually injected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStack {
    pub thread_id: String,
    pub layers: Vec<ContextLayer>,
    pub total_tokens: usize,
    pub formatted: String,
    pub built_at: i64,
}

impl ContextStack {
    pub fn new(thread_id: &str, mut layers: Vec<ContextLayer>) -> Self {
        layers.sort_by_key(|l| l.kind);
        let total_tokens = layers.iter().map(|l| l.tokens).sum();
        let formatted = format_layers(&layers);
        Self {
            thread_id: thread_id.to_string(),
            layers,
            total_tokens,
            formatted,
            built_at: crate::types::now_millis(),
        }
    }

    pub fn layer(&self, kind: LayerKind) -> Option<&ContextLayer> {
        self.layers.iter().find(|l| l.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn checksums(&self) -> BTreeMap<String, String> {
        self.layers
            .iter()
            .map(|l| (l.kind.as_str().to_string(), l.checksum.clone()))
            .collect()
    }

    /// Formatted text of only the named layers
    pub fn format_subset(&self, kinds: &[String]) -> String {
        let selected: Vec<ContextLayer> = self
            .layers
            .iter()
            .filter(|l| kinds.iter().any(|k| k == l.kind.as_str()))
            .cloned()
            .collect();
        format_layers(&selected)
    }
}

fn format_layers(layers: &[ContextLayer]) -> String {
    layers
        .iter()
        .map(|l| format!("## {}\n\n{}", l.kind.heading(), l.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_budget() {
        let text = "x".repeat(1000);
        let (cut, truncated) = truncate_to_tokens(&text, 50);
        assert!(truncated);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert!(estimate_tokens(&cut) <= 50);

        let (same, truncated) = truncate_to_tokens("short", 50);
        assert!(!truncated);
        assert_eq!(same, "short");
    }

    #[test]
    fn test_stack_orders_and_totals() {
        let stack = ContextStack::new(
            "t1",
            vec![
                ContextLayer::bounded(LayerKind::Lineage, "parent summary", 100),
                ContextLayer::bounded(LayerKind::Repo, "repo notes", 100),
            ],
        );
        assert_eq!(stack.layers[0].kind, LayerKind::Repo);
        assert_eq!(
            stack.total_tokens,
            estimate_tokens("parent summary") + estimate_tokens("repo notes")
        );
        assert!(stack.formatted.starts_with("## Repository knowledge"));
        assert_eq!(stack.checksums().len(), 2);

        let subset = stack.format_subset(&["lineage".to_string()]);
        assert!(subset.contains("parent summary"));
        assert!(!subset.contains("repo notes"));
    }
}
