//! Intent-without-follow-through detection on agent replies
//!
//! Regex heuristic; known to be imprecise in both directions. Swap the
//! detector rather than tightening patterns.

use once_cell::sync::Lazy;
use regex::Regex;

static INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(i will|i'll|i am going to|i'm going to|let me|next,? i)\b")
        .expect("valid regex")
});

static PR_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(pull request|PR|merge request)\b").expect("valid regex"));

static PR_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://\S+/(pull|merge_requests)/\d+").expect("valid regex")
});

static CODE_CHANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(modified|updated|changed|fixed|implemented|refactored|edited|added|rewrote)\b.{0,40}?\b(files?|code|functions?|modules?|tests?|components?|handlers?)\b",
    )
    .expect("valid regex")
});

static COMPLETION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(✅|\b(all )?done\b|\bcompleted\b|\bfinished\b|\bmerged\b|\bno (code )?changes? (are |were )?(needed|required)\b)",
    )
    .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentSignal {
    /// "I will ..." style announcement
    StatedIntent,
    PrWithoutUrl,
    CodeChangeWithoutPr,
}

impl IntentSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentSignal::StatedIntent => "stated_intent",
            IntentSignal::PrWithoutUrl => "pr_without_url",
            IntentSignal::CodeChangeWithoutPr => "code_change_without_pr",
        }
    }
}

/// Strategy for spotting replies that promise work without finishing it
pub trait IntentDetector: Send + Sync {
    /// Signals found in `response`; empty when the reply looks finished or informational
    fn detect(&self, response: &str) -> Vec<IntentSignal>;
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicIntentDetector;

impl IntentDetector for HeuristicIntentDetector {
    fn detect(&self, response: &str) -> Vec<IntentSignal> {
        let has_pr_url = PR_URL_RE.is_match(response);
        if has_pr_url || COMPLETION_RE.is_match(response) {
            return Vec::new();
        }

        let intent = INTENT_RE.is_match(response);
        let code_change = CODE_CHANGE_RE.is_match(response);
        // A PR mention alone is informational
        if !intent && !code_change {
            return Vec::new();
        }

        let mut signals = Vec::new();
        if intent {
            signals.push(IntentSignal::StatedIntent);
        }
        if PR_MENTION_RE.is_match(response) {
            signals.push(IntentSignal::PrWithoutUrl);
        }
        if code_change {
            signals.push(IntentSignal::CodeChangeWithoutPr);
        }
        signals
    }
}

/// Directive sent when a reply trails off without follow-through
pub fn completion_check_directive(signals: &[IntentSignal]) -> String {
    let reasons: Vec<&str> = signals.iter().map(|s| s.as_str()).collect();
    format!(
        "[completion check: {}] Your last reply described work that is not visibly finished. \
         Carry it through now: make the change, push a branch, open a pull request and include its URL. \
         If nothing further is needed, say so explicitly.",
        reasons.join(", ")
    )
}
