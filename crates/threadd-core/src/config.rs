//! Daemon configuration (`config.yaml`)

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::compaction::{DEFAULT_COMPACT_THRESHOLD, DEFAULT_KEEP_RECENT};
use crate::context::{CacheConfig, LayerBudgets};
use crate::core::DEFAULT_LOCK_TIMEOUT;

/// Turn-loop knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Label recorded as lock holder
    pub holder: String,
    pub lock_timeout_secs: u64,
    /// Extra turns allowed when the agent stops on its turn limit
    pub max_continuations: usize,
    pub max_enforcement_rounds: usize,
    /// Run one heuristic completion-check turn when nothing was enforced
    pub completion_check: bool,
    pub compact_threshold: usize,
    pub keep_recent: usize,
    /// Compact in place (and start a fresh session) once over threshold
    pub auto_compact: bool,
    /// Live events replayed to a fresh agent session
    pub history_limit: usize,
    /// Checkouts are looked up as `{workspaceRoot}/{owner}/{name}`
    pub workspace_root: Option<PathBuf>,
    /// Per-repo overrides of the checkout location
    pub workspaces: HashMap<String, PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            holder: "threadd".to_string(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT.as_secs(),
            max_continuations: 3,
            max_enforcement_rounds: 3,
            completion_check: true,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            keep_recent: DEFAULT_KEEP_RECENT,
            auto_compact: false,
            history_limit: 40,
            workspace_root: None,
            workspaces: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Where the checkout for `repo` lives, if configured
    pub fn workspace_for(&self, repo: &str) -> Option<PathBuf> {
        self.workspaces
            .get(repo)
            .cloned()
            .or_else(|| self.workspace_root.as_ref().map(|root| root.join(repo)))
    }
}

/// Agent process settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub claude_path: Option<String>,
    pub model: Option<String>,
    pub summary_model: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub cwd: Option<PathBuf>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreaddConfig {
    pub db_path: Option<PathBuf>,
    pub orchestrator: OrchestratorConfig,
    pub cache: CacheConfig,
    pub budgets: LayerBudgets,
    pub agent: AgentConfig,
}

impl ThreaddConfig {
    /// Load from YAML; a missing or unreadable file yields defaults
    pub fn load(path: &Path) -> ThreaddConfig {
        if !path.exists() {
            info!(path = ?path, "No config found, using defaults");
            return ThreaddConfig::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(config) => {
                    info!(path = ?path, "Config loaded");
                    config
                }
                Err(e) => {
                    error!(error = %e, path = ?path, "Failed to parse config");
                    ThreaddConfig::default()
                }
            },
            Err(e) => {
                error!(error = %e, path = ?path, "Failed to read config");
                ThreaddConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = ThreaddConfig::load(&dir.path().join("config.yaml"));
        assert_eq!(config.orchestrator.keep_recent, 10);
        assert_eq!(config.orchestrator.lock_timeout(), Duration::from_secs(300));
        assert_eq!(config.budgets.total, 7000);
        assert_eq!(config.cache.knowledge_file, "CLAUDE.md");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "orchestrator:\n  autoCompact: true\n  workspaceRoot: /src\n  workspaces:\n    acme/special: /opt/special\nbudgets:\n  repo: 3000\n",
        )
        .unwrap();

        let config = ThreaddConfig::load(&path);
        assert!(config.orchestrator.auto_compact);
        assert_eq!(config.orchestrator.max_enforcement_rounds, 3);
        assert_eq!(config.budgets.repo, 3000);
        assert_eq!(config.budgets.ticket, 2000);
        assert_eq!(
            config.orchestrator.workspace_for("acme/app"),
            Some(PathBuf::from("/src/acme/app"))
        );
        assert_eq!(
            config.orchestrator.workspace_for("acme/special"),
            Some(PathBuf::from("/opt/special"))
        );
    }

    #[test]
    fn test_invalid_yaml_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "orchestrator: [not, a, map").unwrap();
        let config = ThreaddConfig::load(&path);
        assert_eq!(config.orchestrator.max_continuations, 3);
    }
}
