use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Issue fields the ticket layer renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgeIssue {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Read access to the code forge. Failures are reported as `CoreError::Upstream`.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Raw contents of `path` on the default branch; `None` if the file does not exist
    async fn fetch_file(&self, repo: &str, path: &str) -> Result<Option<String>>;

    async fn fetch_issue(&self, repo: &str, number: i64) -> Result<ForgeIssue>;
}
