use crate::config::AgentConfig;
use crate::git::GitService;
use crate::runner::AgentRunner;
use async_trait::async_trait;
use erg_issues::{Provider, Source};
use std::sync::Arc;
use std::time::Duration;

/// Numeric and boolean knobs actions read from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub max_turns: u32,
    pub max_duration: Duration,
    pub auto_merge: bool,
    pub merge_method: String,
    pub auto_address_pr_comments: bool,
    pub review_max_attempts: u32,
}

impl From<&AgentConfig> for Settings {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            max_turns: cfg.max_turns,
            max_duration: Duration::from_secs(cfg.max_duration_min * 60),
            auto_merge: cfg.auto_merge,
            merge_method: cfg.merge_method.clone(),
            auto_address_pr_comments: cfg.auto_address_pr_comments,
            review_max_attempts: cfg.review_max_attempts,
        }
    }
}

/// A newly created child session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub branch: String,
}

/// Everything actions and merge checks may touch outside the session they
/// are advancing. Diagnostics go through `tracing`; the engine opens a span
/// per session so every event carries the session ID.
#[async_trait]
pub trait Host: Send + Sync {
    fn config(&self) -> &AgentConfig;
    fn git(&self) -> &dyn GitService;
    fn runner(&self) -> &dyn AgentRunner;
    fn provider(&self, source: Source) -> Option<Arc<dyn Provider>>;

    /// Remove and return the session's pending message.
    fn take_pending_message(&self, session_id: &str) -> Option<String>;
    fn set_pending_message(&self, session_id: &str, message: &str);

    fn settings(&self) -> Settings {
        Settings::from(self.config())
    }

    async fn create_child_session(&self, parent_id: &str, task: &str) -> anyhow::Result<SessionInfo>;
    async fn cleanup_session(&self, session_id: &str) -> anyhow::Result<()>;

    /// Persist a finished agent run's transcript lines.
    fn save_runner_messages(&self, session_id: &str, lines: &[String]) -> anyhow::Result<()>;
    fn is_worker_running(&self, session_id: &str) -> bool;
    fn record_spend(&self, cost_usd: f64, output_tokens: u64, input_tokens: u64);
}
