use anyhow::{Context, Result};
use erg_issues::{RepoSettings, Source};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration, stored as `config.json` in the config dir. Every
/// field has a default so a missing or partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
    /// Sessions advanced in parallel within one tick.
    #[serde(default = "default_three")]
    pub max_concurrent: usize,
    /// Active sessions before intake pauses.
    #[serde(default = "default_three")]
    pub max_active_sessions: usize,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_sec: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_duration")]
    pub max_duration_min: u64,
    #[serde(default = "default_true")]
    pub auto_merge: bool,
    #[serde(default = "default_merge_method")]
    pub merge_method: String,
    #[serde(default)]
    pub auto_address_pr_comments: bool,
    #[serde(default = "default_review_max_attempts")]
    pub review_max_attempts: u32,
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_sec: u64,
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout_sec: u64,
    /// Spend ceiling; once reached no new sessions are admitted.
    #[serde(default)]
    pub budget_usd: Option<f64>,
    #[serde(default)]
    pub workflow_file: Option<PathBuf>,
    #[serde(default = "default_claude_bin")]
    pub claude_bin: PathBuf,
}

/// A repository the daemon pulls work for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoConfig {
    pub path: PathBuf,
    /// Overrides the workflow's `source.provider`.
    #[serde(default)]
    pub provider: Option<Source>,
    #[serde(default)]
    pub label: Option<String>,
    /// Asana project GID.
    #[serde(default)]
    pub project: Option<String>,
    /// Linear team ID.
    #[serde(default)]
    pub team: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            max_concurrent: default_three(),
            max_active_sessions: default_three(),
            tick_interval_sec: default_tick_interval(),
            max_turns: default_max_turns(),
            max_duration_min: default_max_duration(),
            auto_merge: true,
            merge_method: default_merge_method(),
            auto_address_pr_comments: false,
            review_max_attempts: default_review_max_attempts(),
            provider_timeout_sec: default_provider_timeout(),
            hook_timeout_sec: default_hook_timeout(),
            budget_usd: None,
            workflow_file: None,
            claude_bin: default_claude_bin(),
        }
    }
}

impl AgentConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        erg_store::write_atomic(path, json.as_bytes())
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be at least 1");
        }
        if !matches!(self.merge_method.as_str(), "rebase" | "squash" | "merge") {
            anyhow::bail!(
                "merge_method must be one of rebase, squash, merge; got \"{}\"",
                self.merge_method
            );
        }
        Ok(())
    }

    pub fn repo(&self, path: &Path) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| r.path == path)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_sec)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_sec)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_sec)
    }
}

impl RepoSettings for AgentConfig {
    fn asana_project(&self, repo: &Path) -> Option<String> {
        self.repo(repo).and_then(|r| r.project.clone()).filter(|p| !p.is_empty())
    }

    fn linear_team(&self, repo: &Path) -> Option<String> {
        self.repo(repo).and_then(|r| r.team.clone()).filter(|t| !t.is_empty())
    }
}

fn default_three() -> usize {
    3
}
fn default_tick_interval() -> u64 {
    30
}
fn default_max_turns() -> u32 {
    50
}
fn default_max_duration() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_merge_method() -> String {
    "rebase".into()
}
fn default_review_max_attempts() -> u32 {
    120
}
fn default_provider_timeout() -> u64 {
    30
}
fn default_hook_timeout() -> u64 {
    120
}
fn default_claude_bin() -> PathBuf {
    PathBuf::from("claude")
}
