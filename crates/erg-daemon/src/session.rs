use erg_core::now_rfc3339;
use erg_issues::{Issue, Source};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

// ── Status enums ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The session's state is not in the graph, or a choice had no match.
    Graph,
    Configuration,
    HookFailure,
    HookTimeout,
    ActionFailure,
    /// A state's own timeout expired with no timeout edge to take.
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// State the error was raised in.
    pub state: String,
    pub timestamp: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, state: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            state: state.to_string(),
            timestamp: now_rfc3339(),
        }
    }
}

// ── Session ──

/// One unit of in-flight work, persisted as `sessions/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub repo_path: PathBuf,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<Issue>,
    /// Task text for child sessions, which have no issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub state: String,
    /// Steps taken in the current state; reset on every transition.
    #[serde(default)]
    pub attempts: u32,
    pub state_entered_at: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub pr_merged: bool,
    #[serde(default)]
    pub pr_comments_addressed: u32,
    /// Step data read by choice states (e.g. `ci_status`).
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
    #[serde(default)]
    pub cost_usd: f64,
    pub created_at: String,
    pub updated_at: String,
    /// Bumped on every persisted step.
    #[serde(default)]
    pub version: u32,
}

impl Session {
    pub fn new(id: impl Into<String>, repo_path: &Path, branch: impl Into<String>, initial: &str) -> Self {
        let now = now_rfc3339();
        Self {
            id: id.into(),
            repo_path: repo_path.to_path_buf(),
            branch: branch.into(),
            worktree: None,
            issue: None,
            task: None,
            parent_id: None,
            state: initial.to_string(),
            attempts: 0,
            state_entered_at: now.clone(),
            status: SessionStatus::Active,
            pr_url: None,
            pr_merged: false,
            pr_comments_addressed: 0,
            data: BTreeMap::new(),
            last_error: None,
            cost_usd: 0.0,
            created_at: now.clone(),
            updated_at: now,
            version: 0,
        }
    }

    pub fn with_issue(mut self, issue: Issue) -> Self {
        self.issue = Some(issue);
        self
    }

    /// Directory commands run in: the worktree when one exists.
    pub fn work_dir(&self) -> &Path {
        self.worktree.as_deref().unwrap_or(&self.repo_path)
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Time spent in the current state. Unparseable timestamps count as zero.
    pub fn time_in_state(&self) -> Duration {
        let Some(entered) = erg_core::parse_rfc3339(&self.state_entered_at) else {
            return Duration::ZERO;
        };
        let elapsed = time::OffsetDateTime::now_utc() - entered;
        elapsed.try_into().unwrap_or(Duration::ZERO)
    }

    /// Move to `state`, resetting the per-state counters.
    pub fn enter(&mut self, state: &str) {
        self.state = state.to_string();
        self.attempts = 0;
        self.state_entered_at = now_rfc3339();
    }

    pub fn issue_id(&self) -> Option<&str> {
        self.issue.as_ref().map(|i| i.id.as_str())
    }

    /// Prompt text for the coding agent.
    pub fn prompt(&self) -> String {
        match (&self.issue, &self.task) {
            (Some(issue), _) if issue.body.trim().is_empty() => issue.title.clone(),
            (Some(issue), _) => format!("{}\n\n{}", issue.title, issue.body),
            (None, Some(task)) => task.clone(),
            (None, None) => String::new(),
        }
    }
}

// ── Identity ──

/// Fixed namespace UUID for erg sessions.
const SESSION_NS: Uuid = Uuid::from_bytes([
    0x0e, 0x29, 0x5e, 0x55, 0x00, 0x00, 0x40, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
]);

/// Deterministic session ID per source + repo + issue, so a re-polled issue
/// maps onto the same session.
pub fn session_id(source: Source, repo: &Path, issue_id: &str) -> String {
    let key = format!("{}:{}:{}", source.as_str(), repo.display(), issue_id);
    Uuid::new_v5(&SESSION_NS, key.as_bytes()).to_string()
}

/// Deterministic child session ID per parent + task.
pub fn child_session_id(parent_id: &str, task: &str) -> String {
    Uuid::new_v5(&SESSION_NS, format!("child:{parent_id}:{task}").as_bytes()).to_string()
}
