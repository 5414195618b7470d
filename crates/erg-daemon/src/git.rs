//! Version-control operations: worktrees via `git`, pull requests via `gh`.

use async_trait::async_trait;
use erg_core::{ExecError, Executor};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("unexpected gh output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
    /// No decision yet, or none required.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiStatus {
    Passing,
    Pending,
    Failing,
    /// Output could not be interpreted.
    Unknown,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiStatus::Passing => "passing",
            CiStatus::Pending => "pending",
            CiStatus::Failing => "failing",
            CiStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

/// A PR conversation comment or review body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrComment {
    pub author: String,
    pub body: String,
}

#[async_trait]
pub trait GitService: Send + Sync {
    async fn create_worktree(&self, repo: &Path, branch: &str, dest: &Path) -> Result<(), GitError>;
    async fn remove_worktree(&self, repo: &Path, dest: &Path) -> Result<(), GitError>;
    async fn push_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError>;
    /// Push the branch and open a PR for it. Returns the PR URL.
    async fn create_pr(&self, dir: &Path, branch: &str, title: &str, body: &str) -> Result<String, GitError>;
    async fn review_decision(&self, dir: &Path, branch: &str) -> Result<ReviewDecision, GitError>;
    /// Never fails: anything unreadable is [`CiStatus::Unknown`].
    async fn ci_status(&self, dir: &Path, branch: &str) -> CiStatus;
    async fn pr_comments(&self, dir: &Path, branch: &str) -> Result<Vec<PrComment>, GitError>;
    async fn merge_pr(&self, dir: &Path, branch: &str, method: &str) -> Result<(), GitError>;
    async fn pr_state(&self, dir: &Path, branch: &str) -> Result<PrState, GitError>;
}

/// [`GitService`] backed by the `git` and `gh` CLIs.
pub struct GhGitService {
    exec: Arc<dyn Executor>,
}

impl GhGitService {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }

    async fn gh_json<T: for<'de> Deserialize<'de>>(&self, dir: &Path, args: &[&str]) -> Result<T, GitError> {
        let out = self.exec.run(dir, "gh", args).await?;
        serde_json::from_slice(&out.stdout).map_err(|e| GitError::Parse(e.to_string()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewView {
    #[serde(default)]
    review_decision: Option<String>,
}

#[derive(Deserialize)]
struct StateView {
    state: String,
}

#[derive(Deserialize)]
struct Check {
    #[serde(default)]
    state: String,
}

#[derive(Deserialize, Default)]
struct Author {
    #[serde(default)]
    login: String,
}

#[derive(Deserialize)]
struct CommentView {
    #[serde(default)]
    author: Option<Author>,
    #[serde(default)]
    body: String,
}

#[derive(Deserialize)]
struct CommentsView {
    #[serde(default)]
    comments: Vec<CommentView>,
    #[serde(default)]
    reviews: Vec<CommentView>,
}

#[async_trait]
impl GitService for GhGitService {
    async fn create_worktree(&self, repo: &Path, branch: &str, dest: &Path) -> Result<(), GitError> {
        let dest = dest.to_string_lossy();
        self.exec
            .run(repo, "git", &["worktree", "add", "-B", branch, dest.as_ref()])
            .await?;
        Ok(())
    }

    async fn remove_worktree(&self, repo: &Path, dest: &Path) -> Result<(), GitError> {
        let dest = dest.to_string_lossy();
        self.exec
            .run(repo, "git", &["worktree", "remove", "--force", dest.as_ref()])
            .await?;
        Ok(())
    }

    async fn push_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.exec.run(dir, "git", &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    async fn create_pr(&self, dir: &Path, branch: &str, title: &str, body: &str) -> Result<String, GitError> {
        self.push_branch(dir, branch).await?;
        let out = self
            .exec
            .run(
                dir,
                "gh",
                &["pr", "create", "--head", branch, "--title", title, "--body", body],
            )
            .await?;
        let stdout = out.stdout_str();
        // gh prints progress lines before the URL.
        Ok(stdout.lines().last().unwrap_or_default().trim().to_string())
    }

    async fn review_decision(&self, dir: &Path, branch: &str) -> Result<ReviewDecision, GitError> {
        let out = self
            .exec
            .run(dir, "gh", &["pr", "view", branch, "--json", "reviewDecision"])
            .await?;
        if out.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(ReviewDecision::None);
        }
        let view: ReviewView =
            serde_json::from_slice(&out.stdout).map_err(|e| GitError::Parse(e.to_string()))?;
        Ok(match view.review_decision.as_deref().unwrap_or("") {
            "APPROVED" => ReviewDecision::Approved,
            "CHANGES_REQUESTED" => ReviewDecision::ChangesRequested,
            "REVIEW_REQUIRED" => ReviewDecision::ReviewRequired,
            _ => ReviewDecision::None,
        })
    }

    async fn ci_status(&self, dir: &Path, branch: &str) -> CiStatus {
        // `gh pr checks` exits non-zero for failing and pending checks, so
        // the JSON is read whatever the exit status.
        let out = match self
            .exec
            .output(dir, "gh", &["pr", "checks", branch, "--json", "state"])
            .await
        {
            Ok(out) => out,
            Err(_) => return CiStatus::Unknown,
        };
        match serde_json::from_slice::<Vec<Check>>(&out.stdout) {
            Ok(checks) => classify_checks(&checks),
            Err(_) => CiStatus::Unknown,
        }
    }

    async fn pr_comments(&self, dir: &Path, branch: &str) -> Result<Vec<PrComment>, GitError> {
        let view: CommentsView = self
            .gh_json(dir, &["pr", "view", branch, "--json", "comments,reviews"])
            .await?;
        Ok(view
            .comments
            .into_iter()
            .chain(view.reviews)
            .filter(|c| !c.body.trim().is_empty())
            .map(|c| PrComment {
                author: c.author.unwrap_or_default().login,
                body: c.body,
            })
            .collect())
    }

    async fn merge_pr(&self, dir: &Path, branch: &str, method: &str) -> Result<(), GitError> {
        let flag = format!("--{method}");
        self.exec
            .run(dir, "gh", &["pr", "merge", branch, flag.as_str(), "--delete-branch"])
            .await?;
        Ok(())
    }

    async fn pr_state(&self, dir: &Path, branch: &str) -> Result<PrState, GitError> {
        let view: StateView = self
            .gh_json(dir, &["pr", "view", branch, "--json", "state"])
            .await?;
        match view.state.as_str() {
            "OPEN" => Ok(PrState::Open),
            "MERGED" => Ok(PrState::Merged),
            "CLOSED" => Ok(PrState::Closed),
            other => Err(GitError::Parse(format!("unknown PR state {other}"))),
        }
    }
}

/// Any failure wins over pending, pending over passing. No checks at all
/// reads as passing.
fn classify_checks(checks: &[Check]) -> CiStatus {
    let mut pending = false;
    for c in checks {
        match c.state.to_ascii_uppercase().as_str() {
            "FAILURE" | "ERROR" | "CANCELLED" | "TIMED_OUT" | "ACTION_REQUIRED" | "STARTUP_FAILURE" => {
                return CiStatus::Failing
            }
            "PENDING" | "QUEUED" | "IN_PROGRESS" | "EXPECTED" | "WAITING" | "REQUESTED" => pending = true,
            _ => {}
        }
    }
    if pending {
        CiStatus::Pending
    } else {
        CiStatus::Passing
    }
}
