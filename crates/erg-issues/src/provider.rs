use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

/// Where an issue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Github,
    Asana,
    Linear,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Github => "github",
            Source::Asana => "asana",
            Source::Linear => "linear",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(Source::Github),
            "asana" => Ok(Source::Asana),
            "linear" => Ok(Source::Linear),
            other => Err(format!("unknown issue provider: {other}")),
        }
    }
}

/// An external work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: String,
    pub source: Source,
}

/// Provider-agnostic query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Label or tag name; empty means unfiltered.
    #[serde(default)]
    pub label: String,
    /// Asana project GID.
    #[serde(default)]
    pub project: String,
    /// Linear team ID.
    #[serde(default)]
    pub team: String,
}

/// Per-repository provider settings, supplied by the daemon config.
pub trait RepoSettings: Send + Sync {
    fn asana_project(&self, repo: &Path) -> Option<String>;
    fn linear_team(&self, repo: &Path) -> Option<String>;
}

/// Case-insensitive exact label match; an empty wanted label matches all.
pub fn label_matches<'a>(wanted: &str, labels: impl IntoIterator<Item = &'a str>) -> bool {
    wanted.is_empty() || labels.into_iter().any(|l| l.eq_ignore_ascii_case(wanted))
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;
    fn source(&self) -> Source;
    fn is_configured(&self, repo: &Path) -> bool;

    /// Open items for `repo`, filtered by `filter.label` when non-empty.
    async fn fetch_issues(
        &self,
        repo: &Path,
        filter: &FilterConfig,
    ) -> Result<Vec<Issue>, ProviderError>;

    fn generate_branch_name(&self, issue: &Issue) -> String;

    /// Text for the PR body that links or closes the issue. Empty when the
    /// tracker has no such convention.
    fn pr_link_text(&self, issue: &Issue) -> String;

    /// Write-back capability, when the tracker supports it.
    fn actions(&self) -> Option<&dyn ProviderActions> {
        None
    }
}

#[async_trait::async_trait]
pub trait ProviderActions: Send + Sync {
    async fn remove_label(&self, repo: &Path, issue_id: &str, label: &str)
        -> Result<(), ProviderError>;
    async fn comment(&self, repo: &Path, issue_id: &str, body: &str) -> Result<(), ProviderError>;
}

// ── Static provider (tests and dry runs) ──

/// A recorded write-back call on [`StaticProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedAction {
    RemoveLabel { issue_id: String, label: String },
    Comment { issue_id: String, body: String },
}

/// In-memory provider returning a fixed list of issues.
pub struct StaticProvider {
    source: Source,
    issues: Mutex<Vec<Issue>>,
    issue_labels: Vec<(String, Vec<String>)>,
    configured: Mutex<bool>,
    fail_with_missing_credential: Mutex<bool>,
    with_actions: bool,
    recorded: Mutex<Vec<RecordedAction>>,
}

impl StaticProvider {
    pub fn new(source: Source, issues: Vec<Issue>) -> Self {
        Self {
            source,
            issues: Mutex::new(issues),
            issue_labels: Vec::new(),
            configured: Mutex::new(true),
            fail_with_missing_credential: Mutex::new(false),
            with_actions: false,
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Attach labels to an issue ID so label filtering applies.
    pub fn with_labels(mut self, issue_id: &str, labels: &[&str]) -> Self {
        self.issue_labels.push((
            issue_id.to_string(),
            labels.iter().map(|l| l.to_string()).collect(),
        ));
        self
    }

    pub fn with_actions(mut self) -> Self {
        self.with_actions = true;
        self
    }

    pub fn set_issues(&self, issues: Vec<Issue>) {
        if let Ok(mut guard) = self.issues.lock() {
            *guard = issues;
        }
    }

    /// Simulate an unset credential: unconfigured and fetches fail.
    pub fn set_credential_missing(&self, missing: bool) {
        if let Ok(mut c) = self.configured.lock() {
            *c = !missing;
        }
        if let Ok(mut f) = self.fail_with_missing_credential.lock() {
            *f = missing;
        }
    }

    pub fn recorded(&self) -> Vec<RecordedAction> {
        self.recorded.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn labels_for(&self, id: &str) -> Vec<&str> {
        self.issue_labels
            .iter()
            .filter(|(i, _)| i == id)
            .flat_map(|(_, ls)| ls.iter().map(String::as_str))
            .collect()
    }
}

#[async_trait::async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &'static str {
        "Static Issues"
    }

    fn source(&self) -> Source {
        self.source
    }

    fn is_configured(&self, _repo: &Path) -> bool {
        self.configured.lock().map(|c| *c).unwrap_or(false)
    }

    async fn fetch_issues(
        &self,
        _repo: &Path,
        filter: &FilterConfig,
    ) -> Result<Vec<Issue>, ProviderError> {
        if self.fail_with_missing_credential.lock().map(|f| *f).unwrap_or(false) {
            return Err(ProviderError::MissingCredential { var: "STATIC_TOKEN" });
        }
        let issues = self.issues.lock().map(|i| i.clone()).unwrap_or_default();
        Ok(issues
            .into_iter()
            .filter(|i| label_matches(&filter.label, self.labels_for(&i.id)))
            .collect())
    }

    fn generate_branch_name(&self, issue: &Issue) -> String {
        format!("issue-{}", issue.id)
    }

    fn pr_link_text(&self, _issue: &Issue) -> String {
        String::new()
    }

    fn actions(&self) -> Option<&dyn ProviderActions> {
        if self.with_actions {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl ProviderActions for StaticProvider {
    async fn remove_label(
        &self,
        _repo: &Path,
        issue_id: &str,
        label: &str,
    ) -> Result<(), ProviderError> {
        if let Ok(mut r) = self.recorded.lock() {
            r.push(RecordedAction::RemoveLabel {
                issue_id: issue_id.to_string(),
                label: label.to_string(),
            });
        }
        Ok(())
    }

    async fn comment(&self, _repo: &Path, issue_id: &str, body: &str) -> Result<(), ProviderError> {
        if let Ok(mut r) = self.recorded.lock() {
            r.push(RecordedAction::Comment {
                issue_id: issue_id.to_string(),
                body: body.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: &str) -> Issue {
        Issue {
            id: id.into(),
            title: format!("Issue {id}"),
            body: String::new(),
            url: String::new(),
            source: Source::Github,
        }
    }

    #[test]
    fn label_match_is_case_insensitive_exact() {
        assert!(label_matches("queued", ["Queued"]));
        assert!(label_matches("", Vec::<&str>::new()));
        assert!(!label_matches("queued", ["queued-later"]));
        assert!(!label_matches("queued", Vec::<&str>::new()));
    }

    #[test]
    fn source_parses_and_displays() {
        assert_eq!("GitHub".parse::<Source>().unwrap(), Source::Github);
        assert_eq!(Source::Linear.to_string(), "linear");
        assert!("jira".parse::<Source>().is_err());
    }

    #[tokio::test]
    async fn static_provider_filters_by_label() {
        let p = StaticProvider::new(Source::Github, vec![issue("1"), issue("2")])
            .with_labels("1", &["Queued"]);
        let repo = Path::new("/repo");

        let all = p.fetch_issues(repo, &FilterConfig::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let filter = FilterConfig {
            label: "queued".into(),
            ..Default::default()
        };
        let queued = p.fetch_issues(repo, &filter).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, "1");
    }

    #[tokio::test]
    async fn actions_are_a_capability_query() {
        let plain = StaticProvider::new(Source::Asana, vec![]);
        assert!(plain.actions().is_none());

        let capable = StaticProvider::new(Source::Asana, vec![]).with_actions();
        let actions = capable.actions().unwrap();
        actions.comment(Path::new("."), "7", "hi").await.unwrap();
        assert_eq!(
            capable.recorded(),
            vec![RecordedAction::Comment {
                issue_id: "7".into(),
                body: "hi".into()
            }]
        );
    }

    #[tokio::test]
    async fn missing_credential_surfaces() {
        let p = StaticProvider::new(Source::Linear, vec![issue("1")]);
        p.set_credential_missing(true);
        assert!(!p.is_configured(Path::new(".")));
        let err = p
            .fetch_issues(Path::new("."), &FilterConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_missing_credential());
    }
}
