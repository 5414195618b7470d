use crate::error::ProviderError;
use crate::provider::{label_matches, FilterConfig, Issue, Provider, ProviderActions, Source};
use erg_core::Executor;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// GitHub Issues through the `gh` CLI. Authentication is whatever `gh` has.
pub struct GitHubProvider {
    exec: Arc<dyn Executor>,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

/// Parse a GitHub issue number; zero when the ID is not numeric (issues from
/// other trackers).
pub fn issue_number(id: &str) -> u64 {
    id.trim().parse().unwrap_or(0)
}

fn require_number(id: &str) -> Result<u64, ProviderError> {
    match id.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ProviderError::InvalidId {
            id: id.to_string(),
            detail: "GitHub issue IDs must be numeric".into(),
        }),
    }
}

impl GitHubProvider {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }
}

#[async_trait::async_trait]
impl Provider for GitHubProvider {
    fn name(&self) -> &'static str {
        "GitHub Issues"
    }

    fn source(&self) -> Source {
        Source::Github
    }

    fn is_configured(&self, _repo: &Path) -> bool {
        true
    }

    async fn fetch_issues(
        &self,
        repo: &Path,
        filter: &FilterConfig,
    ) -> Result<Vec<Issue>, ProviderError> {
        let mut args = vec![
            "issue",
            "list",
            "--state",
            "open",
            "--limit",
            "100",
            "--json",
            "number,title,body,url,labels",
        ];
        if !filter.label.is_empty() {
            args.push("--label");
            args.push(filter.label.as_str());
        }
        let out = self.exec.run(repo, "gh", &args).await?;
        let raw = out.stdout_str();
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: Vec<GhIssue> =
            serde_json::from_str(&raw).map_err(|e| ProviderError::Parse {
                provider: "GitHub",
                detail: e.to_string(),
            })?;

        // gh matches labels server-side; the guard keeps the contract exact.
        Ok(parsed
            .into_iter()
            .filter(|i| label_matches(&filter.label, i.labels.iter().map(|l| l.name.as_str())))
            .map(|i| Issue {
                id: i.number.to_string(),
                title: i.title,
                body: i.body,
                url: i.url,
                source: Source::Github,
            })
            .collect())
    }

    fn generate_branch_name(&self, issue: &Issue) -> String {
        format!("issue-{}", issue.id)
    }

    fn pr_link_text(&self, issue: &Issue) -> String {
        format!("Fixes #{}", issue.id)
    }

    fn actions(&self) -> Option<&dyn ProviderActions> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl ProviderActions for GitHubProvider {
    async fn remove_label(
        &self,
        repo: &Path,
        issue_id: &str,
        label: &str,
    ) -> Result<(), ProviderError> {
        let n = require_number(issue_id)?.to_string();
        self.exec
            .run(repo, "gh", &["issue", "edit", n.as_str(), "--remove-label", label])
            .await?;
        Ok(())
    }

    async fn comment(&self, repo: &Path, issue_id: &str, body: &str) -> Result<(), ProviderError> {
        let n = require_number(issue_id)?.to_string();
        self.exec
            .run(repo, "gh", &["issue", "comment", n.as_str(), "--body", body])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erg_core::{MockExecutor, MockResponse};

    fn provider() -> (Arc<MockExecutor>, GitHubProvider) {
        let mock = Arc::new(MockExecutor::new());
        let p = GitHubProvider::new(mock.clone());
        (mock, p)
    }

    const LIST: &str = r#"[
        {"number": 42, "title": "Fix login", "body": "It breaks", "url": "https://github.com/o/r/issues/42", "labels": [{"name": "Queued"}]},
        {"number": 43, "title": "Other", "body": "", "url": "https://github.com/o/r/issues/43", "labels": []}
    ]"#;

    #[tokio::test]
    async fn fetch_parses_gh_output() {
        let (mock, p) = provider();
        mock.add_prefix("gh", &["issue", "list"], MockResponse::stdout(LIST));
        let issues = p
            .fetch_issues(Path::new("/repo"), &FilterConfig::default())
            .await
            .unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].id, "42");
        assert_eq!(issues[0].source, Source::Github);
        assert!(!mock.calls()[0].args.contains(&"--label".to_string()));
    }

    #[tokio::test]
    async fn label_filter_is_case_insensitive() {
        let (mock, p) = provider();
        mock.add_prefix("gh", &["issue", "list"], MockResponse::stdout(LIST));
        let filter = FilterConfig {
            label: "queued".into(),
            ..Default::default()
        };
        let issues = p.fetch_issues(Path::new("/repo"), &filter).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "Fix login");
        let calls = mock.calls();
        let args = &calls[0].args;
        assert_eq!(args[args.len() - 2..], ["--label".to_string(), "queued".to_string()]);
    }

    #[tokio::test]
    async fn fetch_error_propagates() {
        let (mock, p) = provider();
        mock.add_prefix("gh", &["issue", "list"], MockResponse::error("gh: not logged in"));
        let err = p
            .fetch_issues(Path::new("/repo"), &FilterConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not logged in"));
    }

    #[tokio::test]
    async fn remove_label_and_comment_use_gh() {
        let (mock, p) = provider();
        let actions = p.actions().unwrap();
        actions
            .remove_label(Path::new("/repo"), "42", "queued")
            .await
            .unwrap();
        actions.comment(Path::new("/repo"), "42", "hello").await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls[0].args, ["issue", "edit", "42", "--remove-label", "queued"]);
        assert_eq!(calls[1].args, ["issue", "comment", "42", "--body", "hello"]);
    }

    #[tokio::test]
    async fn non_numeric_id_rejected() {
        let (mock, p) = provider();
        let err = p
            .actions()
            .unwrap()
            .comment(Path::new("/repo"), "ENG-1", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidId { .. }));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn naming() {
        let (_, p) = provider();
        let issue = Issue {
            id: "7".into(),
            title: "t".into(),
            body: String::new(),
            url: String::new(),
            source: Source::Github,
        };
        assert_eq!(p.generate_branch_name(&issue), "issue-7");
        assert_eq!(p.pr_link_text(&issue), "Fixes #7");
        assert_eq!(issue_number("42"), 42);
        assert_eq!(issue_number("1203456789-abc"), 0);
    }
}
