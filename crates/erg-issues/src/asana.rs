use crate::branch::slug_branch;
use crate::error::ProviderError;
use crate::provider::{
    label_matches, FilterConfig, Issue, Provider, ProviderActions, RepoSettings, Source,
};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const API_BASE: &str = "https://app.asana.com/api/1.0";
pub const PAT_ENV: &str = "ASANA_PAT";
const PROVIDER: &str = "Asana";

/// Asana Tasks over the REST API, authenticated with a personal access token.
pub struct AsanaProvider {
    settings: Arc<dyn RepoSettings>,
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskTag {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct Task {
    gid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    permalink_url: String,
    #[serde(default)]
    tags: Vec<TaskTag>,
}

#[derive(Debug, Deserialize)]
struct DataList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Gid {
    #[serde(default)]
    gid: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct TaskWorkspace {
    data: TaskWorkspaceData,
}

#[derive(Debug, Deserialize)]
struct TaskWorkspaceData {
    workspace: Gid,
}

/// Keep tasks carrying `label` (case-insensitive) and map them to issues.
fn tasks_to_issues(tasks: Vec<Task>, label: &str) -> Vec<Issue> {
    tasks
        .into_iter()
        .filter(|t| label_matches(label, t.tags.iter().map(|tag| tag.name.as_str())))
        .map(|t| Issue {
            id: t.gid,
            title: t.name,
            body: t.notes,
            url: t.permalink_url,
            source: Source::Asana,
        })
        .collect()
}

impl AsanaProvider {
    pub fn new(settings: Arc<dyn RepoSettings>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            settings,
            client,
            api_base: API_BASE.to_string(),
            token: None,
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Use a fixed token instead of reading `ASANA_PAT`.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn pat(&self) -> Result<String, ProviderError> {
        self.token
            .clone()
            .or_else(|| std::env::var(PAT_ENV).ok())
            .filter(|t| !t.is_empty())
            .ok_or(ProviderError::MissingCredential { var: PAT_ENV })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        pat: &str,
        url: &str,
        hint_403: &str,
    ) -> Result<T, ProviderError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(pat)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|source| ProviderError::Http {
                provider: PROVIDER,
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            let hint = if status == reqwest::StatusCode::FORBIDDEN {
                hint_403.to_string()
            } else {
                String::new()
            };
            return Err(ProviderError::Status {
                provider: PROVIDER,
                status: status.as_u16(),
                hint,
            });
        }
        resp.json::<T>().await.map_err(|e| ProviderError::Parse {
            provider: PROVIDER,
            detail: e.to_string(),
        })
    }

    async fn post_json(
        &self,
        pat: &str,
        url: &str,
        body: serde_json::Value,
        expect: reqwest::StatusCode,
    ) -> Result<(), ProviderError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(pat)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Http {
                provider: PROVIDER,
                source,
            })?;
        if resp.status() != expect {
            return Err(ProviderError::Status {
                provider: PROVIDER,
                status: resp.status().as_u16(),
                hint: String::new(),
            });
        }
        Ok(())
    }

    /// Resolve a tag name to its GID in the task's workspace.
    async fn find_tag_gid(&self, pat: &str, task_gid: &str, tag: &str) -> Result<String, ProviderError> {
        let url = format!("{}/tasks/{task_gid}?opt_fields=workspace.gid", self.api_base);
        let task: TaskWorkspace = self.get_json(pat, &url, "").await?;
        let ws = task.data.workspace.gid;
        if ws.is_empty() {
            return Err(ProviderError::NotFound(format!(
                "could not determine workspace for task {task_gid}"
            )));
        }

        let url = format!("{}/workspaces/{ws}/tags?opt_fields=gid,name", self.api_base);
        let tags: DataList<Gid> = self.get_json(pat, &url, "").await?;
        tags.data
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(tag))
            .map(|t| t.gid)
            .ok_or_else(|| ProviderError::NotFound(format!("tag {tag:?} not found in workspace")))
    }
}

#[async_trait::async_trait]
impl Provider for AsanaProvider {
    fn name(&self) -> &'static str {
        "Asana Tasks"
    }

    fn source(&self) -> Source {
        Source::Asana
    }

    fn is_configured(&self, repo: &Path) -> bool {
        self.pat().is_ok() && self.settings.asana_project(repo).is_some()
    }

    async fn fetch_issues(
        &self,
        _repo: &Path,
        filter: &FilterConfig,
    ) -> Result<Vec<Issue>, ProviderError> {
        let pat = self.pat()?;
        if filter.project.is_empty() {
            return Err(ProviderError::NotConfigured {
                provider: PROVIDER,
                detail: "Asana project GID not set".into(),
            });
        }
        let url = format!(
            "{}/projects/{}/tasks?opt_fields=gid,name,notes,permalink_url,tags.name&completed_since=now",
            self.api_base, filter.project
        );
        let tasks: DataList<Task> = self
            .get_json(
                &pat,
                &url,
                " - check that your ASANA_PAT has access to this project",
            )
            .await?;
        Ok(tasks_to_issues(tasks.data, &filter.label))
    }

    fn generate_branch_name(&self, issue: &Issue) -> String {
        slug_branch("task", &issue.title, &issue.id)
    }

    fn pr_link_text(&self, _issue: &Issue) -> String {
        String::new()
    }

    fn actions(&self) -> Option<&dyn ProviderActions> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl ProviderActions for AsanaProvider {
    async fn remove_label(
        &self,
        _repo: &Path,
        issue_id: &str,
        label: &str,
    ) -> Result<(), ProviderError> {
        let pat = self.pat()?;
        let tag_gid = self.find_tag_gid(&pat, issue_id, label).await?;
        let url = format!("{}/tasks/{issue_id}/removeTag", self.api_base);
        self.post_json(&pat, &url, json!({ "data": { "tag": tag_gid } }), reqwest::StatusCode::OK)
            .await
    }

    async fn comment(&self, _repo: &Path, issue_id: &str, body: &str) -> Result<(), ProviderError> {
        let pat = self.pat()?;
        let url = format!("{}/tasks/{issue_id}/stories", self.api_base);
        self.post_json(&pat, &url, json!({ "data": { "text": body } }), reqwest::StatusCode::CREATED)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Settings(Option<String>);

    impl RepoSettings for Settings {
        fn asana_project(&self, _repo: &Path) -> Option<String> {
            self.0.clone()
        }
        fn linear_team(&self, _repo: &Path) -> Option<String> {
            None
        }
    }

    fn provider(project: Option<&str>) -> AsanaProvider {
        AsanaProvider::new(
            Arc::new(Settings(project.map(String::from))),
            Duration::from_secs(30),
        )
    }

    fn issue(id: &str, title: &str) -> Issue {
        Issue {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            url: String::new(),
            source: Source::Asana,
        }
    }

    #[test]
    fn tag_filter_is_case_insensitive() {
        let raw = r#"{"data": [
            {"gid": "1", "name": "A", "notes": "n", "permalink_url": "u", "tags": [{"name": "Queued"}]},
            {"gid": "2", "name": "B", "tags": [{"name": "later"}]},
            {"gid": "3", "name": "C"}
        ]}"#;
        let list: DataList<Task> = serde_json::from_str(raw).unwrap();
        let issues = tasks_to_issues(list.data, "queued");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, "1");
        assert_eq!(issues[0].source, Source::Asana);

        let list: DataList<Task> = serde_json::from_str(raw).unwrap();
        assert_eq!(tasks_to_issues(list.data, "").len(), 3);
    }

    #[test]
    fn branch_name_slugged_with_fallback() {
        let p = provider(None);
        assert_eq!(
            p.generate_branch_name(&issue("1", "Fix the Login Page!")),
            "task-fix-the-login-page"
        );
        assert_eq!(p.generate_branch_name(&issue("1203", "???")), "task-1203");
        let long = p.generate_branch_name(&issue(
            "9",
            "This is a rather long task name that keeps on going - forever",
        ));
        assert!(!long.ends_with('-'));
        assert!(long.len() <= "task-".len() + 40);
        assert_eq!(p.pr_link_text(&issue("1", "x")), "");
    }

    #[test]
    fn configured_needs_token_and_project() {
        let with_token = provider(Some("123")).with_token("tok");
        assert!(with_token.is_configured(Path::new("/repo")));
        let no_project = provider(None).with_token("tok");
        assert!(!no_project.is_configured(Path::new("/repo")));
        let empty_token = provider(Some("123")).with_token("");
        assert!(!empty_token.is_configured(Path::new("/repo")));
    }

    #[tokio::test]
    async fn fetch_without_project_is_not_configured() {
        let p = provider(None).with_token("tok");
        let err = p
            .fetch_issues(Path::new("/repo"), &FilterConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn unreachable_api_is_http_error() {
        let p = provider(Some("123"))
            .with_token("tok")
            .with_api_base("http://127.0.0.1:9");
        let filter = FilterConfig {
            project: "123".into(),
            ..Default::default()
        };
        let err = p.fetch_issues(Path::new("/repo"), &filter).await.unwrap_err();
        assert!(matches!(err, ProviderError::Http { .. }));
    }
}
