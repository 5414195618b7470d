use crate::error::ProviderError;
use crate::provider::{FilterConfig, Issue, Provider, ProviderActions, RepoSettings, Source};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const API_BASE: &str = "https://api.linear.app";
pub const API_KEY_ENV: &str = "LINEAR_API_KEY";
const PROVIDER: &str = "Linear";

const ISSUE_FIELDS: &str = "nodes { id identifier title description url labels { nodes { name } } }";

/// Linear Issues over the GraphQL API.
pub struct LinearProvider {
    settings: Arc<dyn RepoSettings>,
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GqlError>,
}

#[derive(Debug, Deserialize)]
struct GqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct LabelNode {
    #[serde(default)]
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct IssueNode {
    identifier: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: String,
    labels: Option<Nodes<LabelNode>>,
}

#[derive(Debug, Deserialize)]
struct TeamIssues {
    team: Option<TeamNode>,
}

#[derive(Debug, Deserialize)]
struct TeamNode {
    issues: Nodes<IssueNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueLabels {
    issue_labels: Nodes<LabelNode>,
}

/// Build the team-issues query. Completed and canceled issues are excluded
/// server-side; the label filter is applied server-side when present.
fn issues_query(with_label: bool) -> String {
    if with_label {
        format!(
            "query($teamId: String!, $label: String!) {{ team(id: $teamId) {{ issues(filter: {{ \
             state: {{ type: {{ nin: [\"completed\", \"canceled\"] }} }} \
             labels: {{ name: {{ eqIgnoreCase: $label }} }} }}) {{ {ISSUE_FIELDS} }} }} }}"
        )
    } else {
        format!(
            "query($teamId: String!) {{ team(id: $teamId) {{ issues(filter: {{ \
             state: {{ type: {{ nin: [\"completed\", \"canceled\"] }} }} }}) {{ {ISSUE_FIELDS} }} }} }}"
        )
    }
}

fn nodes_to_issues(nodes: Vec<IssueNode>, label: &str) -> Vec<Issue> {
    nodes
        .into_iter()
        .filter(|n| {
            // Older responses omit labels; trust the server filter then.
            label.is_empty()
                || n.labels
                    .as_ref()
                    .map(|ls| ls.nodes.iter().any(|l| l.name.eq_ignore_ascii_case(label)))
                    .unwrap_or(true)
        })
        .map(|n| Issue {
            id: n.identifier,
            title: n.title,
            body: n.description.unwrap_or_default(),
            url: n.url,
            source: Source::Linear,
        })
        .collect()
}

impl LinearProvider {
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

    /// Use a fixed key instead of reading `LINEAR_API_KEY`.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        self.token
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|t| !t.is_empty())
            .ok_or(ProviderError::MissingCredential { var: API_KEY_ENV })
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        key: &str,
        query: &str,
        variables: Value,
    ) -> Result<T, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/graphql", self.api_base))
            .header("Authorization", key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|source| ProviderError::Http {
                provider: PROVIDER,
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let hint = if status == reqwest::StatusCode::FORBIDDEN {
                " - check that your LINEAR_API_KEY has access to this team".to_string()
            } else {
                String::new()
            };
            return Err(ProviderError::Status {
                provider: PROVIDER,
                status: status.as_u16(),
                hint,
            });
        }

        let env: Envelope<T> = resp.json().await.map_err(|e| ProviderError::Parse {
            provider: PROVIDER,
            detail: e.to_string(),
        })?;
        decode_envelope(env)
    }
}

fn decode_envelope<T>(env: Envelope<T>) -> Result<T, ProviderError> {
    if let Some(first) = env.errors.first() {
        return Err(ProviderError::Parse {
            provider: PROVIDER,
            detail: first.message.clone(),
        });
    }
    env.data.ok_or_else(|| ProviderError::Parse {
        provider: PROVIDER,
        detail: "response has no data".into(),
    })
}

#[async_trait::async_trait]
impl Provider for LinearProvider {
    fn name(&self) -> &'static str {
        "Linear Issues"
    }

    fn source(&self) -> Source {
        Source::Linear
    }

    fn is_configured(&self, repo: &Path) -> bool {
        self.api_key().is_ok() && self.settings.linear_team(repo).is_some()
    }

    async fn fetch_issues(
        &self,
        _repo: &Path,
        filter: &FilterConfig,
    ) -> Result<Vec<Issue>, ProviderError> {
        let key = self.api_key()?;
        if filter.team.is_empty() {
            return Err(ProviderError::NotConfigured {
                provider: PROVIDER,
                detail: "Linear team ID not set".into(),
            });
        }
        let with_label = !filter.label.is_empty();
        let mut vars = json!({ "teamId": filter.team });
        if with_label {
            vars["label"] = json!(filter.label);
        }
        let data: TeamIssues = self.graphql(&key, &issues_query(with_label), vars).await?;
        let nodes = data.team.map(|t| t.issues.nodes).unwrap_or_default();
        Ok(nodes_to_issues(nodes, &filter.label))
    }

    fn generate_branch_name(&self, issue: &Issue) -> String {
        format!("linear-{}", issue.id.to_lowercase())
    }

    fn pr_link_text(&self, issue: &Issue) -> String {
        format!("Fixes {}", issue.id)
    }

    fn actions(&self) -> Option<&dyn ProviderActions> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl ProviderActions for LinearProvider {
    async fn remove_label(
        &self,
        _repo: &Path,
        issue_id: &str,
        label: &str,
    ) -> Result<(), ProviderError> {
        let key = self.api_key()?;
        let found: IssueLabels = self
            .graphql(
                &key,
                "query($label: String!) { issueLabels(filter: { name: { eqIgnoreCase: $label } }) { nodes { id name } } }",
                json!({ "label": label }),
            )
            .await?;
        let label_id = found
            .issue_labels
            .nodes
            .into_iter()
            .next()
            .map(|l| l.id)
            .ok_or_else(|| ProviderError::NotFound(format!("label {label:?} not found in Linear")))?;

        let _: Value = self
            .graphql(
                &key,
                "mutation($issueId: String!, $labelId: String!) { issueLabelDisconnect(id: $issueId, labelId: $labelId) { success } }",
                json!({ "issueId": issue_id, "labelId": label_id }),
            )
            .await?;
        Ok(())
    }

    async fn comment(&self, _repo: &Path, issue_id: &str, body: &str) -> Result<(), ProviderError> {
        let key = self.api_key()?;
        let _: Value = self
            .graphql(
                &key,
                "mutation($issueId: String!, $body: String!) { commentCreate(input: { issueId: $issueId, body: $body }) { success } }",
                json!({ "issueId": issue_id, "body": body }),
            )
            .await?;
        Ok(())
    }
}
