use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A workflow file as written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_name")]
    pub workflow: String,
    /// Initial state.
    #[serde(default)]
    pub start: String,
    /// Where new sessions come from.
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub states: BTreeMap<String, StateConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub provider: String,
    #[serde(default)]
    pub filter: SourceFilter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceFilter {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub team: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// Runs an `action`.
    Task,
    /// Polls an `event` until it resolves.
    Wait,
    /// Branches on session data.
    Choice,
    /// No-op; goes straight to `next`.
    Pass,
    Succeed,
    Fail,
}

impl StateKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StateKind::Succeed | StateKind::Fail)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(rename = "type")]
    pub kind: StateKind,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    /// Free-form arguments for the action or event handler.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, with = "crate::duration::opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub timeout_next: Option<String>,
    #[serde(default)]
    pub before: Vec<HookConfig>,
    #[serde(default)]
    pub after: Vec<HookConfig>,
    #[serde(default)]
    pub choices: Vec<ChoiceRule>,
    #[serde(default)]
    pub default: Option<String>,
}

impl StateConfig {
    pub fn new(kind: StateKind) -> Self {
        Self {
            kind,
            action: None,
            event: None,
            params: BTreeMap::new(),
            next: None,
            error: None,
            timeout: None,
            timeout_next: None,
            before: Vec::new(),
            after: Vec::new(),
            choices: Vec::new(),
            default: None,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// An external command run before or after a state's action.
///
/// In YAML a hook is either a bare string (`- make lint`) or a mapping
/// (`- { run: make lint, timeout_sec: 60 }`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookConfig {
    pub run: String,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

/// `variable == equals` routes to `next`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChoiceRule {
    pub variable: String,
    pub equals: String,
    pub next: String,
}

impl ChoiceRule {
    pub fn label(&self) -> String {
        format!("{} == {}", self.variable, self.equals)
    }
}

fn default_name() -> String {
    "default".into()
}
