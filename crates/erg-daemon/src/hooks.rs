//! Before/after hooks: shell commands run around a state's action.

use async_trait::async_trait;
use erg_core::{mask_secrets, truncate_output};
use erg_workflow::HookConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

const MAX_OUTPUT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Success,
    /// Non-zero exit.
    Failure,
    /// Hook or caller deadline expired.
    Timeout,
    /// The process could not be started.
    Error,
}

#[derive(Debug, Clone)]
pub struct HookResult {
    pub outcome: HookOutcome,
    /// Masked, truncated stdout+stderr.
    pub output: String,
    pub error: Option<String>,
}

impl HookResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            outcome: HookOutcome::Success,
            output: output.into(),
            error: None,
        }
    }

    fn failed(outcome: HookOutcome, output: String, error: String) -> Self {
        Self {
            outcome,
            output,
            error: Some(error),
        }
    }
}

/// What a hook is told about the session it runs for.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub session_id: String,
    pub state: String,
    pub work_dir: PathBuf,
    pub branch: String,
    pub issue_id: Option<String>,
}

#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Run one hook. Must return by `deadline` when one is given.
    async fn run(&self, hook: &HookConfig, ctx: &HookContext, deadline: Option<Instant>) -> HookResult;
}

/// Runs hooks with `sh -c` in the session's working directory.
pub struct ShellHookRunner {
    default_timeout: Duration,
}

impl ShellHookRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    fn budget(&self, hook: &HookConfig, deadline: Option<Instant>) -> Duration {
        let own = hook
            .timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        match deadline {
            Some(d) => own.min(d.saturating_duration_since(Instant::now())),
            None => own,
        }
    }
}

#[async_trait]
impl HookRunner for ShellHookRunner {
    async fn run(&self, hook: &HookConfig, ctx: &HookContext, deadline: Option<Instant>) -> HookResult {
        let budget = self.budget(hook, deadline);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&hook.run)
            .current_dir(&ctx.work_dir)
            .env("ERG_SESSION_ID", &ctx.session_id)
            .env("ERG_STATE", &ctx.state)
            .env("ERG_BRANCH", &ctx.branch)
            .env("ERG_REPO_PATH", &ctx.work_dir)
            .env("ERG_ISSUE_ID", ctx.issue_id.as_deref().unwrap_or(""))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(budget, child).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let text = truncate_output(mask_secrets(&text).trim(), MAX_OUTPUT);
                if output.status.success() {
                    HookResult::success(text)
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    HookResult::failed(HookOutcome::Failure, text, format!("exit {code}: {}", hook.run))
                }
            }
            Ok(Err(e)) => HookResult::failed(
                HookOutcome::Error,
                String::new(),
                format!("spawn error: {e}"),
            ),
            Err(_) => HookResult::failed(
                HookOutcome::Timeout,
                String::new(),
                format!("hook timed out after {}s: {}", budget.as_secs(), hook.run),
            ),
        }
    }
}

/// Scripted hook runner for tests: outcome per command string, default
/// success. Records every command it is asked to run.
#[derive(Default)]
pub struct MockHookRunner {
    outcomes: Mutex<HashMap<String, HookOutcome>>,
    session_outcomes: Mutex<HashMap<String, HookOutcome>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockHookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, command: &str, outcome: HookOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command.to_string(), outcome);
    }

    /// Every hook run for `session_id` ends with `outcome`, whatever the command.
    pub fn set_session_outcome(&self, session_id: &str, outcome: HookOutcome) {
        self.session_outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), outcome);
    }

    /// `(state, command)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl HookRunner for MockHookRunner {
    async fn run(&self, hook: &HookConfig, ctx: &HookContext, _deadline: Option<Instant>) -> HookResult {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((ctx.state.clone(), hook.run.clone()));
        let by_session = self
            .session_outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ctx.session_id)
            .copied();
        let outcome = by_session
            .or_else(|| {
                self.outcomes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&hook.run)
                    .copied()
            })
            .unwrap_or(HookOutcome::Success);
        match outcome {
            HookOutcome::Success => HookResult::success(""),
            other => HookResult::failed(other, String::new(), format!("{other:?}: {}", hook.run)),
        }
    }
}
