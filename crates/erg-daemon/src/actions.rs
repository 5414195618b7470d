//! Task actions and wait events, dispatched by name.

use crate::host::Host;
use crate::merge::{self, MergeAction};
use crate::runner::RunRequest;
use crate::session::Session;
use erg_issues::Source;
use erg_workflow::{ConfigError, StateConfig, StateKind, WorkflowGraph};
use tracing::{info, warn};

pub const KNOWN_ACTIONS: &[&str] = &[
    "ai.code",
    "github.create_pr",
    "github.merge",
    "issue.comment",
    "issue.remove_label",
    "session.spawn",
];

pub const KNOWN_EVENTS: &[&str] = &["pr.reviewed", "ci.complete"];

/// What one action or event poll asks the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Stay in the state and poll again.
    Continue,
    /// Take the error edge.
    Stop(String),
    /// Take the success edge.
    Proceed,
}

impl ActionOutcome {
    fn from_merge(action: MergeAction, stop_reason: &str) -> Self {
        match action {
            MergeAction::Continue => ActionOutcome::Continue,
            MergeAction::Stop => ActionOutcome::Stop(stop_reason.to_string()),
            MergeAction::Proceed => ActionOutcome::Proceed,
        }
    }
}

/// Reject action and event names nothing handles, and parameters they need.
pub fn validate_graph(graph: &WorkflowGraph) -> Result<(), ConfigError> {
    if let Some(source) = graph.source() {
        if source.provider.parse::<Source>().is_err() {
            return Err(ConfigError::UnknownProvider(source.provider.clone()));
        }
    }
    for name in graph.state_names() {
        let Some(state) = graph.state(name) else {
            continue;
        };
        if let Some(action) = state.action.as_deref() {
            if !KNOWN_ACTIONS.contains(&action) {
                return Err(invalid(name, format!("unknown action `{action}`")));
            }
            let required = match action {
                "issue.comment" => Some("body"),
                "issue.remove_label" => Some("label"),
                "session.spawn" => Some("task"),
                _ => None,
            };
            if let Some(param) = required {
                if state.param_str(param).map_or(true, str::is_empty) {
                    return Err(invalid(name, format!("`{action}` needs a `{param}` param")));
                }
            }
            if action == "github.merge" {
                let next = state.next.as_deref().unwrap_or_default();
                let merged_into_terminal = graph
                    .state(next)
                    .is_some_and(|s| s.kind == StateKind::Succeed);
                if !merged_into_terminal {
                    return Err(invalid(name, "`github.merge` must lead to a succeed state".into()));
                }
            }
        }
        if let Some(event) = state.event.as_deref() {
            if !KNOWN_EVENTS.contains(&event) {
                return Err(invalid(name, format!("unknown event `{event}`")));
            }
        }
    }
    Ok(())
}

fn invalid(state: &str, detail: String) -> ConfigError {
    ConfigError::Invalid {
        state: state.to_string(),
        detail,
    }
}

/// Run a task state's action once.
pub async fn run_action(host: &dyn Host, state: &StateConfig, session: &mut Session) -> ActionOutcome {
    let attempt = session.attempts + 1;
    match state.action.as_deref() {
        Some("ai.code") => ai_code(host, session).await,
        Some("github.create_pr") => create_pr(host, session).await,
        Some("github.merge") => github_merge(host, session, attempt).await,
        Some("issue.comment") => issue_comment(host, state, session).await,
        Some("issue.remove_label") => issue_remove_label(host, state, session).await,
        Some("session.spawn") => spawn_child(host, state, session).await,
        Some(other) => ActionOutcome::Stop(format!("unknown action `{other}`")),
        None => ActionOutcome::Proceed,
    }
}

/// Poll a wait state's event once.
pub async fn poll_event(host: &dyn Host, state: &StateConfig, session: &mut Session) -> ActionOutcome {
    let attempt = session.attempts + 1;
    match state.event.as_deref() {
        Some("pr.reviewed") => pr_reviewed(host, session, attempt).await,
        Some("ci.complete") => ci_complete(host, session).await,
        Some(other) => ActionOutcome::Stop(format!("unknown event `{other}`")),
        None => ActionOutcome::Proceed,
    }
}

// ── Actions ──

async fn ai_code(host: &dyn Host, session: &mut Session) -> ActionOutcome {
    let settings = host.settings();
    let mut prompt = session.prompt();
    if let Some(message) = host.take_pending_message(&session.id) {
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str(&message);
    }
    if prompt.trim().is_empty() {
        return ActionOutcome::Stop("nothing to work on: session has no issue or task".into());
    }

    let req = RunRequest {
        session_id: session.id.clone(),
        cwd: session.work_dir().to_path_buf(),
        prompt,
        max_turns: settings.max_turns,
        max_duration: settings.max_duration,
    };
    let outcome = match host.runner().run(&req).await {
        Ok(o) => o,
        Err(e) => return ActionOutcome::Stop(format!("agent failed to start: {e}")),
    };

    host.record_spend(outcome.cost_usd, outcome.output_tokens, outcome.input_tokens);
    session.cost_usd += outcome.cost_usd;
    if let Err(e) = host.save_runner_messages(&session.id, &outcome.transcript) {
        warn!(session = %session.id, error = %e, "saving transcript failed");
    }

    if outcome.success {
        info!(session = %session.id, cost_usd = outcome.cost_usd, "agent finished");
        ActionOutcome::Proceed
    } else {
        ActionOutcome::Stop(outcome.error.unwrap_or_else(|| "agent failed".into()))
    }
}

async fn create_pr(host: &dyn Host, session: &mut Session) -> ActionOutcome {
    if session.pr_url.is_some() {
        return ActionOutcome::Proceed;
    }
    let title = match (&session.issue, &session.task) {
        (Some(issue), _) => issue.title.clone(),
        (None, Some(task)) => task.lines().next().unwrap_or_default().to_string(),
        (None, None) => session.branch.clone(),
    };
    let mut body = String::new();
    if let Some(issue) = &session.issue {
        if let Some(provider) = host.provider(issue.source) {
            body = provider.pr_link_text(issue);
        }
        if !issue.url.is_empty() {
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(&issue.url);
        }
    }

    match host
        .git()
        .create_pr(session.work_dir(), &session.branch, &title, &body)
        .await
    {
        Ok(url) => {
            info!(session = %session.id, url = %url, "PR opened");
            session.pr_url = Some(url);
            ActionOutcome::Proceed
        }
        Err(e) => ActionOutcome::Stop(format!("creating PR: {e}")),
    }
}

async fn github_merge(host: &dyn Host, session: &mut Session, attempt: u32) -> ActionOutcome {
    if session.pr_merged {
        return ActionOutcome::Proceed;
    }
    // A merge that landed before the flag was persisted must not be retried.
    let state = host.git().pr_state(session.work_dir(), &session.branch).await;
    match state {
        Ok(crate::git::PrState::Merged) => {
            info!(session = %session.id, "PR already merged");
            session.pr_merged = true;
            return ActionOutcome::Proceed;
        }
        Ok(crate::git::PrState::Closed) => return ActionOutcome::Stop("PR closed without merging".into()),
        Ok(crate::git::PrState::Open) | Err(_) => {}
    }
    if host.settings().auto_merge {
        let action = merge::check_ci_and_merge(host, session, attempt).await;
        return ActionOutcome::from_merge(action, "CI failed or merge was rejected");
    }
    if let Err(e) = state {
        tracing::debug!(session = %session.id, error = %e, "PR state unavailable");
    }
    ActionOutcome::Continue
}

async fn issue_comment(host: &dyn Host, state: &StateConfig, session: &mut Session) -> ActionOutcome {
    let body = state.param_str("body").unwrap_or_default();
    let Some(issue) = &session.issue else {
        return ActionOutcome::Proceed;
    };
    let Some(provider) = host.provider(issue.source) else {
        return ActionOutcome::Proceed;
    };
    let Some(actions) = provider.actions() else {
        tracing::debug!(provider = provider.name(), "provider cannot comment, skipping");
        return ActionOutcome::Proceed;
    };
    match actions.comment(&session.repo_path, &issue.id, body).await {
        Ok(()) => ActionOutcome::Proceed,
        Err(e) => ActionOutcome::Stop(format!("commenting on issue {}: {e}", issue.id)),
    }
}

async fn issue_remove_label(host: &dyn Host, state: &StateConfig, session: &mut Session) -> ActionOutcome {
    let label = state.param_str("label").unwrap_or_default();
    let Some(issue) = &session.issue else {
        return ActionOutcome::Proceed;
    };
    let Some(provider) = host.provider(issue.source) else {
        return ActionOutcome::Proceed;
    };
    let Some(actions) = provider.actions() else {
        tracing::debug!(provider = provider.name(), "provider cannot edit labels, skipping");
        return ActionOutcome::Proceed;
    };
    match actions.remove_label(&session.repo_path, &issue.id, label).await {
        Ok(()) => ActionOutcome::Proceed,
        Err(e) => ActionOutcome::Stop(format!("removing label {label} from {}: {e}", issue.id)),
    }
}

async fn spawn_child(host: &dyn Host, state: &StateConfig, session: &mut Session) -> ActionOutcome {
    let task = state.param_str("task").unwrap_or_default();
    match host.create_child_session(&session.id, task).await {
        Ok(child) => {
            info!(session = %session.id, child = %child.id, branch = %child.branch, "child session created");
            session.data.insert("child_session".into(), child.id);
            ActionOutcome::Proceed
        }
        Err(e) => ActionOutcome::Stop(format!("creating child session: {e}")),
    }
}

// ── Events ──

async fn pr_reviewed(host: &dyn Host, session: &mut Session, attempt: u32) -> ActionOutcome {
    if host.settings().auto_address_pr_comments {
        match merge::check_and_address_comments(host, session, attempt).await {
            MergeAction::Proceed => {}
            other => return ActionOutcome::from_merge(other, "addressing review comments failed"),
        }
    }
    let action = merge::check_review_approval(host, session, attempt).await;
    ActionOutcome::from_merge(action, "PR was not approved in time")
}

async fn ci_complete(host: &dyn Host, session: &mut Session) -> ActionOutcome {
    use crate::git::CiStatus;

    let status = host.git().ci_status(session.work_dir(), &session.branch).await;
    let recorded = match status {
        CiStatus::Pending => return ActionOutcome::Continue,
        CiStatus::Unknown => {
            warn!(session = %session.id, "CI status unreadable, treating as passing");
            CiStatus::Passing
        }
        other => other,
    };
    session.data.insert("ci_status".into(), recorded.as_str().to_string());
    ActionOutcome::Proceed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testutil::{test_daemon, test_daemon_with};
    use crate::runner::RunOutcome;
    use erg_core::{MockExecutor, MockResponse};
    use erg_issues::{Issue, RecordedAction, Source, StaticProvider};
    use erg_workflow::{default_graph, parse_workflow};
    use std::path::Path;
    use std::sync::Arc;

    fn issue() -> Issue {
        Issue {
            id: "42".into(),
            title: "Fix flaky test".into(),
            body: "It fails on Tuesdays.".into(),
            url: "https://github.com/o/r/issues/42".into(),
            source: Source::Github,
        }
    }

    fn session(id: &str) -> Session {
        Session::new(id, Path::new("/test/repo"), "issue-42", "coding").with_issue(issue())
    }

    fn task(action: &str) -> StateConfig {
        let mut s = StateConfig::new(StateKind::Task);
        s.action = Some(action.into());
        s.next = Some("done".into());
        s
    }

    #[test]
    fn default_graph_passes_validation() {
        validate_graph(&default_graph().unwrap()).unwrap();
    }

    #[test]
    fn unknown_names_rejected() {
        let yaml = "start: a\nstates:\n  a: { type: task, action: ai.dance, next: b }\n  b: { type: succeed }\n  failed: { type: fail }\n";
        let err = validate_graph(&parse_workflow(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("ai.dance"));

        let yaml = "start: a\nstates:\n  a: { type: wait, event: pr.opened, next: b }\n  b: { type: succeed }\n  failed: { type: fail }\n";
        assert!(validate_graph(&parse_workflow(yaml).unwrap()).is_err());
    }

    #[test]
    fn unknown_source_provider_rejected() {
        let yaml = "start: a\nsource:\n  provider: jira\nstates:\n  a: { type: task, action: ai.code, next: b }\n  b: { type: succeed }\n  failed: { type: fail }\n";
        let err = validate_graph(&parse_workflow(yaml).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(p) if p == "jira"));
    }

    #[test]
    fn merge_must_end_in_success() {
        let yaml = "start: m\nstates:\n  m: { type: task, action: github.merge, next: p }\n  p: { type: pass, next: done }\n  done: { type: succeed }\n  failed: { type: fail }\n";
        assert!(validate_graph(&parse_workflow(yaml).unwrap()).is_err());
    }

    #[test]
    fn missing_params_rejected() {
        let yaml = "start: a\nstates:\n  a: { type: task, action: issue.remove_label, next: b }\n  b: { type: succeed }\n  failed: { type: fail }\n";
        let err = validate_graph(&parse_workflow(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("label"));
    }

    #[tokio::test]
    async fn ai_code_consumes_pending_message_and_records_spend() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        let mut s = session("a1");
        daemon.pending().set("a1", "Also update the changelog.");
        let out = run_action(daemon.as_ref(), &task("ai.code"), &mut s).await;
        assert_eq!(out, ActionOutcome::Proceed);
        let req = &runner.requests()[0];
        assert!(req.prompt.starts_with("Fix flaky test"));
        assert!(req.prompt.ends_with("Also update the changelog."));
        assert!(daemon.pending().take("a1").is_none());
        assert!((s.cost_usd - 0.10).abs() < 1e-9);
        assert!((daemon.spend().snapshot().cost_usd - 0.10).abs() < 1e-9);
        assert!(daemon.paths().transcripts_dir().join("a1.jsonl").exists());
    }

    #[tokio::test]
    async fn ai_code_failure_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        runner.push("a2", RunOutcome::failed("max turns"));
        let mut s = session("a2");
        assert_eq!(
            run_action(daemon.as_ref(), &task("ai.code"), &mut s).await,
            ActionOutcome::Stop("max turns".into())
        );
    }

    #[tokio::test]
    async fn create_pr_embeds_link_text_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.add_prefix("gh", &["pr", "create"], MockResponse::stdout("https://github.com/o/r/pull/7\n"));
        let (daemon, _runner) = test_daemon(dir.path(), exec.clone());
        let mut s = session("p1");
        assert_eq!(
            run_action(daemon.as_ref(), &task("github.create_pr"), &mut s).await,
            ActionOutcome::Proceed
        );
        assert_eq!(s.pr_url.as_deref(), Some("https://github.com/o/r/pull/7"));
        let calls = exec.calls();
        let create = calls.iter().find(|c| c.args.get(1).map(String::as_str) == Some("create")).unwrap();
        let body_at = create.args.iter().position(|a| a == "--body").unwrap();
        assert!(create.args[body_at + 1].starts_with("Fixes #42"));

        let before = exec.calls().len();
        run_action(daemon.as_ref(), &task("github.create_pr"), &mut s).await;
        assert_eq!(exec.calls().len(), before);
    }

    #[tokio::test]
    async fn merge_without_auto_merge_waits_for_external_merge() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.add_prefix("gh", &["pr", "view"], MockResponse::stdout(r#"{"state":"OPEN"}"#));
        let (daemon, _runner) = test_daemon_with(dir.path(), exec, |cfg| cfg.auto_merge = false);
        let mut s = session("g1");
        assert_eq!(
            run_action(daemon.as_ref(), &task("github.merge"), &mut s).await,
            ActionOutcome::Continue
        );
        assert!(!s.pr_merged);
    }

    #[tokio::test]
    async fn merge_that_already_landed_is_not_repeated() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.add_prefix("gh", &["pr", "view"], MockResponse::stdout(r#"{"state":"MERGED"}"#));
        exec.add_prefix("gh", &["pr", "checks"], MockResponse::stdout(r#"[{"state":"SUCCESS"}]"#));
        exec.add_prefix("gh", &["pr", "merge"], MockResponse::error("already merged"));
        let (daemon, _runner) = test_daemon(dir.path(), exec.clone());
        let mut s = session("g2");
        assert_eq!(
            run_action(daemon.as_ref(), &task("github.merge"), &mut s).await,
            ActionOutcome::Proceed
        );
        assert!(s.pr_merged);
        assert!(!exec
            .calls()
            .iter()
            .any(|c| c.args.get(1).map(String::as_str) == Some("merge")));
    }

    #[tokio::test]
    async fn issue_actions_use_capability_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StaticProvider::new(Source::Github, vec![]).with_actions());
        let (daemon, _runner) = crate::daemon::testutil::test_daemon_with_provider(
            dir.path(),
            Arc::new(MockExecutor::new()),
            provider.clone(),
        );
        let mut state = task("issue.remove_label");
        state.params.insert("label".into(), serde_json::json!("queued"));
        let mut s = session("i1");
        assert_eq!(run_action(daemon.as_ref(), &state, &mut s).await, ActionOutcome::Proceed);
        assert_eq!(
            provider.recorded(),
            vec![RecordedAction::RemoveLabel {
                issue_id: "42".into(),
                label: "queued".into()
            }]
        );
    }

    #[tokio::test]
    async fn issue_actions_noop_without_capability() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StaticProvider::new(Source::Github, vec![]));
        let (daemon, _runner) = crate::daemon::testutil::test_daemon_with_provider(
            dir.path(),
            Arc::new(MockExecutor::new()),
            provider.clone(),
        );
        let mut state = task("issue.comment");
        state.params.insert("body".into(), serde_json::json!("Picked up by erg"));
        let mut s = session("i2");
        assert_eq!(run_action(daemon.as_ref(), &state, &mut s).await, ActionOutcome::Proceed);
        assert!(provider.recorded().is_empty());
    }

    #[tokio::test]
    async fn ci_complete_records_status() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.add_prefix(
            "gh",
            &["pr", "checks"],
            MockResponse::error("exit status 1").with_stdout(r#"[{"state":"FAILURE"}]"#),
        );
        let (daemon, _runner) = test_daemon(dir.path(), exec);
        let mut wait = StateConfig::new(StateKind::Wait);
        wait.event = Some("ci.complete".into());
        let mut s = session("e1");
        assert_eq!(poll_event(daemon.as_ref(), &wait, &mut s).await, ActionOutcome::Proceed);
        assert_eq!(s.data.get("ci_status").map(String::as_str), Some("failing"));
    }

    #[tokio::test]
    async fn pr_reviewed_continues_until_approved() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        let mut wait = StateConfig::new(StateKind::Wait);
        wait.event = Some("pr.reviewed".into());
        let mut s = session("e2");
        assert_eq!(poll_event(daemon.as_ref(), &wait, &mut s).await, ActionOutcome::Continue);
        s.attempts = 119;
        assert!(matches!(
            poll_event(daemon.as_ref(), &wait, &mut s).await,
            ActionOutcome::Stop(_)
        ));
    }

    #[tokio::test]
    async fn spawn_creates_child_session() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        let parent = session("parent");
        daemon.store().save(&parent).unwrap();
        let mut state = task("session.spawn");
        state.params.insert("task".into(), serde_json::json!("write docs"));
        let mut s = parent.clone();
        assert_eq!(run_action(daemon.as_ref(), &state, &mut s).await, ActionOutcome::Proceed);
        let child_id = s.data.get("child_session").unwrap().clone();
        let child = daemon.store().load(&child_id).unwrap().unwrap();
        assert_eq!(child.parent_id.as_deref(), Some("parent"));
        assert_eq!(child.task.as_deref(), Some("write docs"));
        assert!(child.branch.starts_with("issue-42-child-"));
    }
}
