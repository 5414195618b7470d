//! Advances one session by one step through the workflow graph.

use crate::actions::{self, ActionOutcome};
use crate::event_log::{Event, EventLog};
use crate::hooks::{HookContext, HookOutcome, HookRunner};
use crate::host::Host;
use crate::session::{ErrorInfo, ErrorKind, Session, SessionStatus};
use crate::store::SessionStore;
use erg_core::now_rfc3339;
use erg_workflow::{HookConfig, StateConfig, StateKind, WorkflowGraph};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Still in the same state (polling, or a retry).
    Stayed,
    Transitioned { from: String, to: String },
    /// The session is in a terminal state.
    Finished { state: String, status: SessionStatus },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session {session}: state `{state}` is not in the workflow")]
    UnknownState { session: String, state: String },

    #[error("session {session}: state `{state}`: {detail}")]
    Configuration {
        session: String,
        state: String,
        detail: String,
    },

    #[error("step cancelled")]
    Cancelled,

    #[error("persisting session: {0}")]
    Persist(#[source] anyhow::Error),
}

impl EngineError {
    /// Errors that end the session rather than retrying next tick.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, EngineError::UnknownState { .. } | EngineError::Configuration { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::UnknownState { .. } => ErrorKind::Graph,
            _ => ErrorKind::Configuration,
        }
    }
}

/// Drives sessions through a shared, read-only [`WorkflowGraph`].
pub struct WorkflowEngine {
    graph: Arc<WorkflowGraph>,
    host: Arc<dyn Host>,
    hooks: Arc<dyn HookRunner>,
    store: Option<Arc<SessionStore>>,
    events: EventLog,
}

impl WorkflowEngine {
    pub fn new(graph: Arc<WorkflowGraph>, host: Arc<dyn Host>, hooks: Arc<dyn HookRunner>) -> Self {
        Self {
            graph,
            host,
            hooks,
            store: None,
            events: EventLog::disabled(),
        }
    }

    /// Persist each completed step.
    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Run one step. The session is only updated, and only persisted, when
    /// the step completes; a cancelled or failed step leaves it untouched.
    #[instrument(skip_all, fields(session = %session.id, state = %session.state))]
    pub async fn advance(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        if !session.is_active() {
            return Ok(StepOutcome::Finished {
                state: session.state.clone(),
                status: session.status,
            });
        }

        let mut work = session.clone();
        let mut events = Vec::new();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            r = self.step(&mut work, &mut events) => r?,
        };

        let first_seq = work.version;
        work.version += events.len().max(1) as u32;
        work.updated_at = now_rfc3339();
        if let Some(store) = &self.store {
            store.save(&work).map_err(EngineError::Persist)?;
        }
        for (i, event) in events.iter().enumerate() {
            self.events.record(&work.id, first_seq + i as u32, event);
        }
        *session = work;
        Ok(outcome)
    }

    async fn step(&self, s: &mut Session, events: &mut Vec<Event>) -> Result<StepOutcome, EngineError> {
        let graph = self.graph.clone();
        let Some(state) = graph.state(&s.state) else {
            return Err(EngineError::UnknownState {
                session: s.id.clone(),
                state: s.state.clone(),
            });
        };

        match state.kind {
            StateKind::Succeed | StateKind::Fail => {
                // Entered without going through a transition, e.g. a hand-edited
                // session file.
                s.status = terminal_status(state.kind);
                Ok(StepOutcome::Finished {
                    state: s.state.clone(),
                    status: s.status,
                })
            }
            StateKind::Choice => {
                let Some((target, label)) = resolve_choice(state, &s.data) else {
                    return Err(EngineError::Configuration {
                        session: s.id.clone(),
                        state: s.state.clone(),
                        detail: "no choice matched and no default".into(),
                    });
                };
                if graph.state(&target).map(|c| c.kind) == Some(StateKind::Fail) {
                    s.last_error = Some(ErrorInfo::new(
                        ErrorKind::ActionFailure,
                        &s.state,
                        format!("{label} routed to {target}"),
                    ));
                }
                Ok(self.transition(s, &target, &label, events))
            }
            StateKind::Task | StateKind::Wait | StateKind::Pass => self.step_state(s, state, events).await,
        }
    }

    async fn step_state(
        &self,
        s: &mut Session,
        state: &StateConfig,
        events: &mut Vec<Event>,
    ) -> Result<StepOutcome, EngineError> {
        events.push(Event::StepStarted {
            state: s.state.clone(),
            attempt: s.attempts + 1,
        });

        let deadline = match state.timeout {
            Some(limit) => {
                let elapsed = s.time_in_state();
                if elapsed >= limit {
                    info!(timeout = ?limit, "state timed out");
                    return self.on_timeout(s, state, ErrorKind::Timeout, "state timeout expired", events);
                }
                Some(Instant::now() + (limit - elapsed))
            }
            None => None,
        };

        // Before-hooks run once per state entry, not on every poll.
        if s.attempts == 0 {
            if let Some(result) = self.run_hooks(s, &state.before, deadline, state, events).await {
                return result;
            }
        }

        let primary = async {
            match state.kind {
                StateKind::Task => actions::run_action(self.host.as_ref(), state, s).await,
                StateKind::Wait => actions::poll_event(self.host.as_ref(), state, s).await,
                _ => ActionOutcome::Proceed,
            }
        };
        let timed = match deadline {
            Some(d) => tokio::time::timeout_at(d, primary).await.ok(),
            None => Some(primary.await),
        };
        let Some(outcome) = timed else {
            info!("action exceeded state timeout");
            return self.on_timeout(s, state, ErrorKind::Timeout, "action exceeded state timeout", events);
        };

        match outcome {
            ActionOutcome::Continue => {
                s.attempts += 1;
                Ok(StepOutcome::Stayed)
            }
            ActionOutcome::Stop(reason) => {
                warn!(reason = %reason, "action failed");
                events.push(Event::ActionFailed {
                    state: s.state.clone(),
                    kind: ErrorKind::ActionFailure,
                    error: reason.clone(),
                });
                self.on_error(s, ErrorKind::ActionFailure, &reason, events)
            }
            ActionOutcome::Proceed => {
                if s.pr_merged {
                    events.push(Event::Merged {
                        pr_url: s.pr_url.clone(),
                    });
                }
                if let Some(result) = self.run_hooks(s, &state.after, deadline, state, events).await {
                    return result;
                }
                let Some(next) = state.next.clone() else {
                    return Err(EngineError::Configuration {
                        session: s.id.clone(),
                        state: s.state.clone(),
                        detail: "no next state".into(),
                    });
                };
                Ok(self.transition(s, &next, "next", events))
            }
        }
    }

    /// Run hooks in order. Returns the step result when one of them fails.
    async fn run_hooks(
        &self,
        s: &mut Session,
        hooks: &[HookConfig],
        deadline: Option<Instant>,
        state: &StateConfig,
        events: &mut Vec<Event>,
    ) -> Option<Result<StepOutcome, EngineError>> {
        if hooks.is_empty() {
            return None;
        }
        let ctx = HookContext {
            session_id: s.id.clone(),
            state: s.state.clone(),
            work_dir: s.work_dir().to_path_buf(),
            branch: s.branch.clone(),
            issue_id: s.issue_id().map(String::from),
        };
        for hook in hooks {
            let result = self.hooks.run(hook, &ctx, deadline).await;
            let kind = match result.outcome {
                HookOutcome::Success => continue,
                HookOutcome::Timeout => ErrorKind::HookTimeout,
                HookOutcome::Failure | HookOutcome::Error => ErrorKind::HookFailure,
            };
            let message = result.error.unwrap_or_else(|| format!("hook failed: {}", hook.run));
            if result.outcome == HookOutcome::Error {
                warn!(hook = %hook.run, error = %message, "hook could not start");
            } else {
                warn!(hook = %hook.run, error = %message, "hook failed");
            }
            events.push(Event::HookFailed {
                state: s.state.clone(),
                command: hook.run.clone(),
                kind,
                output: result.output,
            });
            return Some(if kind == ErrorKind::HookTimeout {
                self.on_timeout(s, state, kind, &message, events)
            } else {
                self.on_error(s, kind, &message, events)
            });
        }
        None
    }

    /// Take the timeout edge, or the error edge when there is none.
    fn on_timeout(
        &self,
        s: &mut Session,
        state: &StateConfig,
        kind: ErrorKind,
        message: &str,
        events: &mut Vec<Event>,
    ) -> Result<StepOutcome, EngineError> {
        s.last_error = Some(ErrorInfo::new(kind, &s.state, message));
        match state.timeout_next.clone() {
            Some(target) => Ok(self.transition(s, &target, "timeout", events)),
            None => self.on_error(s, kind, message, events),
        }
    }

    fn on_error(
        &self,
        s: &mut Session,
        kind: ErrorKind,
        message: &str,
        events: &mut Vec<Event>,
    ) -> Result<StepOutcome, EngineError> {
        s.last_error = Some(ErrorInfo::new(kind, &s.state, message));
        let Some(target) = self.graph.error_target(&s.state).map(String::from) else {
            return Err(EngineError::Configuration {
                session: s.id.clone(),
                state: s.state.clone(),
                detail: format!("no error edge for: {message}"),
            });
        };
        Ok(self.transition(s, &target, "error", events))
    }

    fn transition(&self, s: &mut Session, to: &str, reason: &str, events: &mut Vec<Event>) -> StepOutcome {
        let from = s.state.clone();
        s.enter(to);
        info!(from = %from, to = %to, reason, "transition");
        events.push(Event::Transition {
            from: from.clone(),
            to: to.to_string(),
            reason: reason.to_string(),
        });

        let kind = self.graph.state(to).map(|c| c.kind);
        match kind {
            Some(k @ (StateKind::Succeed | StateKind::Fail)) => {
                s.status = terminal_status(k);
                events.push(Event::SessionCompleted {
                    state: to.to_string(),
                    success: s.status == SessionStatus::Done,
                    cost_usd: s.cost_usd,
                });
                StepOutcome::Finished {
                    state: to.to_string(),
                    status: s.status,
                }
            }
            _ => StepOutcome::Transitioned {
                from,
                to: to.to_string(),
            },
        }
    }
}

fn terminal_status(kind: StateKind) -> SessionStatus {
    if kind == StateKind::Succeed {
        SessionStatus::Done
    } else {
        SessionStatus::Failed
    }
}

/// First matching rule in declared order, then the default.
fn resolve_choice(state: &StateConfig, data: &BTreeMap<String, String>) -> Option<(String, String)> {
    state
        .choices
        .iter()
        .find(|rule| data.get(&rule.variable) == Some(&rule.equals))
        .map(|rule| (rule.next.clone(), rule.label()))
        .or_else(|| state.default.clone().map(|d| (d, "default".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testutil::{test_daemon, test_daemon_with_graph};
    use crate::hooks::{MockHookRunner, ShellHookRunner};
    use crate::runner::RunOutcome;
    use erg_core::{MockExecutor, MockResponse};
    use erg_issues::{Issue, Source};
    use erg_workflow::{default_graph, parse_workflow};
    use std::path::Path;
    use std::time::Duration;

    fn issue() -> Issue {
        Issue {
            id: "5".into(),
            title: "Add retry".into(),
            body: String::new(),
            url: String::new(),
            source: Source::Github,
        }
    }

    fn session_at(id: &str, dir: &Path, state: &str) -> Session {
        Session::new(id, dir, "issue-5", state).with_issue(issue())
    }

    fn engine_for(
        daemon: &Arc<crate::Daemon>,
        hooks: Arc<dyn HookRunner>,
    ) -> WorkflowEngine {
        let host: Arc<dyn Host> = daemon.clone();
        WorkflowEngine::new(daemon.graph_arc(), host, hooks)
            .with_store(daemon.store_arc())
            .with_events(daemon.events().clone())
    }

    const HOOKED: &str = r#"
start: coding
states:
  coding:
    type: task
    action: ai.code
    next: open_pr
    before: [ "make setup" ]
    after: [ "make lint" ]
  open_pr:
    type: task
    action: github.create_pr
    next: done
  done: { type: succeed }
  failed: { type: fail }
"#;

    #[tokio::test]
    async fn coding_with_hooks_moves_to_open_pr() {
        let dir = tempfile::tempdir().unwrap();
        let graph = parse_workflow(HOOKED).unwrap();
        let (daemon, runner) = test_daemon_with_graph(dir.path(), Arc::new(MockExecutor::new()), graph);
        let hooks = Arc::new(MockHookRunner::new());
        let engine = engine_for(&daemon, hooks.clone());

        let mut s = session_at("e1", dir.path(), "coding");
        let out = engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            out,
            StepOutcome::Transitioned {
                from: "coding".into(),
                to: "open_pr".into()
            }
        );
        assert_eq!(s.state, "open_pr");
        assert_eq!(s.attempts, 0);
        assert_eq!(s.version, 2);
        assert_eq!(runner.requests().len(), 1);
        assert_eq!(
            hooks.calls(),
            vec![
                ("coding".to_string(), "make setup".to_string()),
                ("coding".to_string(), "make lint".to_string())
            ]
        );
        let saved = daemon.store().load("e1").unwrap().unwrap();
        assert_eq!(saved.state, "open_pr");
    }

    #[tokio::test]
    async fn before_hook_failure_takes_error_edge() {
        let dir = tempfile::tempdir().unwrap();
        let graph = parse_workflow(HOOKED).unwrap();
        let (daemon, runner) = test_daemon_with_graph(dir.path(), Arc::new(MockExecutor::new()), graph);
        let hooks = Arc::new(MockHookRunner::new());
        hooks.set_outcome("make setup", HookOutcome::Failure);
        let engine = engine_for(&daemon, hooks);

        let mut s = session_at("e2", dir.path(), "coding");
        let out = engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            out,
            StepOutcome::Finished {
                state: "failed".into(),
                status: SessionStatus::Failed
            }
        );
        assert_eq!(s.last_error.as_ref().unwrap().kind, ErrorKind::HookFailure);
        assert!(runner.requests().is_empty());
    }

    #[tokio::test]
    async fn after_hook_timeout_without_edge_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let graph = parse_workflow(HOOKED).unwrap();
        let (daemon, _runner) = test_daemon_with_graph(dir.path(), Arc::new(MockExecutor::new()), graph);
        let hooks = Arc::new(MockHookRunner::new());
        hooks.set_outcome("make lint", HookOutcome::Timeout);
        let engine = engine_for(&daemon, hooks);

        let mut s = session_at("e3", dir.path(), "coding");
        engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert_eq!(s.state, "failed");
        assert_eq!(s.last_error.as_ref().unwrap().kind, ErrorKind::HookTimeout);
    }

    #[tokio::test]
    async fn real_hook_timeout_routes_to_timeout_target() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
start: build
states:
  build:
    type: pass
    next: done
    timeout: 1s
    timeout_next: slow
    before: [ "sleep 30" ]
  slow: { type: fail }
  done: { type: succeed }
"#;
        let graph = parse_workflow(yaml).unwrap();
        let (daemon, _runner) = test_daemon_with_graph(dir.path(), Arc::new(MockExecutor::new()), graph);
        let engine = engine_for(&daemon, Arc::new(ShellHookRunner::new(Duration::from_secs(60))));

        let mut s = session_at("e4", dir.path(), "build");
        let started = std::time::Instant::now();
        engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(s.state, "slow");
        assert_eq!(s.last_error.as_ref().unwrap().kind, ErrorKind::HookTimeout);
    }

    #[tokio::test]
    async fn elapsed_wait_timeout_takes_timeout_edge() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.add_prefix(
            "gh",
            &["pr", "checks"],
            MockResponse::error("exit status 8").with_stdout(r#"[{"state":"PENDING"}]"#),
        );
        let (daemon, _runner) = test_daemon(dir.path(), exec);
        let engine = engine_for(&daemon, Arc::new(MockHookRunner::new()));

        let mut s = session_at("e5", dir.path(), "await_ci");
        let out = engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert_eq!(out, StepOutcome::Stayed);
        assert_eq!(s.attempts, 1);

        s.state_entered_at = "2020-01-01T00:00:00Z".into();
        engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert_eq!(s.state, "failed");
        assert_eq!(s.last_error.as_ref().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn choice_routes_on_step_data() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        let engine = engine_for(&daemon, Arc::new(MockHookRunner::new()));

        let mut s = session_at("e6", dir.path(), "check_ci_result");
        s.data.insert("ci_status".into(), "passing".into());
        engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert_eq!(s.state, "merge");

        let mut s = session_at("e7", dir.path(), "check_ci_result");
        let err = engine.advance(&mut s, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
        assert!(err.is_fatal_for_session());
        assert_eq!(s.state, "check_ci_result");
    }

    #[tokio::test]
    async fn choice_into_fail_state_records_the_rule() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        let engine = engine_for(&daemon, Arc::new(MockHookRunner::new()));

        let mut s = session_at("e9", dir.path(), "check_ci_result");
        s.data.insert("ci_status".into(), "failing".into());
        let out = engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert!(matches!(out, StepOutcome::Finished { .. }));
        assert_eq!(s.state, "failed");
        assert_eq!(s.status, SessionStatus::Failed);
        let err = s.last_error.as_ref().unwrap();
        assert_eq!(err.state, "check_ci_result");
        assert!(err.message.contains("ci_status == failing"));
    }

    #[tokio::test]
    async fn unknown_state_is_graph_error() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        let engine = engine_for(&daemon, Arc::new(MockHookRunner::new()));
        let mut s = session_at("e8", dir.path(), "vanished");
        let err = engine.advance(&mut s, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownState { .. }));
        assert_eq!(err.kind(), ErrorKind::Graph);
    }

    #[tokio::test]
    async fn agent_failure_takes_error_edge() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        runner.push("e9", RunOutcome::failed("crashed"));
        let engine = engine_for(&daemon, Arc::new(MockHookRunner::new()));
        let mut s = session_at("e9", dir.path(), "coding");
        engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert_eq!(s.state, "failed");
        assert_eq!(s.status, SessionStatus::Failed);
        let err = s.last_error.unwrap();
        assert_eq!(err.kind, ErrorKind::ActionFailure);
        assert_eq!(err.state, "coding");
        assert_eq!(err.message, "crashed");
    }

    #[tokio::test]
    async fn merge_reaches_done_with_merge_flag() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.add_prefix("gh", &["pr", "checks"], MockResponse::stdout(r#"[{"state":"SUCCESS"}]"#));
        let (daemon, _runner) = test_daemon(dir.path(), exec);
        let engine = engine_for(&daemon, Arc::new(MockHookRunner::new()));
        let mut s = session_at("e10", dir.path(), "merge");
        let out = engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            out,
            StepOutcome::Finished {
                state: "done".into(),
                status: SessionStatus::Done
            }
        );
        assert!(s.pr_merged);
    }

    #[tokio::test]
    async fn cancelled_step_leaves_session_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        let engine = engine_for(&daemon, Arc::new(MockHookRunner::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut s = session_at("e11", dir.path(), "coding");
        let err = engine.advance(&mut s, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(s.state, "coding");
        assert_eq!(s.version, 0);
        assert!(daemon.store().load("e11").unwrap().is_none());
    }

    #[tokio::test]
    async fn finished_session_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        let engine = engine_for(&daemon, Arc::new(MockHookRunner::new()));
        let mut s = session_at("e12", dir.path(), "done");
        s.status = SessionStatus::Done;
        let out = engine.advance(&mut s, &CancellationToken::new()).await.unwrap();
        assert!(matches!(out, StepOutcome::Finished { .. }));
        assert_eq!(s.version, 0);
    }

    #[test]
    fn default_graph_choice_resolution() {
        let g = default_graph().unwrap();
        let choice = g.state("check_ci_result").unwrap();
        let mut data = BTreeMap::new();
        data.insert("ci_status".to_string(), "pending".to_string());
        assert_eq!(
            resolve_choice(choice, &data).map(|(t, _)| t).as_deref(),
            Some("await_ci")
        );
        data.insert("ci_status".to_string(), "unknown".to_string());
        assert!(resolve_choice(choice, &data).is_none());
    }
}
