//! The daemon context: configuration, paths, collaborators, and the table
//! of live sessions. Implements [`Host`] for actions and merge checks.

use crate::config::AgentConfig;
use crate::event_log::{append_line, DaemonStatus, Event, EventLog, SessionSummary};
use crate::git::{GhGitService, GitService};
use crate::host::{Host, SessionInfo};
use crate::pending::PendingMessages;
use crate::runner::{AgentRunner, ClaudeRunner};
use crate::session::{child_session_id, session_id, ErrorInfo, Session, SessionStatus};
use crate::spend::SpendTotals;
use crate::store::SessionStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use erg_core::{now_rfc3339, Executor, TokioExecutor};
use erg_issues::{Issue, Provider, ProviderRegistry, RepoSettings, Source};
use erg_store::Paths;
use erg_workflow::WorkflowGraph;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Collaborators the daemon talks to the outside world through.
pub struct DaemonDeps {
    pub git: Arc<dyn GitService>,
    pub runner: Arc<dyn AgentRunner>,
    pub providers: ProviderRegistry,
}

impl DaemonDeps {
    /// `git`/`gh` over real processes, `claude` as the agent, and the
    /// GitHub, Asana and Linear providers.
    pub fn standard(config: &AgentConfig) -> Self {
        let exec: Arc<dyn Executor> = Arc::new(TokioExecutor::new(config.provider_timeout()));
        let settings: Arc<dyn RepoSettings> = Arc::new(config.clone());
        Self {
            git: Arc::new(GhGitService::new(exec.clone())),
            runner: Arc::new(ClaudeRunner::new(config.claude_bin.clone())),
            providers: ProviderRegistry::standard(exec, settings, config.provider_timeout()),
        }
    }
}

type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

pub struct Daemon {
    config: AgentConfig,
    paths: Paths,
    graph: Arc<WorkflowGraph>,
    git: Arc<dyn GitService>,
    runner: Arc<dyn AgentRunner>,
    providers: ProviderRegistry,
    store: Arc<SessionStore>,
    events: EventLog,
    pending: PendingMessages,
    spend: SpendTotals,
    sessions: Mutex<BTreeMap<String, SessionHandle>>,
    running: Mutex<HashSet<String>>,
}

impl Daemon {
    /// Build the context and reload active sessions from disk.
    pub fn new(config: AgentConfig, paths: Paths, graph: Arc<WorkflowGraph>, deps: DaemonDeps) -> Result<Self> {
        paths.ensure_dirs()?;
        let store = Arc::new(SessionStore::from_paths(&paths));
        let loaded = store.load_all()?;
        let sessions = loaded
            .into_iter()
            .map(|s| (s.id.clone(), Arc::new(tokio::sync::Mutex::new(s))))
            .collect::<BTreeMap<_, _>>();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "resumed sessions");
        }

        Ok(Self {
            spend: SpendTotals::new(config.budget_usd),
            events: EventLog::new(&paths.logs_dir()),
            config,
            paths,
            graph,
            git: deps.git,
            runner: deps.runner,
            providers: deps.providers,
            store,
            pending: PendingMessages::new(),
            sessions: Mutex::new(sessions),
            running: Mutex::new(HashSet::new()),
        })
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn graph_arc(&self) -> Arc<WorkflowGraph> {
        self.graph.clone()
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn store_arc(&self) -> Arc<SessionStore> {
        self.store.clone()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn pending(&self) -> &PendingMessages {
        &self.pending
    }

    pub fn spend(&self) -> &SpendTotals {
        &self.spend
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    fn table(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the live session table.
    pub fn session_handles(&self) -> Vec<(String, SessionHandle)> {
        self.table().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn session_handle(&self, id: &str) -> Option<SessionHandle> {
        self.table().get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.table().len()
    }

    /// Whether an ID is live or already archived.
    pub fn knows(&self, id: &str) -> bool {
        self.table().contains_key(id) || self.store.is_archived(id)
    }

    /// Persist a new session and add it to the table.
    pub fn insert(&self, mut session: Session) -> Result<()> {
        let seq = session.version;
        session.version += 1;
        self.store.save(&session)?;
        self.events.record(
            &session.id,
            seq,
            &Event::SessionCreated {
                repo: session.repo_path.display().to_string(),
                branch: session.branch.clone(),
                issue_id: session.issue_id().map(String::from),
                state: session.state.clone(),
            },
        );
        self.table()
            .insert(session.id.clone(), Arc::new(tokio::sync::Mutex::new(session)));
        Ok(())
    }

    /// Start a session for a newly seen issue in its own worktree. Returns
    /// None when the worktree could not be created; the issue is retried on
    /// a later poll.
    pub async fn create_session(&self, repo: &Path, provider: &dyn Provider, issue: Issue) -> Result<Option<String>> {
        let id = session_id(provider.source(), repo, &issue.id);
        let branch = provider.generate_branch_name(&issue);
        let dest = self.paths.worktrees_dir().join(&id);
        if let Err(e) = self.git.create_worktree(repo, &branch, &dest).await {
            warn!(issue = %issue.id, branch = %branch, error = %e, "creating worktree failed, skipping issue");
            return Ok(None);
        }

        let mut session = Session::new(id.clone(), repo, branch, self.graph.initial()).with_issue(issue);
        session.worktree = Some(dest);
        self.insert(session)?;
        info!(session = %id, provider = provider.name(), "session created");
        Ok(Some(id))
    }

    /// Move a session to the failure terminal after an error the graph
    /// cannot route.
    pub async fn fail_session(&self, id: &str, error: ErrorInfo) -> Result<()> {
        let Some(handle) = self.session_handle(id) else {
            return Ok(());
        };
        let mut s = handle.lock().await;
        let from = s.state.clone();
        warn!(session = %id, state = %from, error = %error.message, "failing session");
        if let Some(target) = self.graph.failure_terminal() {
            s.enter(target);
        }
        s.status = SessionStatus::Failed;
        s.last_error = Some(error);
        let seq = s.version;
        s.version += 1;
        s.updated_at = now_rfc3339();
        self.store.save(&s)?;
        self.events.record(
            id,
            seq,
            &Event::Transition {
                from,
                to: s.state.clone(),
                reason: "unroutable error".into(),
            },
        );
        Ok(())
    }

    /// Archive every finished session and drop it from the table. Busy
    /// sessions are left for the next tick.
    pub async fn archive_finished(&self) -> Vec<String> {
        let mut archived = Vec::new();
        for (id, handle) in self.session_handles() {
            let Ok(s) = handle.try_lock() else {
                continue;
            };
            if s.is_active() {
                continue;
            }
            let session = s.clone();
            drop(s);
            self.retire(&session).await;
            archived.push(id);
        }
        archived
    }

    /// Remove the worktree, archive the session file, and forget the session.
    async fn retire(&self, session: &Session) {
        if let Some(worktree) = &session.worktree {
            if let Err(e) = self.git.remove_worktree(&session.repo_path, worktree).await {
                warn!(session = %session.id, error = %e, "removing worktree failed");
            }
        }
        if let Err(e) = self.store.archive(session) {
            warn!(session = %session.id, error = %e, "archiving session failed");
        }
        self.pending.clear(&session.id);
        self.table().remove(&session.id);
        info!(session = %session.id, state = %session.state, status = ?session.status, "session archived");
    }

    /// Mark a session's worker as running until the guard drops.
    pub fn mark_running(&self, id: &str) -> RunningGuard<'_> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
        RunningGuard {
            running: &self.running,
            id: id.to_string(),
        }
    }

    pub fn status(&self) -> DaemonStatus {
        let mut active = Vec::new();
        for (id, handle) in self.session_handles() {
            let running = self.is_worker_running(&id);
            match handle.try_lock() {
                Ok(s) => active.push(SessionSummary {
                    id,
                    state: s.state.clone(),
                    branch: s.branch.clone(),
                    attempts: s.attempts,
                    running,
                }),
                Err(_) => active.push(SessionSummary {
                    id,
                    state: String::new(),
                    branch: String::new(),
                    attempts: 0,
                    running: true,
                }),
            }
        }
        let mut status = DaemonStatus::new(self.graph.name(), active, self.spend.snapshot());
        status.disabled_providers = [Source::Github, Source::Asana, Source::Linear]
            .into_iter()
            .filter(|s| self.providers.is_disabled(*s))
            .map(|s| s.to_string())
            .collect();
        status
    }

    pub fn write_status(&self) {
        self.status().write(&self.paths.status_file());
    }
}

pub struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

#[async_trait]
impl Host for Daemon {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn git(&self) -> &dyn GitService {
        self.git.as_ref()
    }

    fn runner(&self) -> &dyn AgentRunner {
        self.runner.as_ref()
    }

    fn provider(&self, source: Source) -> Option<Arc<dyn Provider>> {
        self.providers.get(source)
    }

    fn take_pending_message(&self, session_id: &str) -> Option<String> {
        self.pending.take(session_id)
    }

    fn set_pending_message(&self, session_id: &str, message: &str) {
        self.pending.set(session_id, message);
    }

    async fn create_child_session(&self, parent_id: &str, task: &str) -> Result<SessionInfo> {
        let parent = self
            .store
            .load(parent_id)?
            .with_context(|| format!("unknown parent session {parent_id}"))?;
        let id = child_session_id(parent_id, task);
        let branch = format!("{}-child-{}", parent.branch, id.get(..8).unwrap_or(&id));
        if self.knows(&id) {
            return Ok(SessionInfo { id, branch });
        }

        let dest = self.paths.worktrees_dir().join(&id);
        self.git
            .create_worktree(&parent.repo_path, &branch, &dest)
            .await
            .with_context(|| format!("creating worktree for child of {parent_id}"))?;

        let mut child = Session::new(id.clone(), &parent.repo_path, branch.clone(), self.graph.initial());
        child.worktree = Some(dest);
        child.task = Some(task.to_string());
        child.parent_id = Some(parent_id.to_string());
        self.insert(child)?;
        Ok(SessionInfo { id, branch })
    }

    async fn cleanup_session(&self, session_id: &str) -> Result<()> {
        let session = match self.session_handle(session_id) {
            Some(handle) => Some(handle.lock().await.clone()),
            None => self.store.load(session_id)?,
        };
        let Some(session) = session else {
            anyhow::bail!("no session {session_id}");
        };
        self.retire(&session).await;
        Ok(())
    }

    fn save_runner_messages(&self, session_id: &str, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let path = self.paths.transcripts_dir().join(format!("{session_id}.jsonl"));
        for line in lines {
            append_line(&path, line).with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(())
    }

    fn is_worker_running(&self, session_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }

    fn record_spend(&self, cost_usd: f64, output_tokens: u64, input_tokens: u64) {
        self.spend.record(cost_usd, output_tokens, input_tokens);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::runner::MockRunner;
    use erg_core::MockExecutor;
    use erg_issues::GitHubProvider;

    pub fn test_daemon_full(
        dir: &Path,
        exec: Arc<MockExecutor>,
        graph: WorkflowGraph,
        providers: Vec<Arc<dyn Provider>>,
        tweak: impl FnOnce(&mut AgentConfig),
    ) -> (Arc<Daemon>, Arc<MockRunner>) {
        let mut config = AgentConfig::default();
        tweak(&mut config);
        let runner = Arc::new(MockRunner::new());
        let deps = DaemonDeps {
            git: Arc::new(GhGitService::new(exec)),
            runner: runner.clone(),
            providers: ProviderRegistry::new(providers),
        };
        let daemon = Daemon::new(config, Paths::rooted(&dir.join("erg")), Arc::new(graph), deps).unwrap();
        (Arc::new(daemon), runner)
    }

    pub fn test_daemon_with(
        dir: &Path,
        exec: Arc<MockExecutor>,
        tweak: impl FnOnce(&mut AgentConfig),
    ) -> (Arc<Daemon>, Arc<MockRunner>) {
        let github: Arc<dyn Provider> = Arc::new(GitHubProvider::new(exec.clone()));
        test_daemon_full(dir, exec, erg_workflow::default_graph().unwrap(), vec![github], tweak)
    }

    pub fn test_daemon(dir: &Path, exec: Arc<MockExecutor>) -> (Arc<Daemon>, Arc<MockRunner>) {
        test_daemon_with(dir, exec, |_| {})
    }

    pub fn test_daemon_with_graph(
        dir: &Path,
        exec: Arc<MockExecutor>,
        graph: WorkflowGraph,
    ) -> (Arc<Daemon>, Arc<MockRunner>) {
        let github: Arc<dyn Provider> = Arc::new(GitHubProvider::new(exec.clone()));
        test_daemon_full(dir, exec, graph, vec![github], |_| {})
    }

    pub fn test_daemon_with_provider(
        dir: &Path,
        exec: Arc<MockExecutor>,
        provider: Arc<dyn Provider>,
    ) -> (Arc<Daemon>, Arc<MockRunner>) {
        test_daemon_full(dir, exec, erg_workflow::default_graph().unwrap(), vec![provider], |_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::session::ErrorKind;
    use erg_core::{MockExecutor, MockResponse};
    use erg_issues::GitHubProvider;

    fn issue(id: &str) -> Issue {
        Issue {
            id: id.into(),
            title: format!("Issue {id}"),
            body: String::new(),
            url: String::new(),
            source: Source::Github,
        }
    }

    #[tokio::test]
    async fn create_session_sets_up_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        let (daemon, _runner) = test_daemon(dir.path(), exec.clone());
        let gh = GitHubProvider::new(exec.clone());
        let id = daemon
            .create_session(Path::new("/src/app"), &gh, issue("3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, session_id(Source::Github, Path::new("/src/app"), "3"));
        assert!(daemon.knows(&id));
        assert_eq!(daemon.active_count(), 1);

        let s = daemon.store().load(&id).unwrap().unwrap();
        assert_eq!(s.state, "coding");
        assert_eq!(s.branch, "issue-3");
        assert_eq!(s.worktree, Some(daemon.paths().worktrees_dir().join(&id)));
        let calls = exec.calls();
        assert_eq!(calls[0].args[..4], ["worktree", "add", "-B", "issue-3"]);
    }

    #[tokio::test]
    async fn worktree_failure_skips_issue() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.add_prefix("git", &["worktree", "add"], MockResponse::error("already exists"));
        let (daemon, _runner) = test_daemon(dir.path(), exec.clone());
        let gh = GitHubProvider::new(exec);
        let created = daemon.create_session(Path::new("/src/app"), &gh, issue("3")).await.unwrap();
        assert!(created.is_none());
        assert_eq!(daemon.active_count(), 0);
    }

    #[tokio::test]
    async fn sessions_reload_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        {
            let (daemon, _runner) = test_daemon(dir.path(), exec.clone());
            daemon
                .insert(Session::new("keep", Path::new("/r"), "b", "await_review"))
                .unwrap();
        }
        let (daemon, _runner) = test_daemon(dir.path(), exec);
        assert!(daemon.knows("keep"));
        let handle = daemon.session_handle("keep").unwrap();
        assert_eq!(handle.lock().await.state, "await_review");
    }

    #[tokio::test]
    async fn fail_session_moves_to_failure_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        daemon.insert(Session::new("x", Path::new("/r"), "b", "ghost")).unwrap();
        daemon
            .fail_session("x", ErrorInfo::new(ErrorKind::Graph, "ghost", "not in workflow"))
            .await
            .unwrap();
        let s = daemon.session_handle("x").unwrap().lock().await.clone();
        assert_eq!(s.state, "failed");
        assert_eq!(s.status, SessionStatus::Failed);
        assert_eq!(s.last_error.unwrap().kind, ErrorKind::Graph);

        assert_eq!(daemon.archive_finished().await, vec!["x".to_string()]);
        assert!(daemon.store().is_archived("x"));
        assert_eq!(daemon.active_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_archives_and_clears_pending() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MockExecutor::new());
        let (daemon, _runner) = test_daemon(dir.path(), exec.clone());
        let mut s = Session::new("c", Path::new("/r"), "b", "coding");
        s.worktree = Some(dir.path().join("wt"));
        daemon.insert(s).unwrap();
        daemon.set_pending_message("c", "stop");
        daemon.cleanup_session("c").await.unwrap();
        assert!(daemon.store().is_archived("c"));
        assert!(daemon.take_pending_message("c").is_none());
        assert!(exec
            .calls()
            .iter()
            .any(|c| c.args.get(..2) == Some(&["worktree".to_string(), "remove".to_string()][..])));
        assert!(daemon.cleanup_session("nope").await.is_err());
    }

    #[tokio::test]
    async fn running_guard_tracks_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        {
            let _guard = daemon.mark_running("s1");
            assert!(daemon.is_worker_running("s1"));
        }
        assert!(!daemon.is_worker_running("s1"));
    }

    #[tokio::test]
    async fn status_file_lists_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _runner) = test_daemon(dir.path(), Arc::new(MockExecutor::new()));
        daemon.insert(Session::new("s1", Path::new("/r"), "issue-1", "await_ci")).unwrap();
        daemon.record_spend(0.25, 10, 100);
        daemon.write_status();
        let status = DaemonStatus::read(&daemon.paths().status_file()).unwrap().unwrap();
        assert_eq!(status.workflow, "default");
        assert_eq!(status.active.len(), 1);
        assert_eq!(status.active[0].state, "await_ci");
        assert_eq!(status.input_tokens, 100);
    }
}
