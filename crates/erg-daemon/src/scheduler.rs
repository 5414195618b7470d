//! The tick loop: advance every live session once, archive finished ones,
//! then pull new work from the issue trackers.

use crate::daemon::Daemon;
use crate::engine::{EngineError, StepOutcome, WorkflowEngine};
use crate::hooks::HookRunner;
use crate::host::Host;
use crate::session::{session_id, ErrorInfo, Session};
use erg_issues::{FilterConfig, Source};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sessions that completed a step.
    pub advanced: usize,
    /// Sessions that changed state.
    pub transitioned: usize,
    /// Sessions skipped because a previous step was still running.
    pub skipped_busy: usize,
    /// Sessions failed for errors the workflow cannot route.
    pub failed: Vec<String>,
    pub archived: Vec<String>,
    pub created: Vec<String>,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.transitioned == 0 && self.failed.is_empty() && self.archived.is_empty() && self.created.is_empty()
    }
}

enum Stepped {
    Busy,
    Advanced(StepOutcome),
    Fatal { state: String, error: EngineError },
    Retry(EngineError),
}

pub struct Scheduler {
    daemon: Arc<Daemon>,
    engine: WorkflowEngine,
}

impl Scheduler {
    pub fn new(daemon: Arc<Daemon>, hooks: Arc<dyn HookRunner>) -> Self {
        let host: Arc<dyn Host> = daemon.clone();
        let engine = WorkflowEngine::new(daemon.graph_arc(), host, hooks)
            .with_store(daemon.store_arc())
            .with_events(daemon.events().clone());
        Self { daemon, engine }
    }

    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    /// Tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.daemon.config().tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            workflow = self.daemon.graph().name(),
            sessions = self.daemon.active_count(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let report = self.tick(&cancel).await;
            if !report.is_quiet() {
                info!(
                    transitioned = report.transitioned,
                    failed = report.failed.len(),
                    archived = report.archived.len(),
                    created = report.created.len(),
                    "tick"
                );
            }
        }

        self.daemon.write_status();
        info!("scheduler stopped");
    }

    /// One pass over all sessions plus intake.
    pub async fn tick(&self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();

        // 1. Advance every session once, up to max_concurrent at a time
        let limit = self.daemon.config().max_concurrent.max(1);
        let results: Vec<(String, Stepped)> = stream::iter(self.daemon.session_handles())
            .map(|(id, handle)| async move {
                let Ok(mut session) = handle.try_lock() else {
                    return (id, Stepped::Busy);
                };
                let stepped = self.step_one(&mut session, cancel).await;
                (id, stepped)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        // 2. Tally, failing sessions the workflow cannot route
        for (id, stepped) in results {
            match stepped {
                Stepped::Busy => report.skipped_busy += 1,
                Stepped::Advanced(outcome) => {
                    report.advanced += 1;
                    if matches!(outcome, StepOutcome::Transitioned { .. }) {
                        report.transitioned += 1;
                    }
                }
                Stepped::Fatal { state, error } => {
                    let info = ErrorInfo::new(error.kind(), &state, error.to_string());
                    match self.daemon.fail_session(&id, info).await {
                        Ok(()) => report.failed.push(id),
                        Err(e) => warn!(session = %id, error = %e, "could not record session failure"),
                    }
                }
                Stepped::Retry(EngineError::Cancelled) => debug!(session = %id, "step cancelled"),
                Stepped::Retry(e) => warn!(session = %id, error = %e, "step failed, retrying next tick"),
            }
        }

        // 3. Archive finished sessions
        report.archived = self.daemon.archive_finished().await;

        // 4. Intake
        if !cancel.is_cancelled() {
            report.created = self.intake(cancel).await;
        }

        self.daemon.write_status();
        report
    }

    async fn step_one(&self, session: &mut Session, cancel: &CancellationToken) -> Stepped {
        let _running = self.daemon.mark_running(&session.id);
        let state = session.state.clone();
        match self.engine.advance(session, cancel).await {
            Ok(outcome) => Stepped::Advanced(outcome),
            Err(error) if error.is_fatal_for_session() => Stepped::Fatal { state, error },
            Err(error) => Stepped::Retry(error),
        }
    }

    /// Poll each configured repo for new issues while there is capacity
    /// and budget.
    async fn intake(&self, cancel: &CancellationToken) -> Vec<String> {
        let mut created = Vec::new();
        let config = self.daemon.config();
        if self.daemon.spend().is_exhausted() {
            debug!("spend budget exhausted, not starting sessions");
            return created;
        }
        let source = self.daemon.graph().source();
        let providers = self.daemon.providers();

        for repo in &config.repos {
            if self.daemon.active_count() >= config.max_active_sessions {
                debug!(max = config.max_active_sessions, "at session capacity");
                break;
            }

            let kind = repo
                .provider
                .or_else(|| source.and_then(|s| s.provider.parse::<Source>().ok()))
                .unwrap_or(Source::Github);
            let Some(provider) = providers.get(kind) else {
                continue;
            };
            if !providers.check_enabled(kind, &repo.path) {
                continue;
            }

            let pick = |own: &Option<String>, fallback: Option<&String>| {
                own.clone().or_else(|| fallback.cloned()).unwrap_or_default()
            };
            let filter = FilterConfig {
                label: pick(&repo.label, source.map(|s| &s.filter.label)),
                project: pick(&repo.project, source.map(|s| &s.filter.project)),
                team: pick(&repo.team, source.map(|s| &s.filter.team)),
            };

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(config.provider_timeout(), provider.fetch_issues(&repo.path, &filter)) => r,
            };
            let issues = match fetched {
                Ok(Ok(issues)) => issues,
                Ok(Err(e)) if e.is_missing_credential() => {
                    if providers.disable(kind) {
                        warn!(provider = provider.name(), error = %e, "disabling provider until configured");
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(provider = provider.name(), repo = %repo.path.display(), error = %e, "fetching issues failed");
                    continue;
                }
                Err(_) => {
                    warn!(provider = provider.name(), repo = %repo.path.display(), "fetching issues timed out");
                    continue;
                }
            };

            for issue in issues {
                if self.daemon.active_count() >= config.max_active_sessions {
                    break;
                }
                if self.daemon.knows(&session_id(kind, &repo.path, &issue.id)) {
                    continue;
                }
                match self.daemon.create_session(&repo.path, provider.as_ref(), issue).await {
                    Ok(Some(id)) => created.push(id),
                    Ok(None) => {}
                    Err(e) => warn!(repo = %repo.path.display(), error = %e, "creating session failed"),
                }
            }
        }
        created
    }
}
