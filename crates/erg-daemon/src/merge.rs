//! Polling checks for the review and merge part of a workflow.
//!
//! Each check returns a [`MergeAction`]; the workflow decides how they are
//! composed. Attempt numbers start at 1.

use crate::git::{CiStatus, ReviewDecision};
use crate::host::Host;
use crate::runner::RunRequest;
use crate::session::Session;
use std::fmt::Write;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MergeAction {
    /// Keep waiting; poll again next tick.
    Continue = 0,
    /// Abandon this path.
    Stop = 1,
    /// Move on.
    Proceed = 2,
}

/// Approved → Proceed. Anything else keeps polling until
/// `review_max_attempts`, after which the wait is abandoned.
pub async fn check_review_approval(host: &dyn Host, session: &Session, attempt: u32) -> MergeAction {
    let max = host.settings().review_max_attempts;
    if attempt >= max {
        warn!(session = %session.id, attempt, max, "review wait exhausted");
        return MergeAction::Stop;
    }
    match host.git().review_decision(session.work_dir(), &session.branch).await {
        Ok(ReviewDecision::Approved) => {
            info!(session = %session.id, "PR approved");
            MergeAction::Proceed
        }
        Ok(decision) => {
            tracing::debug!(session = %session.id, ?decision, attempt, "waiting for review");
            MergeAction::Continue
        }
        Err(e) => {
            tracing::debug!(session = %session.id, error = %e, "review decision unavailable");
            MergeAction::Continue
        }
    }
}

/// Failing CI stops, pending waits. Passing merges, and so does output that
/// cannot be read.
pub async fn check_ci_and_merge(host: &dyn Host, session: &mut Session, attempt: u32) -> MergeAction {
    match host.git().ci_status(session.work_dir(), &session.branch).await {
        CiStatus::Failing => {
            warn!(session = %session.id, "CI failing");
            MergeAction::Stop
        }
        CiStatus::Pending => {
            tracing::debug!(session = %session.id, attempt, "CI pending");
            MergeAction::Continue
        }
        CiStatus::Passing => do_merge(host, session).await,
        CiStatus::Unknown => {
            warn!(session = %session.id, "CI status unreadable, treating as passing");
            do_merge(host, session).await
        }
    }
}

/// Merge the PR. A failed merge is not retried.
pub async fn do_merge(host: &dyn Host, session: &mut Session) -> MergeAction {
    let method = host.settings().merge_method;
    match host.git().merge_pr(session.work_dir(), &session.branch, &method).await {
        Ok(()) => {
            session.pr_merged = true;
            info!(session = %session.id, method = %method, "PR merged");
            MergeAction::Proceed
        }
        Err(e) => {
            warn!(session = %session.id, error = %e, "merge failed");
            MergeAction::Stop
        }
    }
}

/// Feed new review comments to the coding agent and push the result. A
/// failed comment query does not block the PR.
pub async fn check_and_address_comments(host: &dyn Host, session: &mut Session, attempt: u32) -> MergeAction {
    let comments = match host.git().pr_comments(session.work_dir(), &session.branch).await {
        Ok(c) => c,
        Err(e) => {
            warn!(session = %session.id, error = %e, attempt, "comment check failed, proceeding");
            return MergeAction::Proceed;
        }
    };
    let seen = session.pr_comments_addressed as usize;
    if comments.len() <= seen {
        return MergeAction::Proceed;
    }

    let mut feedback = String::from("Address the following review feedback on your pull request:\n");
    for c in &comments[seen..] {
        let _ = write!(feedback, "\n- {}: {}", c.author, c.body.trim());
    }
    if let Some(message) = host.take_pending_message(&session.id) {
        feedback.push_str("\n\n");
        feedback.push_str(&message);
    }
    info!(session = %session.id, new = comments.len() - seen, "addressing review comments");

    let settings = host.settings();
    let req = RunRequest {
        session_id: session.id.clone(),
        cwd: session.work_dir().to_path_buf(),
        prompt: feedback,
        max_turns: settings.max_turns,
        max_duration: settings.max_duration,
    };
    let outcome = match host.runner().run(&req).await {
        Ok(o) => o,
        Err(e) => {
            warn!(session = %session.id, error = %e, "agent failed to start");
            return MergeAction::Stop;
        }
    };
    host.record_spend(outcome.cost_usd, outcome.output_tokens, outcome.input_tokens);
    session.cost_usd += outcome.cost_usd;
    if let Err(e) = host.save_runner_messages(&session.id, &outcome.transcript) {
        warn!(session = %session.id, error = %e, "saving transcript failed");
    }
    if !outcome.success {
        warn!(session = %session.id, error = ?outcome.error, "agent could not address comments");
        return MergeAction::Stop;
    }
    if let Err(e) = host.git().push_branch(session.work_dir(), &session.branch).await {
        warn!(session = %session.id, error = %e, "push after addressing comments failed");
        return MergeAction::Stop;
    }
    session.pr_comments_addressed = comments.len() as u32;
    MergeAction::Continue
}
