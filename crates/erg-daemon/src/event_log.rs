//! Per-session event logs and the daemon status file.
//!
//! Events are append-only JSONL in `{logs}/{session}.jsonl`, separate from
//! `tracing` diagnostics. Both writers are best-effort.

use crate::session::ErrorKind;
use crate::spend::Spend;
use erg_core::now_rfc3339;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// ── Event types ──

/// A session event, serialized as tagged JSON (`"type": "transition"`, etc.).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionCreated {
        repo: String,
        branch: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        issue_id: Option<String>,
        state: String,
    },
    StepStarted {
        state: String,
        attempt: u32,
    },
    Transition {
        from: String,
        to: String,
        reason: String,
    },
    HookFailed {
        state: String,
        command: String,
        kind: ErrorKind,
        output: String,
    },
    ActionFailed {
        state: String,
        kind: ErrorKind,
        error: String,
    },
    Merged {
        pr_url: Option<String>,
    },
    SessionCompleted {
        state: String,
        success: bool,
        cost_usd: f64,
    },
}

/// Wrapper that adds the session, sequence number and timestamp.
#[derive(Debug, Serialize)]
pub struct FullEvent<'a> {
    pub seq: u32,
    pub ts: String,
    pub session: &'a str,
    #[serde(flatten)]
    pub event: &'a Event,
}

// ── EventLog ──

/// Append-only JSONL writer. A log without a directory discards events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    dir: Option<PathBuf>,
}

impl EventLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn path_for(&self, session_id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{session_id}.jsonl")))
    }

    /// Record an event. Silently ignores write failures.
    pub fn record(&self, session_id: &str, seq: u32, event: &Event) {
        let Some(path) = self.path_for(session_id) else {
            return;
        };
        let full = FullEvent {
            seq,
            ts: now_rfc3339(),
            session: session_id,
            event,
        };
        if let Ok(line) = serde_json::to_string(&full) {
            let _ = append_line(&path, &line);
        }
    }
}

/// Append a single line to a file, creating parent dirs if needed.
pub(crate) fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

// ── DaemonStatus ──

/// Lightweight status file for `erg status` and external tools to poll.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub workflow: String,
    pub active: Vec<SessionSummary>,
    pub spend_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub disabled_providers: Vec<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: String,
    pub branch: String,
    pub attempts: u32,
    #[serde(default)]
    pub running: bool,
}

impl DaemonStatus {
    pub fn new(workflow: &str, active: Vec<SessionSummary>, spend: Spend) -> Self {
        Self {
            pid: std::process::id(),
            workflow: workflow.to_string(),
            active,
            spend_usd: spend.cost_usd,
            input_tokens: spend.input_tokens,
            output_tokens: spend.output_tokens,
            disabled_providers: Vec::new(),
            updated_at: now_rfc3339(),
        }
    }

    pub fn write(&self, path: &Path) {
        if let Ok(data) = serde_json::to_string_pretty(self) {
            let _ = erg_store::write_atomic(path, data.as_bytes());
        }
    }

    pub fn read(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}
