//! The coding agent: `claude -p` with stream-json output.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_id: String,
    pub cwd: PathBuf,
    pub prompt: String,
    pub max_turns: u32,
    pub max_duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub success: bool,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub result_text: Option<String>,
    pub error: Option<String>,
    /// Raw stream-json lines, persisted as the session transcript.
    pub transcript: Vec<String>,
}

impl RunOutcome {
    pub fn done(cost_usd: f64) -> Self {
        Self {
            success: true,
            cost_usd,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, req: &RunRequest) -> Result<RunOutcome>;
}

// ── Stream protocol ──

/// Fields erg reads from Claude Code's stream-json output. Unknown message
/// types are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamMessage {
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Read stream-json lines to EOF. The last `result` message decides the
/// outcome; a stream without one is a failure.
async fn read_stream<R: AsyncBufRead + Unpin>(reader: R) -> Result<RunOutcome> {
    let mut lines = reader.lines();
    let mut transcript = Vec::new();
    let mut outcome = RunOutcome::failed("agent exited without a result");

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(StreamMessage::Result {
            subtype,
            is_error,
            total_cost_usd,
            usage,
            result,
        }) = serde_json::from_str::<StreamMessage>(trimmed)
        {
            let usage = usage.unwrap_or_default();
            let success = !is_error && subtype == "success";
            outcome = RunOutcome {
                success,
                cost_usd: total_cost_usd.unwrap_or(0.0),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                error: (!success).then(|| format!("agent result: {subtype}")),
                result_text: result,
                transcript: Vec::new(),
            };
        }
        transcript.push(line);
    }
    outcome.transcript = transcript;
    Ok(outcome)
}

// ── Claude ──

/// Launches `claude -p` in the session's working directory.
pub struct ClaudeRunner {
    pub claude_bin: PathBuf,
}

impl ClaudeRunner {
    pub fn new(claude_bin: PathBuf) -> Self {
        Self { claude_bin }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run(&self, req: &RunRequest) -> Result<RunOutcome> {
        let mut child = tokio::process::Command::new(&self.claude_bin)
            .arg("-p")
            .arg(&req.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(req.max_turns.to_string())
            .current_dir(&req.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env("ERG_SESSION_ID", &req.session_id)
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stdout"))?;

        tokio::select! {
            result = read_stream(BufReader::new(stdout)) => {
                let outcome = result?;
                let exit = child.wait().await?;
                if !exit.success() && outcome.success {
                    return Ok(RunOutcome {
                        success: false,
                        error: Some(format!("agent exited with {:?}", exit.code())),
                        ..outcome
                    });
                }
                Ok(outcome)
            }
            _ = tokio::time::sleep(req.max_duration) => {
                child.kill().await.ok();
                Ok(RunOutcome::failed(format!(
                    "agent timed out after {}m",
                    req.max_duration.as_secs() / 60
                )))
            }
        }
    }
}

// ── Mock ──

/// Mock runner for tests. Pops outcomes per session ID; when none are
/// queued, succeeds with a cost of 0.10.
#[derive(Default)]
pub struct MockRunner {
    outcomes: Mutex<HashMap<String, VecDeque<RunOutcome>>>,
    requests: Mutex<Vec<RunRequest>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, session_id: &str, outcome: RunOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AgentRunner for MockRunner {
    async fn run(&self, req: &RunRequest) -> Result<RunOutcome> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(req.clone());
        let queued = self
            .outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&req.session_id)
            .and_then(|q| q.pop_front());
        Ok(queued.unwrap_or_else(|| RunOutcome {
            result_text: Some("(mock) done".into()),
            transcript: vec![r#"{"type":"result","subtype":"success"}"#.into()],
            ..RunOutcome::done(0.10)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_result_is_parsed() {
        let stream = concat!(
            r#"{"type":"system","subtype":"init","session_id":"x"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[]}}"#,
            "\n\n",
            r#"{"type":"result","subtype":"success","is_error":false,"total_cost_usd":0.42,"usage":{"input_tokens":1200,"output_tokens":340},"result":"done"}"#,
            "\n",
        );
        let out = read_stream(stream.as_bytes()).await.unwrap();
        assert!(out.success);
        assert!((out.cost_usd - 0.42).abs() < 1e-9);
        assert_eq!(out.input_tokens, 1200);
        assert_eq!(out.output_tokens, 340);
        assert_eq!(out.result_text.as_deref(), Some("done"));
        assert_eq!(out.transcript.len(), 3);
    }

    #[tokio::test]
    async fn error_result_fails() {
        let stream = r#"{"type":"result","subtype":"error_max_turns","is_error":true,"total_cost_usd":1.0}"#;
        let out = read_stream(stream.as_bytes()).await.unwrap();
        assert!(!out.success);
        assert!(out.error.unwrap().contains("error_max_turns"));
        assert!((out.cost_usd - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_result_fails() {
        let out = read_stream(&b"{\"type\":\"assistant\",\"message\":{}}\nnot json\n"[..])
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.transcript.len(), 2);
    }

    #[tokio::test]
    async fn mock_pops_then_defaults() {
        let mock = MockRunner::new();
        mock.push("s1", RunOutcome::failed("boom"));
        let req = RunRequest {
            session_id: "s1".into(),
            cwd: PathBuf::from("."),
            prompt: "fix it".into(),
            max_turns: 5,
            max_duration: Duration::from_secs(60),
        };
        assert!(!mock.run(&req).await.unwrap().success);
        let second = mock.run(&req).await.unwrap();
        assert!(second.success);
        assert!((second.cost_usd - 0.10).abs() < 1e-9);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn missing_binary_is_error() {
        let runner = ClaudeRunner::new(PathBuf::from("/definitely/not/claude"));
        let req = RunRequest {
            session_id: "s1".into(),
            cwd: PathBuf::from("."),
            prompt: "x".into(),
            max_turns: 1,
            max_duration: Duration::from_secs(5),
        };
        assert!(runner.run(&req).await.is_err());
    }
}
