//! Command execution seam.
//!
//! Everything that shells out (`gh`, `git`, hooks that are not plain shell)
//! goes through [`Executor`] so tests can swap in [`MockExecutor`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Captured output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
        /// Full output, kept because some tools (`gh pr checks`) report
        /// useful JSON on stdout alongside a non-zero exit.
        output: CommandOutput,
    },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
}

impl ExecError {
    /// Output captured before the failure, if the process ran at all.
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            ExecError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Run `program args...` in `dir`, returning the captured output whatever
    /// the exit status.
    async fn output(&self, dir: &Path, program: &str, args: &[&str])
        -> Result<CommandOutput, ExecError>;

    /// Like [`Executor::output`] but a non-zero exit is an error.
    async fn run(&self, dir: &Path, program: &str, args: &[&str]) -> Result<CommandOutput, ExecError> {
        let out = self.output(dir, program, args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(ExecError::Failed {
                program: program.to_string(),
                code: out.code,
                stderr: out.stderr_str().trim().to_string(),
                output: out,
            })
        }
    }
}

/// Runs real processes via `tokio::process`.
pub struct TokioExecutor {
    timeout: Duration,
}

impl Default for TokioExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl TokioExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl Executor for TokioExecutor {
    async fn output(&self, dir: &Path, program: &str, args: &[&str]) -> Result<CommandOutput, ExecError> {
        let child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(out)) => Ok(CommandOutput {
                stdout: out.stdout,
                stderr: out.stderr,
                code: out.status.code(),
            }),
            Ok(Err(source)) => Err(ExecError::Spawn {
                program: program.to_string(),
                source,
            }),
            Err(_) => Err(ExecError::Timeout {
                program: program.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

// ── Mock ──

/// Canned response for a [`MockExecutor`] rule.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// When set, the command "fails": exit code 1 with this as stderr.
    pub err: Option<String>,
}

impl MockResponse {
    pub fn stdout(s: impl Into<String>) -> Self {
        Self {
            stdout: s.into().into_bytes(),
            ..Default::default()
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            err: Some(msg.into()),
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, s: impl Into<String>) -> Self {
        self.stdout = s.into().into_bytes();
        self
    }
}

type Matcher = Box<dyn Fn(&Path, &str, &[&str]) -> bool + Send + Sync>;

/// A recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
}

/// Rule-based executor for tests. The first matching rule wins; unmatched
/// commands succeed with empty output.
#[derive(Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<(Matcher, MockResponse)>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule<F>(&self, matcher: F, response: MockResponse)
    where
        F: Fn(&Path, &str, &[&str]) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((Box::new(matcher), response));
        }
    }

    /// Match a program with an exact argument list.
    pub fn add_exact(&self, program: &str, args: &[&str], response: MockResponse) {
        let program = program.to_string();
        let expected: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.add_rule(
            move |_, p, a| p == program && a.len() == expected.len() && a.iter().zip(&expected).all(|(x, y)| x == y),
            response,
        );
    }

    /// Match a program whose arguments start with `prefix`.
    pub fn add_prefix(&self, program: &str, prefix: &[&str], response: MockResponse) {
        let program = program.to_string();
        let prefix: Vec<String> = prefix.iter().map(|a| a.to_string()).collect();
        self.add_rule(
            move |_, p, a| p == program && a.len() >= prefix.len() && a.iter().zip(&prefix).all(|(x, y)| x == y),
            response,
        );
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Executor for MockExecutor {
    async fn output(&self, dir: &Path, program: &str, args: &[&str]) -> Result<CommandOutput, ExecError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                dir: dir.to_path_buf(),
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            });
        }

        let response = self.rules.lock().ok().and_then(|rules| {
            rules
                .iter()
                .find(|(m, _)| m(dir, program, args))
                .map(|(_, r)| r.clone())
        });

        let Some(response) = response else {
            return Ok(CommandOutput {
                code: Some(0),
                ..Default::default()
            });
        };

        match response.err {
            Some(err) => Ok(CommandOutput {
                stdout: response.stdout,
                stderr: err.into_bytes(),
                code: Some(1),
            }),
            None => Ok(CommandOutput {
                stdout: response.stdout,
                stderr: response.stderr,
                code: Some(0),
            }),
        }
    }
}
