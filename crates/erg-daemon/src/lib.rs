//! The erg daemon: sessions advance through a [`WorkflowGraph`] one step at
//! a time, driven by a ticking [`Scheduler`].
//!
//! [`WorkflowGraph`]: erg_workflow::WorkflowGraph

pub mod actions;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod event_log;
pub mod git;
pub mod hooks;
pub mod host;
pub mod merge;
pub mod pending;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod spend;
pub mod store;

pub use config::{AgentConfig, RepoConfig};
pub use daemon::{Daemon, DaemonDeps};
pub use engine::{EngineError, StepOutcome, WorkflowEngine};
pub use host::{Host, SessionInfo, Settings};
pub use merge::MergeAction;
pub use scheduler::{Scheduler, TickReport};
pub use session::{ErrorInfo, ErrorKind, Session, SessionStatus};
