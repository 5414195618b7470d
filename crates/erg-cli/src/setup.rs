//! Shared start-up: logging, config and workflow resolution.

use anyhow::{Context, Result};
use erg_daemon::actions::validate_graph;
use erg_daemon::AgentConfig;
use erg_workflow::{default_graph, load_workflow, WorkflowGraph};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the stderr subscriber. `RUST_LOG` wins over the flags.
pub fn init_logging(debug: bool, quiet: bool) {
    let default = default_level(debug, quiet);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
}

fn default_level(debug: bool, quiet: bool) -> &'static str {
    match (debug, quiet) {
        (true, _) => "debug",
        (false, true) => "warn",
        _ => "info",
    }
}

pub fn load_config(paths: &erg_store::Paths, explicit: Option<&Path>) -> Result<(AgentConfig, PathBuf)> {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(|| paths.config_file());
    let config = AgentConfig::load(&path)?;
    Ok((config, path))
}

/// The workflow to run: the explicit file, else the config's
/// `workflow_file` (relative to the config file), else the built-in one.
pub fn resolve_workflow_path(config: &AgentConfig, config_path: &Path, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    let file = config.workflow_file.as_ref()?;
    if file.is_absolute() {
        return Some(file.clone());
    }
    let base = config_path.parent().unwrap_or(Path::new("."));
    Some(base.join(file))
}

/// Load and fully validate a workflow, logging advisory warnings.
pub fn load_graph(path: Option<&Path>) -> Result<WorkflowGraph> {
    let graph = match path {
        Some(p) => load_workflow(p).with_context(|| format!("loading workflow {}", p.display()))?,
        None => default_graph()?,
    };
    validate_graph(&graph).context("validating workflow actions")?;
    for warning in graph.warnings() {
        tracing::warn!(workflow = graph.name(), "{warning}");
    }
    Ok(graph)
}

pub fn ctrlc_cancel(cancel: CancellationToken) {
    let _ = ctrlc::set_handler(move || {
        cancel.cancel();
    });
}
