use crate::setup::{load_config, load_graph, resolve_workflow_path};
use anyhow::{bail, Result};
use erg_daemon::{Daemon, DaemonDeps, Host};
use erg_store::{try_lock_file, Paths};
use std::sync::Arc;

/// Execute `erg clean <session-id>`
pub fn execute(session_id: &str, yes: bool) -> Result<()> {
    let paths = Paths::resolve()?;
    let _lock = try_lock_file(&paths.lock_path())
        .map_err(|e| anyhow::anyhow!("stop the daemon before cleaning sessions ({e})"))?;

    let (config, config_path) = load_config(&paths, None)?;
    let graph = load_graph(resolve_workflow_path(&config, &config_path, None).as_deref())?;
    let deps = DaemonDeps::standard(&config);
    let daemon = Daemon::new(config, paths, Arc::new(graph), deps)?;

    let Some(session) = daemon.store().load(session_id)? else {
        bail!("no session {session_id}");
    };

    if !yes {
        eprint!(
            "Remove session {} ({}, branch {}) and its worktree? [y/N] ",
            session.id, session.state, session.branch
        );
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(daemon.cleanup_session(session_id))?;
    println!("Cleaned session {session_id}");
    Ok(())
}
