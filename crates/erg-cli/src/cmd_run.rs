use crate::setup::{ctrlc_cancel, load_config, load_graph, resolve_workflow_path};
use anyhow::Result;
use erg_daemon::hooks::ShellHookRunner;
use erg_daemon::{Daemon, DaemonDeps, Host, Scheduler};
use erg_store::{try_lock_file, Paths};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Execute `erg run`
pub fn execute(once: bool, config: Option<&Path>, workflow: Option<&Path>) -> Result<()> {
    let paths = Paths::resolve()?;
    let (config, config_path) = load_config(&paths, config)?;
    let workflow_path = resolve_workflow_path(&config, &config_path, workflow);
    let graph = Arc::new(load_graph(workflow_path.as_deref())?);

    paths.ensure_dirs()?;
    let _lock = try_lock_file(&paths.lock_path())?;

    let deps = DaemonDeps::standard(&config);
    let hooks = Arc::new(ShellHookRunner::new(config.hook_timeout()));
    let daemon = Arc::new(Daemon::new(config, paths, graph, deps)?);
    if daemon.config().repos.is_empty() {
        tracing::warn!("no repos configured; only resumed sessions will advance");
    }
    let scheduler = Scheduler::new(daemon, hooks);

    let cancel = CancellationToken::new();
    ctrlc_cancel(cancel.clone());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if once {
            let report = scheduler.tick(&cancel).await;
            info!(
                advanced = report.advanced,
                failed = report.failed.len(),
                archived = report.archived.len(),
                created = report.created.len(),
                "tick complete"
            );
        } else {
            scheduler.run(cancel).await;
        }
    });
    Ok(())
}
