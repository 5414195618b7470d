use anyhow::Result;
use erg_daemon::event_log::DaemonStatus;
use erg_daemon::store::SessionStore;
use erg_daemon::Session;
use erg_store::Paths;

/// Execute `erg status`
pub fn execute() -> Result<()> {
    let paths = Paths::resolve()?;
    match DaemonStatus::read(&paths.status_file())? {
        Some(status) => {
            println!("Daemon pid {} running workflow \"{}\"", status.pid, status.workflow);
            println!("  updated: {}", status.updated_at);
            println!(
                "  spend:   ${:.2} ({} in / {} out tokens)",
                status.spend_usd, status.input_tokens, status.output_tokens
            );
            if !status.disabled_providers.is_empty() {
                println!("  disabled providers: {}", status.disabled_providers.join(", "));
            }
        }
        None => println!("No daemon status found."),
    }

    let store = SessionStore::from_paths(&paths);
    let active = store.load_all()?;
    println!("\nActive sessions: {}", active.len());
    for s in &active {
        print_session(s);
    }

    let archived = store.list_archived()?;
    if !archived.is_empty() {
        println!("\nArchived sessions: {}", archived.len());
        for s in archived.iter().rev().take(10) {
            print_session(s);
        }
    }
    Ok(())
}

fn print_session(s: &Session) {
    let pr = s.pr_url.as_deref().unwrap_or("-");
    let what = s.issue_id().or(s.task.as_deref()).unwrap_or("-");
    println!(
        "  {}  {:<16} {:<8} {}  [{}]  pr: {}",
        s.id,
        s.state,
        format!("{:?}", s.status).to_lowercase(),
        s.branch,
        what,
        pr
    );
    if let Some(err) = &s.last_error {
        println!("      last error ({:?}): {}", err.kind, err.message);
    }
}
