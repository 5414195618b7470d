mod cmd_clean;
mod cmd_run;
mod cmd_status;
mod cmd_workflow;
mod setup;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "erg", version = env!("ERG_VERSION_LONG"), about = "Turn queued issues into merged pull requests")]
struct Cli {
    /// Verbose logging
    #[arg(long, global = true, conflicts_with = "quiet")]
    debug: bool,
    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon
    Run {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
        /// Agent config file (default: config.json in the config dir)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Workflow file (overrides `workflow_file` in the config)
        #[arg(long)]
        workflow: Option<PathBuf>,
    },
    /// Inspect workflow files
    Workflow {
        #[command(subcommand)]
        cmd: WorkflowCmd,
    },
    /// Show the daemon status and sessions
    Status,
    /// Remove a session, its worktree, and its pending state
    Clean {
        /// Session ID
        session_id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum WorkflowCmd {
    /// Check a workflow file for errors
    Validate {
        /// Workflow file (default: the built-in workflow)
        path: Option<PathBuf>,
    },
    /// Print a Mermaid state diagram
    Diagram {
        /// Workflow file (default: the built-in workflow)
        path: Option<PathBuf>,
        /// Omit error edges
        #[arg(long)]
        compact: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup::init_logging(cli.debug, cli.quiet);

    match cli.cmd {
        Command::Run {
            once,
            config,
            workflow,
        } => cmd_run::execute(once, config.as_deref(), workflow.as_deref()),
        Command::Workflow { cmd } => match cmd {
            WorkflowCmd::Validate { path } => cmd_workflow::validate(path.as_deref()),
            WorkflowCmd::Diagram { path, compact } => cmd_workflow::diagram(path.as_deref(), compact),
        },
        Command::Status => cmd_status::execute(),
        Command::Clean { session_id, yes } => cmd_clean::execute(&session_id, yes),
    }
}
