use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

use commands::{AuditArgs, ChangesetCmd, ConfigCmd, GlobalArgs, RunCmd, WorkerArgs};

#[derive(Parser)]
#[command(
    name = "tollgate-cli",
    version,
    about = "Propose, approve and apply gated writes and agent runs"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Changeset lifecycle (propose, approve, apply)
    Changeset {
        #[command(subcommand)]
        cmd: ChangesetCmd,
    },
    /// Agent-run lifecycle (propose, approve, claim, execute)
    Run {
        #[command(subcommand)]
        cmd: RunCmd,
    },
    /// Claim and drive approved work until interrupted
    Worker(WorkerArgs),
    /// Return runs with lapsed leases to the queue
    Reap,
    /// Query the audit log
    Audit(AuditArgs),
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[tokio::main]
async fn main() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Changeset { cmd } => commands::changeset::execute(&cli.global, cmd).await,
        Commands::Run { cmd } => commands::run::execute(&cli.global, cmd).await,
        Commands::Worker(args) => commands::worker::execute(&cli.global, args).await,
        Commands::Reap => commands::worker::reap(&cli.global).await,
        Commands::Audit(args) => commands::audit::execute(&cli.global, args).await,
        Commands::Config { cmd } => commands::config::execute(&cli.global, cmd),
    };
    if let Err(e) = result {
        eprintln!("{}", commands::util::describe_error(&e));
        std::process::exit(1);
    }
}
