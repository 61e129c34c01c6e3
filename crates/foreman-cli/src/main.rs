mod cmd;
mod notify;
mod output;
mod preflight;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "foreman",
    about = "Supervise an interactive coding agent through a step-by-step pipeline",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: <project>/foreman.yaml)
    #[arg(long, global = true, env = "FOREMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new supervised run
    Run {
        /// Project work tree the agent operates on
        project: PathBuf,

        /// Template variable as key=value; overrides the config's vars
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Start from step N (1-based) instead of the first step
        #[arg(long, value_name = "N")]
        from_step: Option<u32>,

        /// Never push, regardless of the config
        #[arg(long)]
        no_push: bool,

        /// Run preflight checks and exit without starting the agent
        #[arg(long)]
        check: bool,
    },

    /// Continue the latest run after an escalation or interruption
    Resume {
        project: PathBuf,

        /// Drop the recovery stash and restart the current step from scratch
        #[arg(long)]
        discard: bool,
    },

    /// Show the latest run snapshot
    Status {
        project: PathBuf,

        /// Output as JSON
        #[arg(long, short = 'j')]
        json: bool,
    },

    /// List run snapshots, newest first
    Runs { project: PathBuf },

    /// Validate and print the step catalog
    Steps { project: PathBuf },

    /// Delete run snapshots and locks (rolling backups are kept)
    Clear {
        project: PathBuf,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run {
            project,
            vars,
            from_step,
            no_push,
            check,
        } => cmd::run::run(&project, config, &vars, from_step, no_push, check).await,
        Commands::Resume { project, discard } => cmd::resume::run(&project, config, discard).await,
        Commands::Status { project, json } => cmd::status::run(&project, config, json),
        Commands::Runs { project } => cmd::runs::run(&project, config),
        Commands::Steps { project } => cmd::steps::run(&project, config),
        Commands::Clear { project, yes } => cmd::clear::run(&project, config, yes),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
