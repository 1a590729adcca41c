// ABOUTME: Main entry point for saltbot
// ABOUTME: Loads config, initializes logging and metrics, then hands control to the orchestrator

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use saltbot::{
    config::Config, logging, metrics, orchestrator::Orchestrator, store::HistoryStore,
    workers::SaltbotWorkers,
};

#[derive(Parser)]
#[command(name = "saltbot")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run Salt highstates from git pushes and IRC commands", long_about = None)]
struct Cli {
    /// Config file to use instead of the usual search path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every worker and supervise them (default)
    Run,
    /// Load and validate the configuration, then print it
    CheckConfig,
    /// Create the history tables
    InitDb,
    /// Drop the history tables
    DropDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\nPANIC! saltbot crashed with the following error:\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Held for the life of the process so buffered file logs get written
    let _log_guard = logging::init_logging(&config.logs, cli.json_logs)?;
    config.log_warnings();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::CheckConfig => {
            println!("{:#?}", config);
            println!("Configuration OK");
            Ok(())
        }
        Commands::InitDb => {
            HistoryStore::open(&config.database.path)?;
            tracing::info!(path = %config.database.path, "History tables created");
            Ok(())
        }
        Commands::DropDb => {
            let store = HistoryStore::open(&config.database.path)?;
            store.drop_tables()?;
            tracing::info!(path = %config.database.path, "History tables dropped");
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    metrics::init_metrics().context("Failed to initialize Prometheus metrics")?;

    tracing::info!(
        server = %config.irc.server,
        channel = %config.irc.channel,
        nick = %config.irc.nick,
        owners = config.irc.owners.len(),
        webhook_port = config.webhook.port,
        fleet = %config.fleet.backend,
        routes = config.repos.values().map(|branches| branches.len()).sum::<usize>(),
        "Starting saltbot"
    );

    Orchestrator::new(config, SaltbotWorkers).run().await
}
