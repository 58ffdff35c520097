mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

use drover_core::DroverConfig;

use commands::AddJobArgs;

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Administer a drover job queue")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $DROVER_CONFIG, then ~/.drover/drover.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the queue tables if they do not exist
    Migrate,
    /// Parse a crontab and print the resulting schedule
    CheckCrontab {
        /// Crontab file (defaults to cron.crontab_path from the config)
        path: Option<String>,
    },
    /// Enqueue a job
    AddJob(AddJobArgs),
    /// Clear job and queue locks left behind by crashed workers
    ResetLocks,
    /// Print a job as JSON
    ShowJob { id: i64 },
    /// List serial queues and who holds them
    Queues,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drover=info,drover_store=info,drover_cron=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // explicit flag > DROVER_CONFIG env > ~/.drover/drover.toml
    let config_path = cli.config.or_else(|| std::env::var("DROVER_CONFIG").ok());
    let config = DroverConfig::load(config_path.as_deref()).or_else(|e| {
        if config_path.is_some() {
            Err(e)
        } else {
            warn!("config load failed ({}), using defaults", e);
            Ok(DroverConfig::default())
        }
    })?;

    match cli.command {
        Commands::Migrate => commands::migrate(&config).await,
        Commands::CheckCrontab { path } => commands::check_crontab(&config, path.as_deref()),
        Commands::AddJob(args) => commands::add_job(&config, args).await,
        Commands::ResetLocks => commands::reset_locks(&config).await,
        Commands::ShowJob { id } => commands::show_job(&config, id).await,
        Commands::Queues => commands::queues(&config).await,
    }
}
