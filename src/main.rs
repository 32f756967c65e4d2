mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::{AppContext, QueueKind};
use resenha::config::Config;

#[derive(Parser)]
#[command(
    name = "resenha",
    version,
    about = "Distributed review crawler with egress identity rotation",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); defaults to the configured one
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume crawl jobs until interrupted
    Worker {
        /// Worker name, also the key of its identity binding
        #[arg(short, long)]
        name: String,
    },

    /// Consume secondary-id resolution jobs until interrupted
    Resolver {
        /// Worker name
        #[arg(short, long)]
        name: String,
    },

    /// Publish one batch of jobs from a JSON-lines file
    Publish {
        /// Target queue
        #[arg(short, long, value_enum)]
        queue: QueueKind,

        /// JSON-lines file, one job document per line
        #[arg(short, long)]
        input: PathBuf,

        /// Maximum jobs to publish (defaults to the configured batch size)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Seed the identity registry from egress config files
    SeedIdentities {
        /// Directory holding the egress configs
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Show the identity registry, worker bindings and queue depths
    Status {
        /// Workers whose bindings to show
        #[arg(short, long)]
        worker: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    tracing::info!("resenha starting");

    let ctx = AppContext::connect(config).await?;

    match cli.command {
        Commands::Worker { name } => {
            tracing::info!(worker = %name, "Starting crawl worker");
            commands::worker(ctx, name).await?;
        }

        Commands::Resolver { name } => {
            tracing::info!(worker = %name, "Starting resolution worker");
            commands::resolver(ctx, name).await?;
        }

        Commands::Publish {
            queue,
            input,
            limit,
        } => {
            tracing::info!(queue = ?queue, input = %input.display(), limit = ?limit, "Starting publish command");
            commands::publish(ctx, queue, &input, limit).await?;
        }

        Commands::SeedIdentities { dir } => {
            commands::seed_identities(ctx, dir).await?;
        }

        Commands::Status { worker } => {
            commands::status(ctx, worker).await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("resenha=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("resenha={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
