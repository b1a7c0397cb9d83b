use anyhow::Result;
use broker_bus::NatsBus;
use broker_collab::CollabService;
use broker_core::BrokerConfig;
use broker_runtime::run_until_shutdown;
use broker_story::{RedisKv, SqliteStoryRepo, StoryService};
use broker_vision::{AnalyzerService, SqliteVisionRepo};
use clap::{Parser, Subcommand};
use prometheus::Registry;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "The Body Broker back-end services", long_about = None)]
struct Args {
    /// Path to TOML config file
    #[arg(short, long, default_value = "broker.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the Story Memory service
    Story,
    /// Run the 4D Vision Analyzer service
    Vision,
    /// Run the SRL training orchestrator service
    Collab,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv::dotenv().ok();

    let args = Args::parse();

    {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
        if args.log_json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .init();
        }
    }

    let config = BrokerConfig::load_or_default(&args.config);
    let bus = Arc::new(NatsBus::connect(&config.bus_url.0).await?);
    let registry = Registry::new();

    match args.command {
        Command::Story => {
            let repo = Arc::new(SqliteStoryRepo::connect(&config.repo_url.0).await?);
            let kv = Arc::new(RedisKv::connect(&config.cache.l2_url).await?);
            let service = StoryService::build(&config, bus, repo, kv, &registry)?;
            service.clone().spawn_health_publisher();
            run_until_shutdown(&*service).await?;
        }
        Command::Vision => {
            let repo = Arc::new(SqliteVisionRepo::connect(&config.repo_url.0).await?);
            let service = AnalyzerService::build(&config, bus, repo, &registry)?;
            service.clone().spawn_health_publisher();
            run_until_shutdown(&service).await?;
        }
        Command::Collab => {
            let service = CollabService::build(&config, bus)?;
            service.clone().spawn_health_publisher();
            run_until_shutdown(&service).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
