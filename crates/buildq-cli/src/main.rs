//! buildq command-line entrypoint.

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod client;
mod commands;
mod config;
mod handlers;
mod serve;

use client::ApiClient;
use commands::{Commands, OutputFormat};
use config::ServerConfig;

#[derive(Parser)]
#[command(name = "buildq")]
#[command(author, version, about = "Distributed build task scheduler", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Scheduler API URL
    #[arg(long, global = true, env = "BUILDQ_URL", default_value = "http://localhost:9090")]
    url: String,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let client = ApiClient::new(&cli.url);
    match cli.command {
        Commands::Serve { config } => {
            let config = ServerConfig::load(config.as_deref())?;
            serve::serve(config).await?
        }
        Commands::Builds { tasks } => handlers::list_builds(&client, cli.output, tasks).await?,
        Commands::Workers => handlers::list_workers(&client, cli.output).await?,
        Commands::Cancel { build_id } => handlers::cancel(&client, &build_id).await?,
        Commands::Reschedule => handlers::reschedule(&client).await?,
        Commands::Logs { instance } => handlers::logs(&client, &instance).await?,
    }

    Ok(())
}
