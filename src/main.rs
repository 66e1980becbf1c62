use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use tunshare::config::Settings;
use tunshare::{connect, lifecycle, share};

#[derive(Parser, Debug)]
#[command(author, version, about = "Share a machine with anyone through a relay tunnel.")]
struct Args {
    /// Settings file (defaults to ~/.tunshare/config.yml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Share a machine through the relay.
    Share(share::Args),
    /// Connect to a machine shared with `tunshare share`.
    Connect(connect::Args),
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(args));

    // An interrupted password prompt may still hold a blocking thread
    runtime.shutdown_background();
    result
}

async fn run(args: Args) -> Result<()> {

    // Create ~/.tunshare if it doesn't exist
    let data_dir = Settings::data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("tunshare.log");

    // Both subcommands are interactive, so logs only go to the file
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .init();

    // Load settings and set up Ctrl-C handling
    let settings = Settings::load(args.config.as_deref())?;
    let token = lifecycle::install_interrupt_handler()?;

    match args.command {
        Commands::Share(share_args) => {
            info!("Starting tunshare share");
            share::run_share(share_args, settings, token).await
        }
        Commands::Connect(connect_args) => {
            info!("Starting tunshare connect");
            connect::run_connect(connect_args, settings, token).await
        }
    }
}
