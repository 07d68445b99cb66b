//! Keel trading coordination engine entry point.

use clap::Parser;
use tracing::{error, info};

use keel_bot::{AppConfig, AppResult, Application};

#[derive(Parser, Debug)]
#[command(name = "keel-bot")]
#[command(about = "Real-time trading coordination engine")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = Args::parse();

    keel_telemetry::init_logging()?;

    let config = match args.config {
        Some(path) => AppConfig::from_file(&path)?,
        None => AppConfig::load()?,
    };
    info!(symbols = ?config.venue.symbols, "configuration loaded");

    let app = Application::new(config)?;
    if let Err(e) = app.run().await {
        error!(error = %e, "application exited with error");
        return Err(e);
    }
    Ok(())
}
