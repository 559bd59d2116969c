//! CLI entry point for Pydra's Master.
//!
//! A single `master` subcommand wires persistence, the scheduler core, the
//! Node listener, and the Controller HTTP interface together and runs them
//! until terminated, the way `openintent-cli`'s `main.rs` dispatches to its
//! subcommands after loading configuration and initializing tracing.

mod config;
mod master;

use clap::{Parser, Subcommand};

use config::Config;

#[derive(Parser)]
#[command(name = "pydra", version, about = "Pydra distributed task scheduler")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "pydra.toml", global = true)]
    config: std::path::PathBuf,

    /// Override the bind host for both the Node listener and the
    /// Controller interface.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Override `RUST_LOG`/`LOG_LEVEL`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Master: scheduler core, Node listener, Controller interface.
    Master,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    init_tracing(&config.log_level);

    match cli.command {
        Command::Master => master::run(config).await,
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
