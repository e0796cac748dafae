//! rpc-presence CLI - keeps a chat-client presence activity alive.
//!
//! This is the main binary entry point. See the `rpc_presence` library for
//! the engine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rpc_presence::{
    build_activity, set_activity_args, ActivityClock, Config, PresenceClient, PresenceConfig,
    SessionEvent,
};

/// Crate version reported by `--version`.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "rpc-presence")]
#[command(version = VERSION)]
#[command(about = "Publish a presence activity to the local chat client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, publish the presence and keep it alive until interrupted
    Run {
        /// Path to a presence JSON file
        #[arg(long)]
        presence: PathBuf,
    },
    /// Print the SET_ACTIVITY arguments a presence file produces
    Preview {
        /// Path to a presence JSON file
        #[arg(long)]
        presence: PathBuf,
    },
    /// Show or change engine configuration
    Config {
        key: Option<String>,
        value: Option<String>,
    },
}

fn load_presence(path: &Path) -> Result<PresenceConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read presence file {}", path.display()))?;
    let config: PresenceConfig = serde_json::from_str(&content)
        .with_context(|| format!("Invalid presence file {}", path.display()))?;
    if config.application_id.is_empty() {
        anyhow::bail!("Presence file {} has no application_id", path.display());
    }
    Ok(config)
}

async fn run(presence_path: &Path) -> Result<()> {
    let presence = load_presence(presence_path)?;
    let config = Config::load()?;
    let client = PresenceClient::spawn(config.engine_settings())?;
    let mut events = client.subscribe();

    println!("Connecting for application {}...", presence.application_id);
    client.connect(presence).await?;
    println!("Connected. Press Ctrl-C to clear the activity and exit.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged { to, .. }) => println!("state: {to}"),
                Ok(SessionEvent::Error(e)) => eprintln!("error: {e}"),
                Ok(SessionEvent::ActivityPublished) => log::debug!("Activity published"),
                Ok(SessionEvent::ReconnectScheduled { delay_ms }) => {
                    println!("reconnecting in {}s", delay_ms / 1000);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Dropped {} session events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    println!("Shutting down...");
    client.shutdown().await;
    Ok(())
}

fn preview(presence_path: &Path) -> Result<()> {
    let presence = load_presence(presence_path)?;
    let now = chrono::Utc::now().timestamp();
    let activity = build_activity(&presence, &ActivityClock::now(Some(now), now));
    let args = set_activity_args(std::process::id(), Some(&activity));
    println!("{}", serde_json::to_string_pretty(&args)?);
    Ok(())
}

fn config_command(key: Option<String>, value: Option<String>) -> Result<()> {
    let mut config = Config::load()?;
    match (key, value) {
        (None, _) => println!("{}", serde_json::to_string_pretty(&config)?),
        (Some(k), None) => println!("{}", config.get(&k)?),
        (Some(k), Some(v)) => {
            config.set(&k, &v)?;
            config.save()?;
            println!("{} = {}", k, config.get(&k)?);
        }
    }
    Ok(())
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    // RPC_PRESENCE_LOG_FILE keeps log lines out of the status output
    if let Ok(path) = std::env::var("RPC_PRESENCE_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { presence } => run(&presence).await?,
        Commands::Preview { presence } => preview(&presence)?,
        Commands::Config { key, value } => config_command(key, value)?,
    }

    Ok(())
}
