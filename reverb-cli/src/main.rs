//! Reverb CLI - Command-line client for Pusher-protocol broadcast servers.
//!
//! Useful for watching channels from a terminal, poking a server with client
//! events, and checking subscription signatures while debugging a backend.

mod commands;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use reverb_core::config::ReverbConfig;
use reverb_core::logging;

/// Reverb - broadcast channel client.
#[derive(Parser)]
#[command(
    name = "reverb",
    version,
    about = "Pusher-protocol broadcast client CLI",
    long_about = "A command-line client for Laravel Reverb and other Pusher-protocol servers.\n\
                   Credentials come from the config file and REVERB_* environment variables."
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json).
    #[arg(short = 'f', long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON output for scripting.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to channels and print every event until Ctrl+C.
    Listen {
        /// Channel to subscribe to (repeatable).
        #[arg(short = 'C', long = "channel", required = true)]
        channels: Vec<String>,
        /// User id presented on presence channels.
        #[arg(long)]
        user_id: Option<String>,
        /// User info JSON presented on presence channels.
        #[arg(long)]
        user_info: Option<String>,
    },
    /// Send a client event on a private or presence channel.
    Trigger {
        /// Channel to send on.
        #[arg(short = 'C', long)]
        channel: String,
        /// Event name; the client- prefix is added when missing.
        #[arg(short, long)]
        event: String,
        /// Event payload as JSON.
        #[arg(short, long, default_value = "{}")]
        data: String,
        /// User id presented on presence channels.
        #[arg(long)]
        user_id: Option<String>,
        /// User info JSON presented on presence channels.
        #[arg(long)]
        user_info: Option<String>,
        /// Seconds to wait for the subscription acknowledgement.
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Print the subscription signature for a socket and channel.
    Sign {
        /// Socket id issued by the server.
        #[arg(short, long)]
        socket_id: String,
        /// Channel name.
        #[arg(short = 'C', long)]
        channel: String,
        /// Presence identity JSON, e.g. '{"user_id":"1","user_info":{}}'.
        #[arg(short, long)]
        user_data: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let json_logs = cli.format == OutputFormat::Json;
    let _guard = logging::init_logging(log_level, &logging::default_log_dir(), json_logs)?;

    let config = load_config(cli.config.as_deref())?;

    info!(
        "Reverb CLI v{}",
        reverb_core::constants::CLIENT_VERSION
    );

    // Dispatch to command handlers
    match cli.command {
        Commands::Listen {
            channels,
            user_id,
            user_info,
        } => {
            let identity = commands::presence_identity(user_id, user_info.as_deref())?;
            commands::listen::run(config, channels, identity, cli.format).await
        }
        Commands::Trigger {
            channel,
            event,
            data,
            user_id,
            user_info,
            timeout,
        } => {
            let identity = commands::presence_identity(user_id, user_info.as_deref())?;
            let data = commands::parse_json(&data, "--data")?;
            let options = commands::trigger::TriggerOptions {
                channel,
                event,
                data,
                identity,
                ack_timeout: std::time::Duration::from_secs(timeout),
            };
            commands::trigger::run(config, options, cli.format).await
        }
        Commands::Sign {
            socket_id,
            channel,
            user_data,
        } => {
            let user_data = user_data
                .as_deref()
                .map(|raw| commands::parse_json(raw, "--user-data"))
                .transpose()?;
            commands::sign::run(config, &socket_id, &channel, user_data, cli.format)
        }
    }
}

/// Load the config file (explicit path, else the default location if it
/// exists), then apply `REVERB_*` environment overrides.
fn load_config(path: Option<&Path>) -> anyhow::Result<ReverbConfig> {
    let mut config = match path {
        Some(path) => ReverbConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let default_path = ReverbConfig::default_config_path()?;
            if default_path.exists() {
                debug!("loading config from {}", default_path.display());
                ReverbConfig::load_from_file(&default_path)?
            } else {
                ReverbConfig::default()
            }
        }
    };

    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}
