//! EventConnect CLI - terminal client for EventConnect realtime chat.
//!
//! Provides an interactive chat session, history paging and local
//! configuration management.

mod commands;
mod output;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use eventconnect_core::config::ClientConfig;
use eventconnect_core::telemetry::init_telemetry;

use commands::{chat, config, history, Context};
use output::OutputFormat;

/// EventConnect - realtime chat from the terminal
#[derive(Parser)]
#[command(
    name = "eventconnect",
    version,
    about = "EventConnect realtime chat client",
    long_about = "Chat in EventConnect conversations, page through message history and manage local settings.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Client configuration file (toml, yaml or json)
    #[arg(short, long, global = true, env = "EVENTCONNECT_CONFIG")]
    config: Option<String>,

    /// REST API base URL
    #[arg(long, global = true, env = "EVENTCONNECT_API_URL")]
    api_url: Option<String>,

    /// WebSocket URL
    #[arg(long, global = true, env = "EVENTCONNECT_WS_URL")]
    ws_url: Option<String>,

    /// Bearer token used for the socket handshake and REST calls
    #[arg(long, global = true, env = "EVENTCONNECT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log level filter (overrides config)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a conversation and chat interactively
    Chat(chat::ChatArgs),

    /// Show a page of message history
    History(history::HistoryArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let settings = cli_settings(&cli);
    let result = match cli.command {
        Commands::Config(cmd) => config::execute(cmd, settings.format).await,
        Commands::Chat(args) => match build_context(&settings) {
            Ok(ctx) => chat::execute(args, ctx).await,
            Err(e) => Err(e),
        },
        Commands::History(args) => match build_context(&settings) {
            Ok(ctx) => history::execute(args, ctx).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

/// Global flags that feed the client configuration.
struct Settings {
    config: Option<String>,
    api_url: Option<String>,
    ws_url: Option<String>,
    token: Option<String>,
    log_level: Option<String>,
    format: OutputFormat,
}

fn cli_settings(cli: &Cli) -> Settings {
    Settings {
        config: cli.config.clone(),
        api_url: cli.api_url.clone(),
        ws_url: cli.ws_url.clone(),
        token: cli.token.clone(),
        log_level: cli.log_level.clone(),
        format: cli.output,
    }
}

/// Flags win over stored values, which win over the config file.
fn build_context(settings: &Settings) -> Result<Context> {
    let mut client_config = match &settings.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => ClientConfig::load().context("Failed to load config from environment")?,
    };

    if let Some(url) = settings.api_url.clone().or_else(|| config::stored_value("api-url")) {
        client_config.server.api_url = url;
    }
    if let Some(url) = settings.ws_url.clone().or_else(|| config::stored_value("ws-url")) {
        client_config.server.ws_url = url;
    }
    if let Some(level) = settings.log_level.clone() {
        client_config.logging.level = level;
    }

    init_telemetry(&client_config.logging)?;
    tracing::debug!(
        ws_url = %client_config.server.ws_url,
        api_url = %client_config.server.api_url,
        "Configuration resolved"
    );

    Ok(Context {
        token: settings.token.clone().or_else(|| config::stored_value("token")),
        user_id: config::stored_value("user-id"),
        config: client_config,
        format: settings.format,
    })
}
