//! chatrelay: agent-side relay client.
//!
//! Dials the gateway, keeps the session alive and hands every relayed
//! message to the configured agent.

mod agent;
mod commands;
mod config;

use clap::{Parser, Subcommand};

/// chatrelay: agent-side client for the chat relay gateway
#[derive(Parser)]
#[command(name = "chatrelay", version, about = "Agent-side client for the chat relay gateway")]
struct Cli {
    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the gateway and relay messages until interrupted
    Run,

    /// Validate the config file and print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .as_deref()
        .map(config::expand_tilde)
        .unwrap_or_else(config::default_path);

    let result = match cli.command {
        Command::Run => commands::run::run(&config_path).await,
        Command::CheckConfig => commands::check::run(&config_path),
    };

    if let Err(e) = result {
        eprintln!("chatrelay: {e:#}");
        std::process::exit(1);
    }
}
