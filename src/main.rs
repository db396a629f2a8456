#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # portrelay
//!
//! Device-side tunnel agent. Keeps an outbound WebSocket to a relay and
//! serves the HTTP requests and WebSocket sessions the relay multiplexes over
//! it from endpoints on the device or its LAN.
//!
//! ## Subcommands
//!
//! - `portrelay run` (default) runs the agent until SIGINT or SIGTERM
//! - `portrelay resolve <path>` prints the local URLs a path would be tried at

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use portrelay::tunnel::codec::PathType;
use portrelay::tunnel::resolver::Resolver;
use portrelay::{Agent, Config};

/// Device-side relay tunnel agent.
#[derive(Parser)]
#[command(name = "portrelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the relay and serve tunneled streams (default).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Show the candidate local URLs for a request path.
    Resolve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Request path such as `/api/status`, or an absolute URL.
        path: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { config: None }) {
        Commands::Run { config } => run_agent(config.as_deref()).await,
        Commands::Resolve { config, path } => resolve(config.as_deref(), &path),
    }
}

fn load_config(path: Option<&str>) -> Option<Config> {
    match Config::load(path) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("portrelay: {e}");
            None
        }
    }
}

async fn run_agent(config_path: Option<&str>) -> ExitCode {
    let Some(config) = load_config(config_path) else {
        return ExitCode::FAILURE;
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("portrelay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Device identity: {}", config.agent.identity);

    if config.relay.url.is_empty() {
        error!("No relay URL configured; set relay.url or PORTRELAY_RELAY_URL");
        return ExitCode::FAILURE;
    }
    if config.agent.identity.is_empty() {
        warn!("Agent identity is empty, the relay will likely reject the handshake");
    }

    let agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to initialize tunnel: {e}");
            return ExitCode::FAILURE;
        }
    };
    let stats = agent.stats();

    tokio::select! {
        () = agent.run() => {}
        () = shutdown_signal() => {}
    }

    info!("Shutting down...");
    info!("Tunnel stats: {}", stats.snapshot());
    info!("Goodbye");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

fn resolve(config_path: Option<&str>, path: &str) -> ExitCode {
    let Some(config) = load_config(config_path) else {
        return ExitCode::FAILURE;
    };
    let resolver = Resolver::new(&config.local);
    let path_type = PathType::of(path);

    println!("local host: {}", resolver.local_host());
    if let Some(ip) = resolver.lan_ip() {
        println!("lan ip:     {ip}");
    }
    println!("http:");
    for candidate in resolver.http_candidates(path, path_type) {
        println!("  {:<10} {}", candidate.label, candidate.url);
    }
    println!("websocket:");
    for candidate in resolver.ws_candidates(path, path_type) {
        println!("  {:<10} {}", candidate.label, candidate.url);
    }
    ExitCode::SUCCESS
}
