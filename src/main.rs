mod config;
mod dispatch;
mod error;
mod providers;
mod server;
mod storage;
mod usage;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::GatewayConfig;
use dispatch::ReplyAssembler;
use providers::claude::ClaudeProvider;
use server::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::Storage;
use tokio::signal;
use tracing::{error, info};
use usage::{RolloverTicker, UsageLedger};

#[derive(Parser)]
#[command(name = "chatgate", version, about = "Chat gateway for the Anthropic Messages API")]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Path to the config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Override server.host
        #[arg(long)]
        host: Option<String>,
        /// Override server.port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show recorded weekly token usage
    Usage,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (API key masked)
    Show,
    /// Print the config file location
    Path,
}

/// JSON envelope for non-interactive output
fn json_output(success: bool, data: serde_json::Value, error: Option<&str>) -> String {
    serde_json::json!({
        "success": success,
        "data": data,
        "error": error,
    })
    .to_string()
}

fn init_logging(json_mode: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chatgate=info,tower_http=info"));

    if json_mode {
        // Keep stdout clean for the JSON envelope
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    } else if std::env::var("CHATGATE_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.json);

    let config_path = cli.config.as_deref();
    let outcome = match cli.command {
        Commands::Serve { host, port } => run_serve(config_path, host, port).await,
        Commands::Usage => run_usage(config_path, cli.json).await,
        Commands::Config { action } => run_config(config_path, action, cli.json),
    };

    if let Err(e) = outcome {
        if cli.json {
            println!("{}", json_output(false, serde_json::Value::Null, Some(&format!("{:#}", e))));
            std::process::exit(1);
        }
        return Err(e);
    }

    Ok(())
}

async fn run_serve(config_path: Option<&std::path::Path>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = GatewayConfig::load(config_path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;

    let api_key = config.require_api_key()?;
    let provider = Arc::new(ClaudeProvider::new(&config.upstream, api_key)?);
    let assembler = ReplyAssembler::new(provider, config.chunking.ceiling_bytes)
        .with_retries(config.upstream.max_retries, Duration::from_secs(1));

    let ledger = Arc::new(UsageLedger::new(config.usage.unit_cost, Utc::now()));
    let storage = Storage::from_config(&config)?;

    info!(
        model = %config.upstream.model,
        ceiling_bytes = config.chunking.ceiling_bytes,
        backend = ?config.storage.backend,
        "Starting gateway"
    );

    let ticker = RolloverTicker::spawn(
        ledger.clone(),
        storage.usage.clone(),
        Duration::from_secs(config.usage.rollover_check_secs),
    );

    let state = AppState {
        assembler: Arc::new(assembler),
        ledger,
        storage,
        default_system_prompt: Arc::from(config.chat.default_system_prompt.as_str()),
    };

    let served = server::serve(addr, state, shutdown_signal()).await;
    ticker.stop().await;
    served?;

    Ok(())
}

async fn run_usage(config_path: Option<&std::path::Path>, json_mode: bool) -> Result<()> {
    let config = GatewayConfig::load(config_path)?;
    let storage = Storage::from_config(&config)?;
    let records = storage.usage.list_desc().await?;

    if json_mode {
        println!("{}", json_output(true, serde_json::to_value(&records)?, None));
        return Ok(());
    }

    if records.is_empty() {
        println!("No weekly usage recorded yet.");
        return Ok(());
    }

    println!(
        "{:<12} {:<12} {:>12} {:>12} {:>12} {:>10}",
        "Week start", "Week end", "Input", "Output", "Total", "Cost"
    );
    for r in &records {
        println!(
            "{:<12} {:<12} {:>12} {:>12} {:>12} {:>10.4}",
            r.start_date.to_string(),
            r.end_date.to_string(),
            r.input_tokens,
            r.output_tokens,
            r.total_tokens,
            r.total_cost
        );
    }

    Ok(())
}

fn run_config(config_path: Option<&std::path::Path>, action: ConfigAction, json_mode: bool) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = GatewayConfig::load(config_path)?;
            if json_mode {
                let mut shown = serde_json::to_value(&config)?;
                if config.upstream.api_key.is_some() {
                    shown["upstream"]["api_key"] = serde_json::json!("********");
                }
                println!("{}", json_output(true, shown, None));
            } else {
                print!("{}", config.to_redacted_toml()?);
            }
        }
        ConfigAction::Path => {
            let path = match config_path {
                Some(p) => p.to_path_buf(),
                None => config::default_config_path()?,
            };
            if json_mode {
                println!("{}", json_output(true, serde_json::json!({ "path": path }), None));
            } else {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
