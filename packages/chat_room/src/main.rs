use anyhow::{Context, Result};
use chat_gate::{AccessGate, CredentialStore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod cli;
mod config;
mod connection;
mod diagnostics;
mod fanout;
mod metrics;
mod protocol;
mod server;
mod session;

use crate::config::{ChatConfig, ChatRoomConfig, FileConfig, ServerConfig, load_config};
use crate::connection::ConnectionContext;
use crate::diagnostics::DiagnosticLog;
use crate::metrics::ServerMetrics;
use crate::session::{SessionBroker, SessionSettings};

#[derive(Parser)]
#[command(name = "chatroom")]
#[command(about = "Shared terminal chat room")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.chatroom)
    #[arg(long, global = true, env = "CHATROOM_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat broker in the foreground
    Server(ServerArgs),
}

#[derive(Parser)]
struct ServerArgs {
    /// Port to listen on (0 = auto-select); overrides config.toml
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to; overrides config.toml
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match ChatRoomConfig::new(cli.data_dir.clone()) {
        Ok(config) => match cli.command {
            // Bare `chatroom`: the forced entry point
            None => {
                init_entry_logging();
                cli::entry_command(&config).await
            }
            Some(Commands::Server(args)) => run_server(args, config).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("chatroom: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// stdout belongs to the chat; only warnings go to stderr.
fn init_entry_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

async fn run_server(args: ServerArgs, config: ChatRoomConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "chatroom=debug,chat_log=debug,chat_gate=debug,info"
    } else {
        "chatroom=info,chat_log=info,chat_gate=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting chat broker");

    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .context("Invalid configuration")?;
    let mut server_config = ServerConfig::from_file(&file_config.server);
    if let Some(host) = args.host {
        server_config.host = host;
    }
    if let Some(port) = args.port {
        server_config.port = port;
    }
    let chat = ChatConfig::from_file(&file_config);
    info!(
        "Chat config: backfill={} max_line={}B",
        chat.backfill_lines, chat.max_line_bytes
    );

    let credentials_path = config.credentials_path();
    let store = if credentials_path.exists() {
        CredentialStore::load(&credentials_path)?
    } else {
        warn!(
            "No credential file at {}; nobody can join",
            credentials_path.display()
        );
        CredentialStore::new()
    };
    info!("Loaded {} chat identities", store.len());

    let broker = SessionBroker::new(SessionSettings {
        log_path: config.chat_log_path(),
        backfill_lines: chat.backfill_lines,
        max_line_bytes: chat.max_line_bytes,
    });
    let ctx = ConnectionContext {
        gate: Arc::new(AccessGate::new(store)),
        broker: Arc::new(broker),
        diagnostics: Arc::new(DiagnosticLog::new(config.error_log_path())),
        metrics: Arc::new(ServerMetrics::new()),
        chat,
    };

    let addr = server_config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;

    // Write broker PID and port files so entry points can discover us
    cli::daemon::write_broker_files(&config, std::process::id(), actual_addr.port())?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal, cleaning up...");
        signal_token.cancel();
    });

    let server_result = server::serve(listener, ctx, shutdown).await;

    // Clean up broker files on shutdown
    cli::daemon::cleanup_broker_files(&config);

    info!("Shutdown complete");
    server_result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
