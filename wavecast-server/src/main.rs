use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing::info;
use wavecast_server::{AppState, ChatManager, ServerConfig, create_router};

#[derive(Parser, Debug)]
#[command(name = "wavecast-server")]
#[command(about = "Wavecast - In-Memory Live Stream Chat Service", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if std::path::Path::new(&args.config).exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        info!("Config file not found, using defaults");
        ServerConfig::default()
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Chat limits come from CHAT_* environment variables (Docker support)
    config.chat.apply_env(|name| std::env::var(name).ok());

    // Initialize tracing based on config
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());

    match config.logging.format.as_str() {
        "json" => {
            // JSON format for production (structured logging)
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
                .with_target(true)
                .with_thread_ids(true)
                .with_current_span(true)
                .init();
        }
        _ => {
            // Pretty format for development (human-readable)
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
                .with_target(true)
                .init();
        }
    }

    info!("Starting Wavecast Server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Chat limits: {} MB memory, {} messages/stream, {} users/stream",
        config.chat.max_memory_mb,
        config.chat.max_messages_per_stream,
        config.chat.max_users_per_stream
    );

    // Chat manager owns the room directory and the background workers
    let manager = ChatManager::new(config.chat.clone());
    manager.clone().start_workers();

    let app = create_router(AppState {
        manager: manager.clone(),
    });

    // Bind server
    let addr: SocketAddr = config.server_addr().parse()?;
    info!("Listening on http://{}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
