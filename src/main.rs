//! Broadcast Chat Server - Entry Point
//!
//! Parses configuration, starts the TCP listener and accepts connections.

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use broadcast_chat_server::{ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=broadcast_chat_server=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("broadcast_chat_server=info")),
        )
        .init();

    let config = ServerConfig::new();

    let listener = TcpListener::bind(&config.bind).await?;
    info!(
        "Broadcast Chat Server v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        config.bind
    );

    ChatServer::new(config).serve(listener).await;

    Ok(())
}
