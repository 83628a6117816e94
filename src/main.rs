//! Alias chat server - Entry Point
//!
//! Loads configuration, binds the listener and serves until Ctrl-C.

use std::env;

use tracing::info;
use tracing_subscriber::EnvFilter;

use alias_chat::{ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=alias_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("alias_chat=info")),
        )
        .init();

    // CHAT_* environment variables, then an optional port argument
    let config = ServerConfig::from_env()?.with_port_arg(env::args().nth(1))?;

    let server = ChatServer::bind(config.clone()).await?;
    info!(
        "Chat server listening on {} ({:?} format)",
        server.local_addr()?,
        config.wire_format
    );

    server.run().await?;
    info!("Chat server stopped");

    Ok(())
}
