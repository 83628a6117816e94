//! TCP listener
//!
//! Accepts connections and spawns one handler task per connection, each
//! with a handle to the shared registry. No protocol logic lives here.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::registry::ClientRegistry;

/// Listening chat server
pub struct ChatServer {
    listener: TcpListener,
    registry: ClientRegistry,
    config: Arc<ServerConfig>,
}

impl ChatServer {
    /// Bind the configured address and start the registry actor
    pub async fn bind(config: ServerConfig) -> Result<Self, AppError> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        Ok(Self::from_listener(listener, config))
    }

    /// Serve on an already bound listener
    pub fn from_listener(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: ClientRegistry::spawn(),
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the registry shared by every connection
    pub fn registry(&self) -> ClientRegistry {
        self.registry.clone()
    }

    /// Accept connections until `shutdown` completes
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer {
            listener,
            registry,
            config,
        } = self;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => spawn_handler(stream, peer, &registry, &config),
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    /// Accept connections until Ctrl-C
    pub async fn run(self) -> Result<(), AppError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to install ctrl-c handler: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn spawn_handler(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &ClientRegistry,
    config: &Arc<ServerConfig>,
) {
    info!("New connection from {}", peer);
    let registry = registry.clone();
    let config = Arc::clone(config);

    tokio::spawn(
        async move {
            if let Err(e) = handle_connection(stream, registry, config).await {
                error!("Connection handler error: {}", e);
            }
        }
        .instrument(info_span!("peer", %peer)),
    );
}
