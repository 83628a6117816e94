//! Alias Chat Server Library
//!
//! A line-protocol chat server: clients connect over TCP, register a unique
//! alias with `CONNECT <alias>`, and every `MESSAGE <content>` is fanned out
//! to all registered clients as `<alias>: <content>`.
//!
//! # Architecture
//! - `ClientRegistry` is a handle to an actor task that owns alias
//!   membership; all mutations and snapshots are serialized through it
//! - Each connection runs `handle_connection` on its own task, plus a writer
//!   task draining that connection's outbound mailbox
//! - `Broadcaster` snapshots the registry and queues a line on every member's
//!   mailbox without waiting on slow receivers
//! - `ChatServer` accepts connections and spawns handlers
//!
//! # Example
//! ```ignore
//! use alias_chat::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ChatServer::bind(ServerConfig::default()).await.unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod registry;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use broadcast::{Broadcaster, DeliveryReport};
pub use client::{Client, Outbound};
pub use config::ServerConfig;
pub use error::{AppError, ConfigError, DeliveryError, ParseError, RegisterError, RegistryError};
pub use handler::{handle_connection, ConnectionState};
pub use message::{Command, WireFormat};
pub use registry::ClientRegistry;
pub use server::ChatServer;
pub use types::{Alias, ConnectionId};
