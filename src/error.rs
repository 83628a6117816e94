//! Error types for the chat server
//!
//! Defines connection-level errors, registry errors, delivery errors and
//! protocol parse errors. Uses thiserror for ergonomic error definitions.
//!
//! The `Display` text of the domain and protocol variants is exactly the
//! line sent back to the offending client.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// domain errors (reported to the client as a line of text).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Line framing error: oversized frame or invalid UTF-8 (fatal)
    #[error("framing error: {0}")]
    Frame(#[from] LinesCodecError),

    /// Outbound channel closed: the connection writer is gone (fatal)
    #[error("Channel send error")]
    ChannelSend,

    /// The registry actor is gone (fatal)
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Frame could not be decoded into a command
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// `CONNECT` without an alias
    #[error("alias cannot be empty")]
    EmptyAlias,

    /// Another live client already uses the alias
    #[error("alias '{0}' is already taken")]
    AliasTaken(String),

    /// Command other than `CONNECT` before registration
    #[error("alias not set; send CONNECT <alias> first")]
    AliasNotSet,

    /// Verb not valid in the current state
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Peer sent nothing within the idle timeout
    #[error("idle timeout; closing connection")]
    IdleTimeout,
}

impl AppError {
    /// Whether this error must be followed by closing the connection
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AppError::Parse(_) | AppError::AliasNotSet | AppError::UnknownCommand(_)
        )
    }
}

/// Registration errors returned by `ClientRegistry::try_register`
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("alias '{0}' is already taken")]
    AliasTaken(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<RegisterError> for AppError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::AliasTaken(alias) => AppError::AliasTaken(alias),
            RegisterError::Registry(e) => AppError::Registry(e),
        }
    }
}

/// Registry actor errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The actor task has stopped and no longer accepts commands
    #[error("client registry is closed")]
    Closed,
}

/// Per-member delivery errors
///
/// Occurs when a broadcast line cannot be queued on a member's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The member's outbound queue is full
    #[error("outbound queue full")]
    Full,
    /// The member's writer has already shut down
    #[error("connection closed")]
    Closed,
}

/// Frame decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Empty or whitespace-only frame
    #[error("empty command")]
    Empty,
    /// Structured frame that could not be decoded
    #[error("malformed command: {0}")]
    Malformed(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}
