//! Client struct definition
//!
//! Represents a registered participant: its alias plus the handles needed to
//! reach its connection (outbound mailbox and disconnect token).

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;
use crate::types::{Alias, ConnectionId};

/// Item queued on a connection's outbound mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded line, delimiter included
    Line(String),
    /// Flush what is queued, then close the transport
    Close,
}

/// Registered client
///
/// Cloning yields another handle to the same connection. The registry keeps
/// one, and the broadcaster borrows clones for the length of a single call.
#[derive(Debug, Clone)]
pub struct Client {
    /// Alias this client registered under
    pub alias: Alias,
    /// Connection that owns the alias
    pub id: ConnectionId,
    /// Server → Client line channel
    sender: mpsc::Sender<Outbound>,
    /// Cancelled when the connection must be torn down
    closer: CancellationToken,
}

impl Client {
    /// Create a new client with the given sender channel and disconnect token
    pub fn new(
        alias: Alias,
        id: ConnectionId,
        sender: mpsc::Sender<Outbound>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            alias,
            id,
            sender,
            closer,
        }
    }

    /// Queue a line without waiting
    ///
    /// Returns an error if the mailbox is full or the writer is gone.
    pub fn deliver(&self, line: String) -> Result<(), DeliveryError> {
        self.sender
            .try_send(Outbound::Line(line))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Ask this client's connection handler to close
    pub fn disconnect(&self) {
        self.closer.cancel();
    }

    /// Check whether the connection is closing or gone
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.sender.is_closed()
    }
}
