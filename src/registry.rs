//! Client registry actor
//!
//! The single owner of alias → client membership. Connection handlers talk
//! to it through a cloneable `ClientRegistry` handle. Every operation is a
//! command processed one at a time by `RegistryActor`, so check-and-insert,
//! removal and snapshots never interleave.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::client::Client;
use crate::error::{RegisterError, RegistryError};

/// Channel buffer size for registry commands
const COMMAND_BUFFER_SIZE: usize = 256;

/// Commands sent from handles to the registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Insert the client unless its alias is taken
    Register {
        client: Client,
        reply: oneshot::Sender<Result<Client, RegisterError>>,
    },
    /// Remove the alias if present
    Unregister {
        alias: String,
        reply: oneshot::Sender<bool>,
    },
    /// Copy current members
    Snapshot {
        reply: oneshot::Sender<Vec<Client>>,
    },
    /// Check membership of one alias
    IsRegistered {
        alias: String,
        reply: oneshot::Sender<bool>,
    },
    /// Count members
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// The registry actor
///
/// Owns the membership map and processes commands until every handle is dropped.
pub struct RegistryActor {
    /// Registered clients: alias -> Client
    members: BTreeMap<String, Client>,
    /// Command receiver channel
    receiver: mpsc::Receiver<RegistryCommand>,
}

impl RegistryActor {
    /// Create a new RegistryActor with the given command receiver
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        Self {
            members: BTreeMap::new(),
            receiver,
        }
    }

    /// Run the registry event loop
    pub async fn run(mut self) {
        debug!("registry started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        debug!("registry shutting down");
    }

    /// Process a single command
    ///
    /// A dropped reply receiver only means the caller went away; the
    /// mutation still stands.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register { client, reply } => {
                let _ = reply.send(self.register(client));
            }
            RegistryCommand::Unregister { alias, reply } => {
                let _ = reply.send(self.unregister(&alias));
            }
            RegistryCommand::Snapshot { reply } => {
                let _ = reply.send(self.members.values().cloned().collect());
            }
            RegistryCommand::IsRegistered { alias, reply } => {
                let _ = reply.send(self.members.contains_key(&alias));
            }
            RegistryCommand::Count { reply } => {
                let _ = reply.send(self.members.len());
            }
        }
    }

    fn register(&mut self, client: Client) -> Result<Client, RegisterError> {
        let alias = client.alias.as_str().to_string();
        if self.members.contains_key(&alias) {
            debug!("alias '{}' rejected, already taken", alias);
            return Err(RegisterError::AliasTaken(alias));
        }

        info!("client '{}' registered (connection {})", alias, client.id);
        self.members.insert(alias, client.clone());
        debug!("Total clients: {}", self.members.len());
        Ok(client)
    }

    fn unregister(&mut self, alias: &str) -> bool {
        match self.members.remove(alias) {
            Some(client) => {
                info!("client '{}' unregistered (connection {})", alias, client.id);
                debug!("Total clients: {}", self.members.len());
                true
            }
            None => false,
        }
    }
}

/// Handle to the registry actor
///
/// Cheap to clone; all clones talk to the same actor.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    sender: mpsc::Sender<RegistryCommand>,
}

impl ClientRegistry {
    /// Start a registry actor on the current runtime and return its handle
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER_SIZE);
        tokio::spawn(RegistryActor::new(receiver).run());
        Self { sender }
    }

    #[cfg(test)]
    pub(crate) fn from_sender(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Register `client` under its alias
    ///
    /// Atomic: of several concurrent calls with the same alias exactly one
    /// succeeds.
    pub async fn try_register(&self, client: Client) -> Result<Client, RegisterError> {
        self.request(|reply| RegistryCommand::Register { client, reply })
            .await?
    }

    /// Remove `alias`; returns whether an entry was removed
    ///
    /// Removing an absent alias is a no-op.
    pub async fn unregister(&self, alias: &str) -> Result<bool, RegistryError> {
        let alias = alias.to_string();
        self.request(|reply| RegistryCommand::Unregister { alias, reply })
            .await
    }

    /// Point-in-time copy of all members, ordered by alias
    pub async fn snapshot_members(&self) -> Result<Vec<Client>, RegistryError> {
        self.request(|reply| RegistryCommand::Snapshot { reply })
            .await
    }

    pub async fn is_registered(&self, alias: &str) -> Result<bool, RegistryError> {
        let alias = alias.to_string();
        self.request(|reply| RegistryCommand::IsRegistered { alias, reply })
            .await
    }

    pub async fn member_count(&self) -> Result<usize, RegistryError> {
        self.request(|reply| RegistryCommand::Count { reply })
            .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| RegistryError::Closed)?;
        response.await.map_err(|_| RegistryError::Closed)
    }
}
