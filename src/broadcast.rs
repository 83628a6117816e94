//! Broadcast fan-out
//!
//! Delivers one message to every registered client, sender included.

use tracing::{debug, warn};

use crate::error::{DeliveryError, RegistryError};
use crate::message::WireFormat;
use crate::registry::ClientRegistry;

/// Outcome of one broadcast call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Members whose mailbox accepted the line
    pub delivered: usize,
    /// Members that could not be reached, with the reason
    pub failed: Vec<(String, DeliveryError)>,
}

/// Fans messages out over a registry snapshot
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: ClientRegistry,
    format: WireFormat,
}

impl Broadcaster {
    pub fn new(registry: ClientRegistry, format: WireFormat) -> Self {
        Self { registry, format }
    }

    /// Deliver `content` from `from` to every current member
    ///
    /// Members already closing are skipped and reported as closed. A failing
    /// member never stops delivery to the rest. A member whose
    /// mailbox is full is told to disconnect; its own handler does the
    /// cleanup. The registry is only read here.
    pub async fn broadcast(
        &self,
        from: &str,
        content: &str,
    ) -> Result<DeliveryReport, RegistryError> {
        let members = self.registry.snapshot_members().await?;
        let line = self.format.encode(from, content);
        let mut report = DeliveryReport::default();

        for member in &members {
            if member.is_closed() {
                debug!("'{}' is already closing, skipped", member.alias);
                report
                    .failed
                    .push((member.alias.to_string(), DeliveryError::Closed));
                continue;
            }

            match member.deliver(line.clone()) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Full) => {
                    warn!(
                        "outbound queue full for '{}', disconnecting slow client",
                        member.alias
                    );
                    member.disconnect();
                    report.failed.push((member.alias.to_string(), DeliveryError::Full));
                }
                Err(DeliveryError::Closed) => {
                    debug!("'{}' closed before delivery", member.alias);
                    report
                        .failed
                        .push((member.alias.to_string(), DeliveryError::Closed));
                }
            }
        }

        debug!(
            "broadcast from '{}': delivered {}, failed {}",
            from,
            report.delivered,
            report.failed.len()
        );
        Ok(report)
    }
}
