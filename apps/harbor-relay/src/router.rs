use harbor_proto::{AppEnvelope, ClientId, Envelope, Recipient, SignalEnvelope};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::ClientRegistry;
use crate::RelayError;

/// What happened to a routed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Unicast(ClientId),
    Broadcast(usize),
    Dropped,
}

/// Delivers frames between connected endpoints and announces roster changes.
///
/// Every registry mutation and every delivery runs under one lock, so a
/// roster broadcast always reflects a complete accept or disconnect and a
/// frame is never delivered to a client that a concurrent disconnect already
/// announced as gone.
#[derive(Clone, Default)]
pub struct EnvelopeRouter {
    registry: Arc<Mutex<ClientRegistry>>,
}

impl EnvelopeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection, sends it its identity, then announces the
    /// new roster to everyone.
    pub fn accept(&self, outbound: mpsc::UnboundedSender<String>) -> Result<ClientId, RelayError> {
        let mut registry = self.registry.lock();
        let id = registry.register(outbound)?;
        let assignment = Envelope::from(SignalEnvelope::client_id(id)).encode()?;
        if let Some(client) = registry.lookup(id) {
            client.deliver(&assignment);
        }
        broadcast_roster(&registry)?;
        info!(client_id = %id, clients = registry.len(), "client connected");
        Ok(id)
    }

    /// Forgets a connection and announces the new roster if it was known.
    pub fn disconnect(&self, id: ClientId) {
        let mut registry = self.registry.lock();
        if registry.unregister(id).is_none() {
            return;
        }
        info!(client_id = %id, clients = registry.len(), "client disconnected");
        if let Err(err) = broadcast_roster(&registry) {
            warn!(error = %err, "failed to announce roster");
        }
    }

    /// Forwards `frame` verbatim. Only the `to` key is read.
    pub fn route(&self, sender: ClientId, frame: &str) -> RouteOutcome {
        let value: Value = match serde_json::from_str(frame) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                warn!(client_id = %sender, "dropping non-object frame");
                return RouteOutcome::Dropped;
            }
            Err(err) => {
                warn!(client_id = %sender, error = %err, "dropping malformed frame");
                return RouteOutcome::Dropped;
            }
        };

        let registry = self.registry.lock();
        match Recipient::of(&value) {
            Recipient::Unicast(to) => match registry.lookup(to) {
                Some(client) => {
                    debug!(from = %sender, to = %to, "unicast");
                    client.deliver(frame);
                    RouteOutcome::Unicast(to)
                }
                None => {
                    debug!(from = %sender, to = %to, "recipient not connected, dropping");
                    RouteOutcome::Dropped
                }
            },
            Recipient::Broadcast => {
                let mut delivered = 0;
                for client in registry.clients() {
                    if client.deliver(frame) {
                        delivered += 1;
                    }
                }
                debug!(from = %sender, delivered, "broadcast");
                RouteOutcome::Broadcast(delivered)
            }
            Recipient::Unresolvable => {
                debug!(from = %sender, "unresolvable recipient, dropping");
                RouteOutcome::Dropped
            }
        }
    }

    /// Sends the current roster to every connected client.
    pub fn broadcast_roster(&self) -> Result<(), RelayError> {
        broadcast_roster(&self.registry.lock())
    }

    pub fn roster(&self) -> Vec<ClientId> {
        self.registry.lock().snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.registry.lock().len()
    }
}

fn broadcast_roster(registry: &ClientRegistry) -> Result<(), RelayError> {
    let roster = registry.snapshot();
    let frame = Envelope::from(AppEnvelope::roster(&roster)).encode()?;
    for client in registry.clients() {
        client.deliver(&frame);
    }
    debug!(clients = roster.len(), "roster announced");
    Ok(())
}
