use harbor_proto::ClientId;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::RelayError;

/// A connected endpoint and the queue feeding its socket writer.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    id: ClientId,
    outbound: mpsc::UnboundedSender<String>,
}

impl RegisteredClient {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queues a frame for the client's socket. Returns false once the writer
    /// has gone away; the connection handler cleans up on its own.
    pub fn deliver(&self, frame: &str) -> bool {
        self.outbound.send(frame.to_string()).is_ok()
    }
}

/// Authoritative set of connected endpoints.
///
/// Plain data: the router owns it behind a lock and decides when roster
/// changes are announced.
#[derive(Debug)]
pub struct ClientRegistry {
    next_id: Option<ClientId>,
    clients: BTreeMap<ClientId, RegisteredClient>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self {
            next_id: Some(ClientId::FIRST),
            clients: BTreeMap::new(),
        }
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next identity. Identities are never handed out twice, even
    /// after the client holding one disconnects.
    pub fn register(
        &mut self,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<ClientId, RelayError> {
        let id = self.next_id.ok_or(RelayError::IdentitiesExhausted)?;
        self.next_id = id.next();
        self.clients.insert(id, RegisteredClient { id, outbound });
        Ok(id)
    }

    /// Removes `id` if present. Removing an unknown id is a no-op.
    pub fn unregister(&mut self, id: ClientId) -> Option<RegisteredClient> {
        self.clients.remove(&id)
    }

    pub fn lookup(&self, id: ClientId) -> Option<&RegisteredClient> {
        self.clients.get(&id)
    }

    /// Current roster in ascending id order.
    pub fn snapshot(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = &RegisteredClient> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
