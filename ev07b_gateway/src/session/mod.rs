pub mod sequence;

pub use sequence::SequenceAllocator;

use crate::errors::Result;
use crate::net::connection::{ConnId, ConnectionHandle};
use crate::store::Store;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

/// How an outbound frame left the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

/// Live identity <-> connection bindings.
#[derive(Default)]
pub struct SessionRegistry {
    by_device: DashMap<String, ConnectionHandle>,
    by_conn: DashMap<ConnId, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `device_id` to `conn`, replacing any previous binding. Returns
    /// true when this is a new binding for the pair.
    pub fn register(&self, device_id: &str, conn: &ConnectionHandle) -> bool {
        self.by_conn.insert(conn.id(), device_id.to_string());
        match self.by_device.insert(device_id.to_string(), conn.clone()) {
            Some(prev) if prev.id() == conn.id() => false,
            Some(prev) => {
                info!(device_id, conn = %conn.id(), replaced = %prev.id(), "device moved to a new connection");
                true
            }
            None => {
                info!(device_id, conn = %conn.id(), peer = %conn.peer(), "device registered");
                true
            }
        }
    }

    /// Drops the identity's route only. The connection keeps its identity
    /// until [`unregister_connection`](Self::unregister_connection) runs at close.
    pub fn unregister(&self, device_id: &str) {
        if self.by_device.remove(device_id).is_some() {
            debug!(device_id, "device unregistered");
        }
    }

    /// Drops the reverse entry for a closed connection, and the forward entry
    /// only while it still points at that connection.
    pub fn unregister_connection(&self, conn_id: ConnId) -> Option<String> {
        let (_, device_id) = self.by_conn.remove(&conn_id)?;
        self.by_device.remove_if(&device_id, |_, conn| conn.id() == conn_id);
        Some(device_id)
    }

    pub fn connection(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.by_device.get(device_id).map(|c| c.clone())
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.by_device.get(device_id).is_some_and(|c| c.is_open())
    }

    pub fn identity_of(&self, conn_id: ConnId) -> Option<String> {
        self.by_conn.get(&conn_id).map(|d| d.clone())
    }

    pub fn len(&self) -> usize {
        self.by_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }

    /// Writes to the device's live connection, or parks the frame in the
    /// store's pending queue when there is none.
    pub async fn deliver_or_queue(&self, store: &dyn Store, device_id: &str, frame: Bytes) -> Result<Delivery> {
        if let Some(conn) = self.connection(device_id).filter(|c| c.is_open()) {
            match conn.send(frame.clone()) {
                Ok(()) => {
                    debug!(device_id, conn = %conn.id(), "frame queued on live connection");
                    return Ok(Delivery::Sent);
                }
                Err(e) => warn!(device_id, error = %e, "live write failed; queueing for reconnect"),
            }
        }
        let pending_id = store.queue_pending(device_id, frame).await?;
        info!(device_id, pending_id, "device offline; frame queued");
        Ok(Delivery::Queued)
    }
}
