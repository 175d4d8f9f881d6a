use crate::errors::{GatewayError, Result};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to one device connection. Cloning shares the same ordered
/// write queue; the connection's writer task owns the receiving side.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr, queue_depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        (Self { id: ConnId::new(), peer, tx }, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queues an encoded frame without waiting on the socket.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => GatewayError::WriteQueueFull,
            TrySendError::Closed(_) => GatewayError::ConnectionClosed,
        })
    }
}
