pub mod ack;
pub mod data;
pub mod geofence;
pub mod heartbeat;
pub mod services;

pub use ack::AckHandler;
pub use data::DataHandler;
pub use geofence::GeofenceConfigHandler;
pub use heartbeat::HeartbeatHandler;
pub use services::ServicesHandler;

use crate::errors::Result;
use crate::net::connection::ConnectionHandle;
use crate::store::Store;
use async_trait::async_trait;
use ev07b_protocol::{Frame, Message};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const UNKNOWN_DUMP_BYTES: usize = 32;

/// One handler per inbound command id.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn command_id(&self) -> u8;
    fn name(&self) -> &'static str;
    async fn handle(&self, msg: &Message, conn: &ConnectionHandle) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Failed,
    Unknown,
}

/// Immutable command id -> handler table.
pub struct CommandRegistry {
    handlers: HashMap<u8, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new(handlers: Vec<Arc<dyn CommandHandler>>) -> Self {
        let mut table = HashMap::with_capacity(handlers.len());
        for h in handlers {
            if let Some(prev) = table.insert(h.command_id(), h) {
                warn!(command = format_args!("0x{:02X}", prev.command_id()), replaced = prev.name(), "duplicate handler registration");
            }
        }
        Self { handlers: table }
    }

    pub fn contains(&self, command_id: u8) -> bool {
        self.handlers.contains_key(&command_id)
    }

    pub async fn dispatch(&self, msg: &Message, conn: &ConnectionHandle) -> Dispatch {
        let Some(handler) = self.handlers.get(&msg.command_id) else {
            let n = msg.body.len().min(UNKNOWN_DUMP_BYTES);
            warn!(
                command = format_args!("0x{:02X}", msg.command_id),
                device_id = %msg.device_id,
                body_len = msg.body.len(),
                head = %hex::encode(&msg.body[..n]),
                "unknown command"
            );
            return Dispatch::Unknown;
        };
        match handler.handle(msg, conn).await {
            Ok(()) => Dispatch::Handled,
            Err(e) => {
                warn!(handler = handler.name(), device_id = %msg.device_id, error = %e, "command handler failed");
                Dispatch::Failed
            }
        }
    }
}

/// Presence plus raw log, shared by every handler.
pub(crate) async fn record_inbound(store: &dyn Store, msg: &Message) -> Result<()> {
    if msg.has_identity() {
        store.touch_device(&msg.device_id).await?;
    }
    store.append_command_log(&msg.device_id, msg.command_id, msg.body.clone()).await
}

/// Queues `[0x7F 0x01 0x00]` echoing the inbound sequence when bit 4 asks for it.
pub(crate) fn ack_if_requested(msg: &Message, conn: &ConnectionHandle) -> Result<bool> {
    if !msg.ack_requested() {
        return Ok(false);
    }
    conn.send(Frame::ack(msg.sequence_id).to_bytes()?)?;
    debug!(device_id = %msg.device_id, seq = msg.sequence_id, "ack queued");
    Ok(true)
}
