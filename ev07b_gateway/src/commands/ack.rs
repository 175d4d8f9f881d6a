use super::{CommandHandler, record_inbound};
use crate::errors::Result;
use crate::net::connection::ConnectionHandle;
use crate::store::Store;
use async_trait::async_trait;
use ev07b_protocol::{Message, cmd};
use std::sync::Arc;
use tracing::debug;

/// Inbound 0x7F: the device confirming a frame the gateway sent. Recorded,
/// never answered.
pub struct AckHandler {
    store: Arc<dyn Store>,
}

impl AckHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CommandHandler for AckHandler {
    fn command_id(&self) -> u8 {
        cmd::ACK
    }

    fn name(&self) -> &'static str {
        "ack"
    }

    async fn handle(&self, msg: &Message, _conn: &ConnectionHandle) -> Result<()> {
        record_inbound(self.store.as_ref(), msg).await?;
        debug!(device_id = %msg.device_id, seq = msg.sequence_id, "device acknowledged frame");
        Ok(())
    }
}
