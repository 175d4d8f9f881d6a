use super::{CommandHandler, ack_if_requested, record_inbound};
use crate::errors::Result;
use crate::net::connection::ConnectionHandle;
use crate::store::Store;
use async_trait::async_trait;
use ev07b_protocol::{Message, cmd};
use std::sync::Arc;
use tracing::debug;

pub struct ServicesHandler {
    store: Arc<dyn Store>,
}

impl ServicesHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CommandHandler for ServicesHandler {
    fn command_id(&self) -> u8 {
        cmd::SERVICES
    }

    fn name(&self) -> &'static str {
        "services"
    }

    async fn handle(&self, msg: &Message, conn: &ConnectionHandle) -> Result<()> {
        record_inbound(self.store.as_ref(), msg).await?;
        debug!(device_id = %msg.device_id, entries = msg.tlv().count(), "services frame");
        ack_if_requested(msg, conn)?;
        Ok(())
    }
}
