use super::{CommandHandler, ack_if_requested, record_inbound};
use crate::errors::Result;
use crate::net::connection::ConnectionHandle;
use crate::store::Store;
use async_trait::async_trait;
use ev07b_protocol::{ALARM_SUBCODE_GEOFENCE, GEOFENCE_ALARM_LEN, Geofence, Message, cmd};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inbound 0x51: a device either reports one of its fence configs or
/// acknowledges a gateway-originated geofence alarm.
pub struct GeofenceConfigHandler {
    store: Arc<dyn Store>,
}

impl GeofenceConfigHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CommandHandler for GeofenceConfigHandler {
    fn command_id(&self) -> u8 {
        cmd::GEOFENCE
    }

    fn name(&self) -> &'static str {
        "geofence"
    }

    async fn handle(&self, msg: &Message, conn: &ConnectionHandle) -> Result<()> {
        record_inbound(self.store.as_ref(), msg).await?;

        // A config whose flags start with 0xA1 shares the subcode byte; only the length tells them apart.
        if msg.body.len() == GEOFENCE_ALARM_LEN && msg.body[1] == ALARM_SUBCODE_GEOFENCE {
            info!(device_id = %msg.device_id, fence = ?msg.body.get(2), "geofence alarm acknowledged");
        } else if !msg.has_identity() {
            debug!("geofence report without identity ignored");
        } else {
            match Geofence::decode_config(&msg.device_id, &msg.body) {
                Ok(fence) => {
                    let saved = self.store.save_geofence(fence).await?;
                    info!(
                        device_id = %msg.device_id,
                        fence_id = saved.id,
                        index = saved.index,
                        radius_m = saved.radius_m,
                        enabled = saved.enabled,
                        "device reported geofence"
                    );
                }
                Err(e) => warn!(device_id = %msg.device_id, error = %e, "unparseable geofence payload"),
            }
        }

        ack_if_requested(msg, conn)?;
        Ok(())
    }
}
