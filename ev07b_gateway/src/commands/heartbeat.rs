use super::{CommandHandler, ack_if_requested, record_inbound};
use crate::errors::Result;
use crate::geofence::GeofenceEvaluator;
use crate::net::connection::ConnectionHandle;
use crate::store::Store;
use async_trait::async_trait;
use ev07b_protocol::{GpsFix, Message, cmd, key};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 0x10 heartbeats; a GPS fix feeds the geofence evaluator.
pub struct HeartbeatHandler {
    store: Arc<dyn Store>,
    evaluator: Arc<GeofenceEvaluator>,
}

impl HeartbeatHandler {
    pub fn new(store: Arc<dyn Store>, evaluator: Arc<GeofenceEvaluator>) -> Self {
        Self { store, evaluator }
    }
}

#[async_trait]
impl CommandHandler for HeartbeatHandler {
    fn command_id(&self) -> u8 {
        cmd::HEARTBEAT
    }

    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn handle(&self, msg: &Message, conn: &ConnectionHandle) -> Result<()> {
        record_inbound(self.store.as_ref(), msg).await?;

        match msg.tlv().value_of(key::GPS).and_then(GpsFix::parse) {
            Some(fix) if msg.has_identity() => {
                debug!(device_id = %msg.device_id, lat = fix.lat, lon = fix.lon, "heartbeat fix");
                match self.evaluator.evaluate_and_notify(&msg.device_id, fix.lat, fix.lon).await {
                    Ok(alarms) if !alarms.is_empty() => {
                        info!(device_id = %msg.device_id, count = alarms.len(), "geofence alarms raised")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(device_id = %msg.device_id, error = %e, "geofence evaluation failed"),
                }
            }
            Some(_) => debug!("heartbeat fix without identity; not evaluated"),
            None => debug!(device_id = %msg.device_id, "heartbeat without fix"),
        }

        ack_if_requested(msg, conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::*;
    use crate::session::{SequenceAllocator, SessionRegistry};
    use crate::store::MemoryStore;
    use ev07b_protocol::{FenceDirection, Geofence, PROP_ACK_REQUESTED, cmd};

    const IMEI: &str = "861234567890123";

    #[tokio::test]
    async fn fix_reaches_evaluator_and_ack_follows() {
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionRegistry::new());
        let evaluator = Arc::new(GeofenceEvaluator::new(store.clone(), sessions, Arc::new(SequenceAllocator::new())));
        store
            .save_geofence(Geofence::circle(IMEI, 1, FenceDirection::Exit, 100, 10.0, 20.0))
            .await
            .unwrap();
        let handler = HeartbeatHandler::new(store.clone(), evaluator.clone());
        let (c, mut rx) = conn();

        let gps = GpsFix { lat: 10.0, lon: 20.0 }.encode();
        let msg = message(PROP_ACK_REQUESTED, 9, body(cmd::HEARTBEAT, IMEI, &[(key::GPS, &gps)]));
        handler.handle(&msg, &c).await.unwrap();

        assert_eq!(evaluator.tracked_states(), 1);
        let ack = rx.try_recv().unwrap();
        assert_eq!(&ack[ack.len() - 3..], &[0x7F, 0x01, 0x00]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_without_fix_skips_evaluation() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = Arc::new(GeofenceEvaluator::new(
            store.clone(),
            Arc::new(SessionRegistry::new()),
            Arc::new(SequenceAllocator::new()),
        ));
        let handler = HeartbeatHandler::new(store.clone(), evaluator.clone());
        let (c, mut rx) = conn();

        handler.handle(&message(0, 1, body(cmd::HEARTBEAT, IMEI, &[])), &c).await.unwrap();

        assert_eq!(evaluator.tracked_states(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.command_log(IMEI)[0].command_id, cmd::HEARTBEAT);
    }
}
