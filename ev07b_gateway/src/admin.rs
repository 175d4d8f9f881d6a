// Operator-facing geofence management
use crate::errors::Result;
use crate::session::{Delivery, SequenceAllocator, SessionRegistry};
use crate::store::Store;
use ev07b_protocol::{Geofence, PROP_ACK_REQUESTED, encode_frame};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
    NotFound,
}

impl From<Delivery> for SendOutcome {
    fn from(d: Delivery) -> Self {
        match d {
            Delivery::Sent => SendOutcome::Sent,
            Delivery::Queued => SendOutcome::Queued,
        }
    }
}

#[derive(Clone)]
pub struct Admin {
    store: Arc<dyn Store>,
    sessions: Arc<SessionRegistry>,
    sequences: Arc<SequenceAllocator>,
}

impl Admin {
    pub fn new(store: Arc<dyn Store>, sessions: Arc<SessionRegistry>, sequences: Arc<SequenceAllocator>) -> Self {
        Self { store, sessions, sequences }
    }

    /// Stores the fence under `device_id` and pushes it to the device.
    pub async fn create_geofence(&self, device_id: &str, mut fence: Geofence) -> Result<(Geofence, SendOutcome)> {
        fence.device_id = device_id.to_string();
        let saved = self.store.save_geofence(fence).await?;
        info!(device_id, fence_id = saved.id, index = saved.index, "geofence saved");
        let outcome = self.push(&saved).await?;
        Ok((saved, outcome))
    }

    pub async fn list_geofences(&self, device_id: &str) -> Result<Vec<Geofence>> {
        self.store.list_geofences(device_id).await
    }

    pub async fn send_geofence(&self, device_id: &str, fence_id: u64) -> Result<SendOutcome> {
        match self.store.geofence(fence_id).await? {
            Some(fence) if fence.device_id == device_id => self.push(&fence).await,
            Some(_) => {
                warn!(device_id, fence_id, "fence belongs to another device");
                Ok(SendOutcome::NotFound)
            }
            None => Ok(SendOutcome::NotFound),
        }
    }

    async fn push(&self, fence: &Geofence) -> Result<SendOutcome> {
        let sequence_id = self.sequences.next(&fence.device_id);
        let frame = encode_frame(PROP_ACK_REQUESTED, sequence_id, &fence.config_push_payload())?;
        let delivery = self.sessions.deliver_or_queue(self.store.as_ref(), &fence.device_id, frame).await?;
        info!(device_id = %fence.device_id, fence_id = fence.id, seq = sequence_id, ?delivery, "geofence config pushed");
        Ok(delivery.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionHandle;
    use crate::store::MemoryStore;
    use bytes::BytesMut;
    use ev07b_protocol::{FenceDirection, FrameCodec, cmd};
    use tokio_util::codec::Decoder;

    const IMEI: &str = "861234567890123";

    fn admin() -> (Admin, Arc<MemoryStore>, Arc<SessionRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionRegistry::new());
        let admin = Admin::new(store.clone(), sessions.clone(), Arc::new(SequenceAllocator::with_seed(|| 9)));
        (admin, store, sessions)
    }

    #[tokio::test]
    async fn create_pushes_config_to_live_device() {
        let (admin, _store, sessions) = admin();
        let (conn, mut rx) = ConnectionHandle::new("127.0.0.1:2".parse().unwrap(), 4);
        sessions.register(IMEI, &conn);

        let fence = Geofence::circle("ignored", 1, FenceDirection::Entry, 300, 48.85, 2.35);
        let (saved, outcome) = admin.create_geofence(IMEI, fence).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(saved.device_id, IMEI);

        let mut buf = BytesMut::from(&rx.try_recv().unwrap()[..]);
        let msg = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.sequence_id, 10);
        assert_eq!(msg.properties, PROP_ACK_REQUESTED);
        assert_eq!(msg.command_id, cmd::CONFIG);
        assert_eq!(&msg.body[..3], &[0x02, 0x0D, 0x51]);
        assert_eq!(Geofence::decode_config(IMEI, &msg.body[2..]).unwrap().radius_m, 300);
    }

    #[tokio::test]
    async fn send_to_offline_device_is_queued() {
        let (admin, store, _sessions) = admin();
        let (saved, outcome) = admin
            .create_geofence(IMEI, Geofence::circle(IMEI, 2, FenceDirection::Exit, 50, 0.0, 0.0))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(admin.send_geofence(IMEI, saved.id).await.unwrap(), SendOutcome::Queued);
        assert_eq!(store.list_pending(IMEI).await.unwrap().len(), 2);
        assert_eq!(admin.list_geofences(IMEI).await.unwrap(), vec![saved]);
    }

    #[tokio::test]
    async fn unknown_or_foreign_fence_is_not_found() {
        let (admin, _store, _sessions) = admin();
        let (saved, _) = admin
            .create_geofence("other-device", Geofence::circle("", 1, FenceDirection::Exit, 50, 0.0, 0.0))
            .await
            .unwrap();
        assert_eq!(admin.send_geofence(IMEI, 4242).await.unwrap(), SendOutcome::NotFound);
        assert_eq!(admin.send_geofence(IMEI, saved.id).await.unwrap(), SendOutcome::NotFound);
    }
}
