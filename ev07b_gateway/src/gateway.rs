// Shared state for every connection plus the per-message pipeline
use crate::admin::Admin;
use crate::commands::{
    AckHandler, CommandHandler, CommandRegistry, DataHandler, Dispatch, GeofenceConfigHandler, HeartbeatHandler, ServicesHandler,
};
use crate::errors::Result;
use crate::geofence::GeofenceEvaluator;
use crate::logging::FrameAudit;
use crate::net::connection::{ConnId, ConnectionHandle};
use crate::session::{SequenceAllocator, SessionRegistry};
use crate::store::Store;
use bytes::Bytes;
use ev07b_protocol::{Message, UNKNOWN_DEVICE};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStatus {
    pub sessions: usize,
    pub sequence_counters: usize,
    pub fence_states: usize,
    pub pending: usize,
}

pub struct Gateway {
    store: Arc<dyn Store>,
    sessions: Arc<SessionRegistry>,
    sequences: Arc<SequenceAllocator>,
    evaluator: Arc<GeofenceEvaluator>,
    commands: CommandRegistry,
    audit: Option<Arc<FrameAudit>>,
}

impl Gateway {
    pub fn new(store: Arc<dyn Store>, audit: Option<Arc<FrameAudit>>) -> Self {
        Self::with_sequences(store, Arc::new(SequenceAllocator::new()), audit)
    }

    pub fn with_sequences(store: Arc<dyn Store>, sequences: Arc<SequenceAllocator>, audit: Option<Arc<FrameAudit>>) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let evaluator = Arc::new(GeofenceEvaluator::new(store.clone(), sessions.clone(), sequences.clone()));
        let handlers: Vec<Arc<dyn CommandHandler>> = vec![
            Arc::new(DataHandler::new(store.clone())),
            Arc::new(HeartbeatHandler::new(store.clone(), evaluator.clone())),
            Arc::new(ServicesHandler::new(store.clone())),
            Arc::new(GeofenceConfigHandler::new(store.clone())),
            Arc::new(AckHandler::new(store.clone())),
        ];
        Self {
            commands: CommandRegistry::new(handlers),
            store,
            sessions,
            sequences,
            evaluator,
            audit,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn admin(&self) -> Admin {
        Admin::new(self.store.clone(), self.sessions.clone(), self.sequences.clone())
    }

    /// Runs one decoded message through identity recovery, session binding,
    /// the pending flush for new bindings, and dispatch.
    pub async fn on_message(&self, msg: Message, conn: &ConnectionHandle) -> Dispatch {
        let msg = self.resolve_identity(msg, conn);
        if let Some(audit) = &self.audit {
            audit.inbound(&msg).await;
        }
        if msg.has_identity() && self.sessions.register(&msg.device_id, conn) {
            self.flush_pending(&msg.device_id, conn).await;
        }
        self.commands.dispatch(&msg, conn).await
    }

    fn resolve_identity(&self, msg: Message, conn: &ConnectionHandle) -> Message {
        if msg.has_identity() {
            return msg;
        }
        match self.sessions.identity_of(conn.id()) {
            Some(device_id) => {
                debug!(%device_id, conn = %conn.id(), "identity taken from connection binding");
                msg.with_device_id(device_id)
            }
            None => msg,
        }
    }

    async fn flush_pending(&self, device_id: &str, conn: &ConnectionHandle) {
        let pending = match self.store.list_pending(device_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(device_id, error = %e, "could not load pending commands");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        let mut sent = 0usize;
        for cmd in &pending {
            if let Err(e) = conn.send(cmd.frame.clone()) {
                warn!(device_id, pending_id = cmd.id, error = %e, "pending flush stopped");
                break;
            }
            sent += 1;
            if let Err(e) = self.store.remove_pending(cmd.id).await {
                warn!(device_id, pending_id = cmd.id, error = %e, "sent pending command not removed");
            }
        }
        info!(device_id, sent, queued = pending.len(), "pending commands flushed");
    }

    pub async fn on_disconnect(&self, conn: &ConnectionHandle) {
        let Some(device_id) = self.sessions.unregister_connection(conn.id()) else {
            debug!(conn = %conn.id(), "unidentified connection closed");
            return;
        };
        if self.sessions.is_connected(&device_id) {
            debug!(%device_id, conn = %conn.id(), "stale connection closed; device still bound elsewhere");
            return;
        }
        if let Err(e) = self.store.mark_disconnected(&device_id).await {
            warn!(%device_id, error = %e, "mark_disconnected failed");
        }
        info!(%device_id, conn = %conn.id(), "device disconnected");
    }

    /// Called by the connection writer after a frame hits the socket. A
    /// closing connection is no longer bound, so the writer passes the identity.
    pub async fn audit_outbound(&self, conn_id: ConnId, device_id: Option<&str>, frame: &Bytes) {
        if let Some(audit) = &self.audit {
            let device_id = device_id
                .map(str::to_string)
                .or_else(|| self.sessions.identity_of(conn_id))
                .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
            audit.outbound(&device_id, frame).await;
        }
    }

    pub async fn status(&self) -> Result<GatewayStatus> {
        Ok(GatewayStatus {
            sessions: self.sessions.len(),
            sequence_counters: self.sequences.tracked_devices(),
            fence_states: self.evaluator.tracked_states(),
            pending: self.store.pending_count().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{body, conn};
    use crate::store::MemoryStore;
    use bytes::BytesMut;
    use ev07b_protocol::{
        FenceDirection, FrameCodec, Geofence, GpsFix, PROP_ACK_REQUESTED, cmd, encode_frame, key,
    };
    use std::collections::HashSet;
    use tokio::sync::mpsc;
    use tokio_util::codec::Decoder;

    const IMEI: &str = "861234567890123";

    fn gateway() -> (Gateway, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Gateway::new(store.clone(), None), store)
    }

    fn wire(props: u8, seq: u16, body: &[u8]) -> Message {
        let mut buf = BytesMut::from(&encode_frame(props, seq, body).unwrap()[..]);
        FrameCodec::new().decode(&mut buf).unwrap().unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Message> {
        let mut codec = FrameCodec::new();
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let mut buf = BytesMut::from(&frame[..]);
            out.push(codec.decode(&mut buf).unwrap().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn data_frame_with_ack_bit_gets_exact_ack() {
        let (gw, _store) = gateway();
        let (c, mut rx) = conn();
        let msg = wire(0x10, 0x0102, &body(cmd::DATA, IMEI, &[]));

        assert_eq!(gw.on_message(msg, &c).await, Dispatch::Handled);

        let ack = rx.try_recv().unwrap();
        assert_eq!(&ack[..], &[0xAB, 0x00, 0x03, 0x00, 0x08, 0xC7, 0x02, 0x01, 0x7F, 0x01, 0x00]);
        assert!(gw.sessions().is_connected(IMEI));
    }

    #[tokio::test]
    async fn unknown_command_is_skipped_and_stream_continues() {
        let (gw, store) = gateway();
        let (c, mut rx) = conn();

        let odd = wire(PROP_ACK_REQUESTED, 1, &body(0x99, IMEI, &[]));
        assert_eq!(gw.on_message(odd, &c).await, Dispatch::Unknown);
        assert!(rx.try_recv().is_err());
        assert!(store.command_log(IMEI).is_empty());

        let hb = wire(PROP_ACK_REQUESTED, 2, &body(cmd::HEARTBEAT, IMEI, &[]));
        assert_eq!(gw.on_message(hb, &c).await, Dispatch::Handled);
        assert_eq!(drain(&mut rx)[0].sequence_id, 2);
    }

    #[tokio::test]
    async fn device_ack_is_handled_silently() {
        let (gw, store) = gateway();
        let (c, mut rx) = conn();
        gw.on_message(wire(0, 1, &body(cmd::HEARTBEAT, IMEI, &[])), &c).await;

        let ack = wire(0, 9, &ev07b_protocol::ACK_PAYLOAD);
        assert_eq!(gw.on_message(ack, &c).await, Dispatch::Handled);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.command_log(IMEI).last().map(|e| e.command_id), Some(cmd::ACK));
    }

    #[tokio::test]
    async fn identity_less_frame_inherits_binding() {
        let (gw, store) = gateway();
        let (c, _rx) = conn();
        gw.on_message(wire(0, 1, &body(cmd::HEARTBEAT, IMEI, &[])), &c).await;

        gw.on_message(wire(0, 2, &[cmd::SERVICES, 0x02, 0x40, 0x00]), &c).await;

        let log = store.command_log(IMEI);
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].command_id, cmd::SERVICES);
    }

    #[tokio::test]
    async fn pending_frames_flush_before_the_ack_on_new_binding() {
        let (gw, store) = gateway();
        store.queue_pending(IMEI, encode_frame(0x10, 40, &[0x02, 0x00]).unwrap()).await.unwrap();
        store.queue_pending(IMEI, encode_frame(0x10, 41, &[0x02, 0x00]).unwrap()).await.unwrap();
        let (c, mut rx) = conn();

        gw.on_message(wire(PROP_ACK_REQUESTED, 7, &body(cmd::HEARTBEAT, IMEI, &[])), &c).await;
        gw.on_message(wire(PROP_ACK_REQUESTED, 8, &body(cmd::HEARTBEAT, IMEI, &[])), &c).await;

        let seqs: Vec<u16> = drain(&mut rx).iter().map(|m| m.sequence_id).collect();
        assert_eq!(seqs, vec![40, 41, 7, 8]);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_stay_queued_when_the_write_queue_is_full() {
        let (gw, store) = gateway();
        for seq in 0..3u16 {
            store.queue_pending(IMEI, encode_frame(0, seq, &[0x02]).unwrap()).await.unwrap();
        }
        let (c, _rx) = ConnectionHandle::new("127.0.0.1:3".parse().unwrap(), 2);

        gw.on_message(wire(0, 9, &body(cmd::HEARTBEAT, IMEI, &[])), &c).await;

        let left = store.list_pending(IMEI).await.unwrap();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_marks_device_offline_unless_rebound() {
        let (gw, store) = gateway();
        let (old, _rx1) = conn();
        let (new, _rx2) = conn();
        gw.on_message(wire(0, 1, &body(cmd::HEARTBEAT, IMEI, &[])), &old).await;
        gw.on_message(wire(0, 2, &body(cmd::HEARTBEAT, IMEI, &[])), &new).await;

        gw.on_disconnect(&old).await;
        assert!(store.device(IMEI).unwrap().connected);
        assert!(gw.sessions().is_connected(IMEI));

        gw.on_disconnect(&new).await;
        assert!(!store.device(IMEI).unwrap().connected);
        assert_eq!(gw.status().await.unwrap().sessions, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_devices_interleaved_keep_state_apart() {
        const DEVICES: usize = 32;
        // 1 degree of latitude is 111 194.93 m
        let m = |meters: f64| meters / 111_194.926_644_558_73;
        let store = Arc::new(MemoryStore::new());
        let gw = Arc::new(Gateway::new(store.clone(), None));

        let mut tasks = Vec::new();
        for n in 0..DEVICES {
            let imei = format!("86{:013}", n);
            let center = n as f64 * 0.1;
            store
                .save_geofence(Geofence::circle(&imei, 1, FenceDirection::Exit, 100, center, 0.0))
                .await
                .unwrap();
            let gw = gw.clone();
            tasks.push(tokio::spawn(async move {
                let (c, mut rx) = ConnectionHandle::new("127.0.0.1:4".parse().unwrap(), 64);
                for (i, meters) in [50.0, 150.0, 50.0, 150.0].into_iter().enumerate() {
                    let fix = GpsFix { lat: center + m(meters), lon: 0.0 }.encode();
                    let msg = wire(PROP_ACK_REQUESTED, i as u16, &body(cmd::HEARTBEAT, &imei, &[(key::GPS, &fix)]));
                    gw.on_message(msg, &c).await;
                    tokio::task::yield_now().await;
                }
                (imei, drain(&mut rx))
            }));
        }

        for task in tasks {
            let (imei, frames) = task.await.unwrap();
            let acks = frames.iter().filter(|m| m.command_id == cmd::ACK).count();
            let alarms: Vec<&Message> = frames.iter().filter(|m| m.command_id == cmd::GEOFENCE).collect();
            assert_eq!(acks, 4, "{imei}");
            assert_eq!(alarms.len(), 2, "{imei}");
            let seqs: HashSet<u16> = alarms.iter().map(|m| m.sequence_id).collect();
            assert_eq!(seqs.len(), 2, "{imei}");
        }
        let status = gw.status().await.unwrap();
        assert_eq!(status.sessions, DEVICES);
        assert_eq!(status.fence_states, DEVICES);
        assert_eq!(status.pending, 0);
    }
}
