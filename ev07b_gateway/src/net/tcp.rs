use super::connection::{ConnId, ConnectionHandle};
use crate::config::Config;
use crate::errors::Result;
use crate::gateway::Gateway;
use bytes::Bytes;
use ev07b_protocol::{FrameCodec, cmd};
use futures::StreamExt;
use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Upper bound on flushing a closing connection's queue.
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub idle_timeout: Option<Duration>,
    pub write_queue: usize,
}

impl ConnectionOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            idle_timeout: cfg.idle_timeout(),
            write_queue: usize::try_from(cfg.write_queue).unwrap_or(usize::MAX),
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self { idle_timeout: Some(Duration::from_secs(60)), write_queue: 256 }
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening for trackers");
    Ok(listener)
}

/// Accept loop; each connection runs on its own task.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>, opts: ConnectionOptions) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(?e, "accept failed");
                continue;
            }
        };
        tune(&stream, peer);
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, gateway, opts).await {
                warn!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

fn tune(stream: &TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, ?e, "TCP_NODELAY not set");
    }
    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        debug!(%peer, ?e, "SO_KEEPALIVE not set");
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, gateway: Arc<Gateway>, opts: ConnectionOptions) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (conn, outbound) = ConnectionHandle::new(peer, opts.write_queue);
    let conn_id = conn.id();
    info!(conn = %conn_id, %peer, "tracker connected");

    let (close_tx, close_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_loop(write_half, outbound, close_rx, gateway.clone(), conn_id));

    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    let result = loop {
        let next = match opts.idle_timeout {
            Some(limit) => match time::timeout(limit, frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    info!(conn = %conn_id, %peer, idle_secs = limit.as_secs(), "idle timeout");
                    break Ok(());
                }
            },
            None => frames.next().await,
        };
        match next {
            Some(Ok(msg)) => {
                gateway.on_message(msg, &conn).await;
            }
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(()),
        }
    };

    let rejected = frames.decoder().rejected_frames();
    let device_id = gateway.sessions().identity_of(conn_id);
    gateway.on_disconnect(&conn).await;
    drop(conn);
    let _ = close_tx.send(device_id);
    if time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        warn!(conn = %conn_id, %peer, "writer did not drain in time; aborted");
        writer.abort();
    }
    info!(conn = %conn_id, %peer, rejected, "tracker disconnected");
    result
}

/// Owns the socket's write side. Frames are written in queue order; once the
/// close signal arrives the queue is sealed and drained. Frames that could not
/// be written, other than ACKs, are handed back to the pending queue.
async fn write_loop<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<Bytes>,
    mut closing: oneshot::Receiver<Option<String>>,
    gateway: Arc<Gateway>,
    conn_id: ConnId,
) where
    W: AsyncWrite + Unpin,
{
    let mut unsent: Vec<Bytes> = Vec::new();
    let mut device_id: Option<String> = None;
    let mut sealed = false;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if !unsent.is_empty() {
                    unsent.push(frame);
                    continue;
                }
                match time::timeout(WRITE_TIMEOUT, sink.write_all(&frame)).await {
                    Ok(Ok(())) => gateway.audit_outbound(conn_id, device_id.as_deref(), &frame).await,
                    Ok(Err(e)) => {
                        warn!(conn = %conn_id, ?e, "socket write failed");
                        unsent.push(frame);
                    }
                    Err(_) => {
                        warn!(conn = %conn_id, "socket write timed out");
                        unsent.push(frame);
                    }
                }
            }
            id = &mut closing, if !sealed => {
                sealed = true;
                device_id = id.ok().flatten();
                outbound.close();
            }
        }
    }
    if !sealed {
        device_id = closing.await.ok().flatten();
    }
    let _ = sink.shutdown().await;

    let requeue: Vec<Bytes> = unsent.into_iter().filter(|f| f.get(8) != Some(&cmd::ACK)).collect();
    if requeue.is_empty() {
        return;
    }
    let Some(device_id) = device_id else {
        warn!(conn = %conn_id, dropped = requeue.len(), "unwritten frames for an unidentified connection dropped");
        return;
    };
    for frame in requeue {
        match gateway.store().queue_pending(&device_id, frame).await {
            Ok(pending_id) => info!(%device_id, pending_id, "unwritten frame requeued"),
            Err(e) => warn!(%device_id, error = %e, "unwritten frame lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use bytes::Bytes;
    use ev07b_protocol::{FenceDirection, Frame, Geofence, PROP_ACK_REQUESTED, cmd};
    use futures::SinkExt;
    use tokio_util::codec::Framed;

    const IMEI: &str = "861234567890123";

    async fn start(opts: ConnectionOptions) -> (SocketAddr, Arc<Gateway>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(Gateway::new(store.clone(), None));
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, gateway.clone(), opts));
        (addr, gateway, store)
    }

    fn heartbeat(seq: u16) -> Frame {
        let mut body = vec![cmd::HEARTBEAT, 16, 0x01];
        body.extend_from_slice(IMEI.as_bytes());
        Frame::new(PROP_ACK_REQUESTED, seq, body)
    }

    #[tokio::test]
    async fn ack_round_trip_over_tcp() {
        let (addr, gateway, _store) = start(ConnectionOptions::default()).await;
        let mut device = Framed::new(TcpStream::connect(addr).await.unwrap(), FrameCodec::new());

        // noise before the first header is skipped
        device.get_mut().write_all(&[0x00, 0x13, 0x37]).await.unwrap();
        device.send(heartbeat(0x0A0B)).await.unwrap();

        let ack = device.next().await.unwrap().unwrap();
        assert_eq!(ack.command_id, cmd::ACK);
        assert_eq!(ack.sequence_id, 0x0A0B);
        assert_eq!(ack.properties, 0);
        assert_eq!(&ack.body[..], &[0x7F, 0x01, 0x00]);
        assert!(gateway.sessions().is_connected(IMEI));
    }

    #[tokio::test]
    async fn queued_config_is_delivered_on_reconnect() {
        let (addr, gateway, store) = start(ConnectionOptions::default()).await;
        let (_, outcome) = gateway
            .admin()
            .create_geofence(IMEI, Geofence::circle(IMEI, 1, FenceDirection::Exit, 120, 1.0, 1.0))
            .await
            .unwrap();
        assert_eq!(outcome, crate::admin::SendOutcome::Queued);

        let mut device = Framed::new(TcpStream::connect(addr).await.unwrap(), FrameCodec::new());
        device.send(heartbeat(1)).await.unwrap();

        let config = device.next().await.unwrap().unwrap();
        assert_eq!(config.command_id, cmd::CONFIG);
        assert_eq!(config.properties, PROP_ACK_REQUESTED);
        let ack = device.next().await.unwrap().unwrap();
        assert_eq!(ack.command_id, cmd::ACK);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn idle_connection_is_closed_and_device_marked_offline() {
        let opts = ConnectionOptions { idle_timeout: Some(Duration::from_millis(200)), ..Default::default() };
        let (addr, gateway, store) = start(opts).await;
        let mut device = Framed::new(TcpStream::connect(addr).await.unwrap(), FrameCodec::new());
        device.send(heartbeat(1)).await.unwrap();
        assert!(device.next().await.unwrap().is_ok());

        // the gateway hangs up once the timeout passes
        let closed = time::timeout(Duration::from_secs(5), device.next()).await.unwrap();
        assert!(closed.is_none());
        time::sleep(Duration::from_millis(50)).await;
        assert!(!gateway.sessions().is_connected(IMEI));
        assert!(!store.device(IMEI).unwrap().connected);
    }

    #[tokio::test]
    async fn unknown_command_does_not_drop_the_connection() {
        let (addr, _gateway, _store) = start(ConnectionOptions::default()).await;
        let mut device = Framed::new(TcpStream::connect(addr).await.unwrap(), FrameCodec::new());
        device
            .send(Frame::new(PROP_ACK_REQUESTED, 1, Bytes::from_static(&[0x99, 0x02, 0x40, 0x00])))
            .await
            .unwrap();
        device.send(heartbeat(2)).await.unwrap();

        let ack = device.next().await.unwrap().unwrap();
        assert_eq!(ack.sequence_id, 2);
    }

    #[tokio::test]
    async fn ack_reaches_a_device_that_half_closes() {
        let (addr, _gateway, _store) = start(ConnectionOptions::default()).await;
        for seq in 0..20u16 {
            let mut device = TcpStream::connect(addr).await.unwrap();
            let frame = heartbeat(seq).to_bytes().unwrap();
            device.write_all(&frame).await.unwrap();
            device.shutdown().await.unwrap();

            let mut received = Vec::new();
            time::timeout(Duration::from_secs(5), tokio::io::AsyncReadExt::read_to_end(&mut device, &mut received))
                .await
                .unwrap()
                .unwrap();
            let mut buf = bytes::BytesMut::from(&received[..]);
            let ack = tokio_util::codec::Decoder::decode(&mut FrameCodec::new(), &mut buf).unwrap().unwrap();
            assert_eq!(ack.command_id, cmd::ACK);
            assert_eq!(ack.sequence_id, seq);
        }
    }

    #[tokio::test]
    async fn unwritten_frames_go_back_to_pending_except_acks() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(Gateway::new(store.clone(), None));
        let (sink, peer) = tokio::io::duplex(64);
        drop(peer);
        let (conn, outbound) = ConnectionHandle::new("127.0.0.1:9".parse().unwrap(), 8);
        let (close_tx, close_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(sink, outbound, close_rx, gateway, conn.id()));

        let ack = Frame::ack(3).to_bytes().unwrap();
        let alarm = Frame::new(PROP_ACK_REQUESTED, 4, Bytes::from_static(&[0x51, 0xA1, 0x01, 0x01])).to_bytes().unwrap();
        conn.send(ack).unwrap();
        conn.send(alarm.clone()).unwrap();
        drop(conn);
        close_tx.send(Some(IMEI.to_string())).unwrap();
        time::timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();

        let pending = store.list_pending(IMEI).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].frame, alarm);
    }
}
