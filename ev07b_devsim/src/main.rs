// Simulated EV07B tracker: heartbeats with a wandering fix, acks gateway alarms.
use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use ev07b_protocol::{
    ACK_PAYLOAD, ALARM_SUBCODE_GEOFENCE, Frame, FrameCodec, GpsFix, Message, PROP_ACK_REQUESTED, cmd, key,
};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::f64::consts::TAU;
use tokio::net::TcpStream;
use tokio::time::{self, Duration};
use tokio_util::codec::Framed;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// 1 degree of latitude on the gateway's 6 371 km sphere
const M_PER_DEG_LAT: f64 = 111_194.926_644_558_73;

#[derive(Parser, Debug, Clone)]
#[command(name = "ev07b_devsim", about = "Simulated EV07B tracker")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:7000")] addr: String,
    #[arg(long, default_value = "861234567890123")] imei: String,
    #[arg(long, default_value_t = 5000)]            interval_ms: u64,
    #[arg(long, default_value_t = 22.5431)]         center_lat: f64,
    #[arg(long, default_value_t = 114.0579)]        center_lon: f64,
    /// Radius of the fence the walk crosses; the walk swings 0.5x..1.5x of it.
    #[arg(long, default_value_t = 100.0)]           radius_m: f64,
}

/// Circles the center, alternating between inside and outside the radius.
struct Walk {
    center_lat: f64,
    center_lon: f64,
    radius_m: f64,
    step: u32,
}

impl Walk {
    fn next_fix(&mut self, rng: &mut impl Rng) -> GpsFix {
        let outside = self.step % 2 == 1;
        self.step += 1;
        let scale = if outside { rng.random_range(1.2..1.5) } else { rng.random_range(0.3..0.8) };
        let bearing = rng.random_range(0.0..TAU);
        let meters = self.radius_m * scale;
        let d_lat = meters * bearing.cos() / M_PER_DEG_LAT;
        let d_lon = meters * bearing.sin() / (M_PER_DEG_LAT * self.center_lat.to_radians().cos().max(1e-6));
        GpsFix { lat: self.center_lat + d_lat, lon: self.center_lon + d_lon }
    }
}

fn heartbeat(imei: &str, fix: &GpsFix) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(cmd::HEARTBEAT);
    body.put_u8(imei.len() as u8 + 1);
    body.put_u8(key::DEVICE_ID);
    body.put_slice(imei.as_bytes());
    let gps = fix.encode();
    body.put_u8(gps.len() as u8 + 1);
    body.put_u8(key::GPS);
    body.put_slice(&gps);
    body.freeze()
}

fn describe(msg: &Message) {
    match (msg.command_id, msg.body.get(1)) {
        (cmd::ACK, _) => info!(seq = msg.sequence_id, "ack"),
        (cmd::GEOFENCE, Some(&ALARM_SUBCODE_GEOFENCE)) => {
            let index = msg.body.get(2).copied().unwrap_or(0);
            let state = if msg.body.get(3) == Some(&0) { "inside" } else { "outside" };
            info!(seq = msg.sequence_id, index, state, "geofence alarm");
        }
        (cmd::CONFIG, _) => info!(seq = msg.sequence_id, body = %hex::encode(&msg.body), "config push"),
        _ => warn!(cmd = msg.command_id, body = %hex::encode(&msg.body), "unexpected frame"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ev07b_devsim=info".parse()?))
        .compact()
        .init();

    let cli = Cli::parse();
    let stream = TcpStream::connect(&cli.addr).await.with_context(|| format!("connect {}", cli.addr))?;
    stream.set_nodelay(true)?;
    info!(addr = %cli.addr, imei = %cli.imei, "connected");

    let mut link = Framed::new(stream, FrameCodec::new());
    let mut walk = Walk { center_lat: cli.center_lat, center_lon: cli.center_lon, radius_m: cli.radius_m, step: 0 };
    let mut rng = rand::rng();
    let mut seq: u16 = rng.random();
    let mut tick = time::interval(Duration::from_millis(cli.interval_ms.max(1)));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let fix = walk.next_fix(&mut rng);
                seq = seq.wrapping_add(1);
                link.send(Frame::new(PROP_ACK_REQUESTED, seq, heartbeat(&cli.imei, &fix))).await?;
                info!(seq, lat = fix.lat, lon = fix.lon, at = %chrono::Utc::now().to_rfc3339(), "heartbeat sent");
            }
            inbound = link.next() => {
                let Some(msg) = inbound else {
                    info!("gateway closed the connection");
                    return Ok(());
                };
                let msg = msg?;
                describe(&msg);
                if msg.ack_requested() {
                    link.send(Frame::new(0, msg.sequence_id, Bytes::from_static(&ACK_PAYLOAD))).await?;
                }
            }
        }
    }
}
