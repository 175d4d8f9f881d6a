// src/main.rs
use anyhow::Result;
use ev07b_gateway::store::{MemoryStore, Store};
use ev07b_gateway::{Gateway, config, health, logging, net};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // -------- config + logging ----------
    let cfg = config::Cli::parse_and_build_config()?;
    let _log_guard = logging::init(cfg.log_dir.as_deref())?;
    info!(?cfg.bind_addr, fences = cfg.geofences.len(), "EV07B gateway starting");

    // -------- shared state ----------
    let store = Arc::new(MemoryStore::new());
    let audit = cfg.audit_csv.clone().map(|path| Arc::new(logging::FrameAudit::new(path)));
    let gateway = Arc::new(Gateway::new(store, audit));

    // -------- seeded geofences ----------
    let admin = gateway.admin();
    for fence in cfg.geofences.clone() {
        if cfg.push_geofences {
            let device_id = fence.device_id.clone();
            let (saved, outcome) = admin.create_geofence(&device_id, fence).await?;
            info!(%device_id, fence_id = saved.id, ?outcome, "seeded geofence pushed");
        } else {
            let saved = gateway.store().save_geofence(fence).await?;
            info!(device_id = %saved.device_id, fence_id = saved.id, "seeded geofence");
        }
    }

    // -------- listener + background tasks ----------
    let listener = net::bind(&cfg.bind_addr).await?;
    let status = health::spawn_status_reporter(gateway.clone(), cfg.status_interval());
    let opts = net::ConnectionOptions::from_config(&cfg);

    info!("gateway running. Press Ctrl+C to stop…");

    // -------- graceful shutdown ----------
    tokio::select! {
        res = net::serve(listener, gateway.clone(), opts) => res?,
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(?e, "failed to install Ctrl+C handler");
            }
            info!("shutdown signal received; exiting.");
        }
    }
    status.abort();
    Ok(())
}
