use crate::gateway::Gateway;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{info, warn};

pub fn spawn_status_reporter(gateway: Arc<Gateway>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match gateway.status().await {
                Ok(s) => info!(
                    sessions = s.sessions,
                    sequence_counters = s.sequence_counters,
                    fence_states = s.fence_states,
                    pending = s.pending,
                    "gateway status"
                ),
                Err(e) => warn!(%e, "status snapshot failed"),
            }
        }
    })
}
