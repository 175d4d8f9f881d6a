// Server-side circular geofence evaluation on heartbeat fixes
use crate::errors::Result;
use crate::session::{Delivery, SequenceAllocator, SessionRegistry};
use crate::store::Store;
use dashmap::DashMap;
use ev07b_protocol::{FenceDirection, FenceShape, Geofence, PROP_ACK_REQUESTED, encode_frame, geofence_alarm_payload};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ALARM_STATE_INSIDE: u8 = 0x00;
pub const ALARM_STATE_OUTSIDE: u8 = 0x01;

/// Containment change for one (device, fence) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First observation; never alarms.
    Baseline,
    Unchanged,
    Entered,
    Left,
}

impl Transition {
    pub fn triggers(self, direction: FenceDirection) -> bool {
        matches!(
            (self, direction),
            (Transition::Left, FenceDirection::Exit) | (Transition::Entered, FenceDirection::Entry)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeofenceAlarm {
    pub fence_id: u64,
    pub index: u8,
    pub state: u8,
    pub sequence_id: u16,
    pub distance_m: f64,
    pub delivery: Delivery,
}

pub struct GeofenceEvaluator {
    store: Arc<dyn Store>,
    sessions: Arc<SessionRegistry>,
    sequences: Arc<SequenceAllocator>,
    inside: DashMap<(String, u64), bool>,
}

impl GeofenceEvaluator {
    pub fn new(store: Arc<dyn Store>, sessions: Arc<SessionRegistry>, sequences: Arc<SequenceAllocator>) -> Self {
        Self { store, sessions, sequences, inside: DashMap::new() }
    }

    /// Evaluates one fix against every fence of the device and sends an
    /// alarm for each transition matching the fence's direction. Only a
    /// failure to load the fences is an error; a fence whose alarm cannot be
    /// delivered is logged and left in its previous state.
    pub async fn evaluate_and_notify(&self, device_id: &str, lat: f64, lon: f64) -> Result<Vec<GeofenceAlarm>> {
        let fences = self.store.list_geofences(device_id).await?;
        let mut alarms = Vec::new();
        for fence in fences {
            if !fence.enabled {
                debug!(device_id, fence_id = fence.id, "fence disabled; skipped");
                continue;
            }
            if fence.shape == FenceShape::Polygon {
                info!(device_id, fence_id = fence.id, "polygon fences are not evaluated");
                continue;
            }

            let distance_m = fence.distance_m(lat, lon);
            let inside = fence.contains(lat, lon);
            let transition = self.observe(device_id, fence.id, inside);
            debug!(device_id, fence_id = fence.id, distance_m, inside, ?transition, "fence evaluated");

            if !transition.triggers(fence.direction) {
                continue;
            }
            match self.raise(device_id, &fence, lat, lon, distance_m).await {
                Ok(alarm) => alarms.push(alarm),
                Err(e) => {
                    // Undelivered alarm: put the old flag back so the next fix retries it.
                    self.inside.insert((device_id.to_string(), fence.id), !inside);
                    warn!(device_id, fence_id = fence.id, error = %e, "geofence alarm not delivered");
                }
            }
        }
        Ok(alarms)
    }

    /// Swaps in the new flag; the previous one decides the transition.
    fn observe(&self, device_id: &str, fence_id: u64, inside: bool) -> Transition {
        match self.inside.insert((device_id.to_string(), fence_id), inside) {
            None => Transition::Baseline,
            Some(prev) if prev == inside => Transition::Unchanged,
            Some(true) => Transition::Left,
            Some(false) => Transition::Entered,
        }
    }

    async fn raise(&self, device_id: &str, fence: &Geofence, lat: f64, lon: f64, distance_m: f64) -> Result<GeofenceAlarm> {
        let state = if distance_m <= f64::from(fence.radius_m) { ALARM_STATE_INSIDE } else { ALARM_STATE_OUTSIDE };
        let payload = geofence_alarm_payload(fence.index, state, fence.radius_m, lat, lon);
        let sequence_id = self.sequences.next(device_id);
        let frame = encode_frame(PROP_ACK_REQUESTED, sequence_id, &payload)?;
        let delivery = self.sessions.deliver_or_queue(self.store.as_ref(), device_id, frame).await?;
        info!(
            device_id,
            fence_id = fence.id,
            index = fence.index,
            state,
            seq = sequence_id,
            distance_m,
            ?delivery,
            "geofence alarm"
        );
        Ok(GeofenceAlarm { fence_id: fence.id, index: fence.index, state, sequence_id, distance_m, delivery })
    }

    pub fn tracked_states(&self) -> usize {
        self.inside.len()
    }
}
