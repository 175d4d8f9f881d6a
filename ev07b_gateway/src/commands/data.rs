use super::{CommandHandler, ack_if_requested, record_inbound};
use crate::errors::Result;
use crate::net::connection::ConnectionHandle;
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use ev07b_protocol::{AlarmCode, GeofenceEvent, GpsFix, Message, Timestamp, cmd, key, parse_timestamp};
use std::sync::Arc;
use tracing::{debug, info};

/// Fields of interest in a 0x01 data report.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DataReport {
    pub fix: Option<GpsFix>,
    pub generated_at: Option<Timestamp>,
    pub alarm: Option<AlarmCode>,
}

impl DataReport {
    pub fn parse(msg: &Message) -> Self {
        let mut report = Self::default();
        for tlv in msg.tlv() {
            match tlv.key {
                key::GPS => report.fix = report.fix.or(GpsFix::parse(tlv.value)),
                key::GENERAL_DATA => report.generated_at = report.generated_at.or(parse_timestamp(tlv.value)),
                key::ALARM_CODE => report.alarm = report.alarm.or(AlarmCode::parse(tlv.value)),
                _ => {}
            }
        }
        report
    }

    pub fn geofence_event(&self) -> Option<GeofenceEvent> {
        self.alarm.as_ref().and_then(AlarmCode::geofence_event)
    }
}

/// Device-reported geofence alarms are logged only; the gateway's own
/// evaluator runs off heartbeats.
pub struct DataHandler {
    store: Arc<dyn Store>,
}

impl DataHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CommandHandler for DataHandler {
    fn command_id(&self) -> u8 {
        cmd::DATA
    }

    fn name(&self) -> &'static str {
        "data"
    }

    async fn handle(&self, msg: &Message, conn: &ConnectionHandle) -> Result<()> {
        record_inbound(self.store.as_ref(), msg).await?;
        let report = DataReport::parse(msg);
        debug!(device_id = %msg.device_id, ?report.fix, alarm = ?report.alarm, "data report");

        if let Some(event) = report.geofence_event() {
            let direction = match event.inside {
                Some(true) => "in",
                Some(false) => "out",
                None => "unknown",
            };
            let at = report.generated_at.unwrap_or_else(Utc::now).to_rfc3339();
            match report.fix {
                Some(fix) => info!(
                    device_id = %msg.device_id,
                    fence = event.index,
                    direction,
                    at = %at,
                    lat = fix.lat,
                    lon = fix.lon,
                    map = %fix.maps_url(),
                    "device geofence alarm"
                ),
                None => info!(device_id = %msg.device_id, fence = event.index, direction, at = %at, "device geofence alarm without fix"),
            }
        }

        ack_if_requested(msg, conn)?;
        Ok(())
    }
}
