use super::{PendingCommand, Store};
use crate::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ev07b_protocol::Geofence;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_LOG_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandLogEntry {
    pub device_id: String,
    pub command_id: u8,
    pub body: Bytes,
    pub received_at: DateTime<Utc>,
}

/// In-process store. The command log keeps the most recent entries only.
pub struct MemoryStore {
    devices: DashMap<String, DeviceRecord>,
    log: Mutex<VecDeque<CommandLogEntry>>,
    log_capacity: usize,
    geofences: DashMap<u64, Geofence>,
    /// (device, slot index) -> fence id
    fence_ids: DashMap<(String, u8), u64>,
    pending: Mutex<BTreeMap<u64, PendingCommand>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            devices: DashMap::new(),
            log: Mutex::new(VecDeque::new()),
            log_capacity: log_capacity.max(1),
            geofences: DashMap::new(),
            fence_ids: DashMap::new(),
            pending: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    pub fn command_log(&self, device_id: &str) -> Vec<CommandLogEntry> {
        self.log.lock().iter().filter(|e| e.device_id == device_id).cloned().collect()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn touch_device(&self, device_id: &str) -> Result<()> {
        let now = Utc::now();
        self.devices
            .entry(device_id.to_string())
            .and_modify(|d| {
                d.connected = true;
                d.last_seen = now;
            })
            .or_insert(DeviceRecord { connected: true, last_seen: now });
        Ok(())
    }

    async fn mark_disconnected(&self, device_id: &str) -> Result<()> {
        if let Some(mut d) = self.devices.get_mut(device_id) {
            d.connected = false;
        }
        Ok(())
    }

    async fn append_command_log(&self, device_id: &str, command_id: u8, body: Bytes) -> Result<()> {
        let mut log = self.log.lock();
        if log.len() == self.log_capacity {
            log.pop_front();
        }
        log.push_back(CommandLogEntry {
            device_id: device_id.to_string(),
            command_id,
            body,
            received_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_geofences(&self, device_id: &str) -> Result<Vec<Geofence>> {
        let mut fences: Vec<Geofence> = self
            .geofences
            .iter()
            .filter(|f| f.device_id == device_id)
            .map(|f| f.value().clone())
            .collect();
        fences.sort_by_key(|f| (f.index, f.id));
        Ok(fences)
    }

    async fn geofence(&self, fence_id: u64) -> Result<Option<Geofence>> {
        Ok(self.geofences.get(&fence_id).map(|f| f.clone()))
    }

    async fn save_geofence(&self, mut fence: Geofence) -> Result<Geofence> {
        let slot = (fence.device_id.clone(), fence.index);
        if fence.id == 0 {
            // The entry guard serializes concurrent saves of one slot.
            fence.id = *self.fence_ids.entry(slot).or_insert_with(|| self.allocate_id());
        } else {
            self.fence_ids.insert(slot, fence.id);
        }
        if let Some(prev) = self.geofences.insert(fence.id, fence.clone()) {
            if prev.device_id != fence.device_id || prev.index != fence.index {
                self.fence_ids.remove_if(&(prev.device_id, prev.index), |_, id| *id == fence.id);
            }
        }
        Ok(fence)
    }

    async fn queue_pending(&self, device_id: &str, frame: Bytes) -> Result<u64> {
        let id = self.allocate_id();
        self.pending.lock().insert(
            id,
            PendingCommand { id, device_id: device_id.to_string(), frame, created_at: Utc::now() },
        );
        Ok(id)
    }

    async fn list_pending(&self, device_id: &str) -> Result<Vec<PendingCommand>> {
        Ok(self.pending.lock().values().filter(|p| p.device_id == device_id).cloned().collect())
    }

    async fn remove_pending(&self, pending_id: u64) -> Result<()> {
        self.pending.lock().remove(&pending_id);
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.pending.lock().len())
    }
}
