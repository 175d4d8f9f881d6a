pub mod memory;

pub use memory::MemoryStore;

use crate::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ev07b_protocol::Geofence;

/// A complete outbound frame waiting for its device to reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub id: u64,
    pub device_id: String,
    pub frame: Bytes,
    pub created_at: DateTime<Utc>,
}

/// Persistence the gateway core depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Records presence and refreshes last-seen.
    async fn touch_device(&self, device_id: &str) -> Result<()>;
    async fn mark_disconnected(&self, device_id: &str) -> Result<()>;
    async fn append_command_log(&self, device_id: &str, command_id: u8, body: Bytes) -> Result<()>;

    async fn list_geofences(&self, device_id: &str) -> Result<Vec<Geofence>>;
    async fn geofence(&self, fence_id: u64) -> Result<Option<Geofence>>;
    /// Assigns an id when `fence.id == 0`; an existing fence with the same
    /// device and index is replaced in place.
    async fn save_geofence(&self, fence: Geofence) -> Result<Geofence>;

    async fn queue_pending(&self, device_id: &str, frame: Bytes) -> Result<u64>;
    /// Oldest first.
    async fn list_pending(&self, device_id: &str) -> Result<Vec<PendingCommand>>;
    async fn remove_pending(&self, pending_id: u64) -> Result<()>;
    async fn pending_count(&self) -> Result<usize>;
}
