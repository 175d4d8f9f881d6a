use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, Ordering};

type Seeder = Box<dyn Fn() -> u16 + Send + Sync>;

/// Per-device 16-bit sequence ids for frames the gateway originates.
pub struct SequenceAllocator {
    counters: DashMap<String, AtomicU16>,
    seed: Seeder,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::with_seed(clock_seed)
    }

    pub fn with_seed(seed: impl Fn() -> u16 + Send + Sync + 'static) -> Self {
        Self { counters: DashMap::new(), seed: Box::new(seed) }
    }

    /// Next id for `device_id`, wrapping at 65536. The first call for a device
    /// returns seed + 1.
    pub fn next(&self, device_id: &str) -> u16 {
        if let Some(counter) = self.counters.get(device_id) {
            return counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }
        self.counters
            .entry(device_id.to_string())
            .or_insert_with(|| AtomicU16::new((self.seed)()))
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    pub fn tracked_devices(&self) -> usize {
        self.counters.len()
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn clock_seed() -> u16 {
    (Utc::now().timestamp_subsec_nanos() & 0xFFFF) as u16
}
