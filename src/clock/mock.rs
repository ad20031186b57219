use crate::clock::ClockSource;
use std::sync::atomic::{AtomicU64, Ordering};

/// A manually advanced clock for tests.
pub struct Mock {
    offset: AtomicU64,
}

impl Mock {
    pub fn new(offset_ms: u64) -> Self {
        Self {
            offset: AtomicU64::new(offset_ms),
        }
    }

    pub fn increment(&self, amount_ms: u64) { self.offset.fetch_add(amount_ms, Ordering::Release); }

    pub fn set(&self, offset_ms: u64) { self.offset.store(offset_ms, Ordering::Release); }
}

impl ClockSource for Mock {
    fn now_ms(&self) -> u64 { self.offset.load(Ordering::Acquire) }
}
