use crate::pool::Reusable;
use parking_lot::{Mutex, MutexGuard};
use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
};

pub mod counter;
pub mod gauge;
pub mod timer;

pub use self::timer::{PointChunk, CHUNK_SIZE};

/// Sentinel `empty` value marking an entry as exempt from garbage collection.
pub const GC_EXEMPT: i64 = -1;

/// The metric families, each with its own registry, workers and report semantics.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Family {
    /// Every value is kept and summarized (count, mean, percentiles).
    Timer,

    /// Values are summed.
    Counter,

    /// Last write wins, optionally adjusted by relative deltas.
    Gauge,
}

impl Family {
    /// Slot of this family in per-family arrays.
    pub(crate) fn index(self) -> usize {
        match self {
            Family::Timer => 0,
            Family::Counter => 1,
            Family::Gauge => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::Timer => "timers",
            Family::Counter => "counters",
            Family::Gauge => "gauges",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.write_str(self.name()) }
}

/// The mutable value state of an entry.
///
/// Counters and gauges use `total`; timers keep every value in `points`.  `count` is the
/// number of data points that went into the set either way.
#[derive(Debug, Default)]
pub struct ValueSet {
    pub count: u64,
    pub total: f64,
    pub points: Vec<PointChunk>,
    /// Set when this set holds stolen data that has not been reported yet.
    pub pending: bool,
}

impl ValueSet {
    pub fn is_empty(&self) -> bool { self.count == 0 }

    /// Zeroes the set, handing back any point chunks it held.
    pub fn clear(&mut self) -> Vec<PointChunk> {
        self.count = 0;
        self.total = 0.0;
        self.pending = false;
        std::mem::take(&mut self.points)
    }
}

/// One distinct metric path within a family.
///
/// The `input` set is written by ingestion; the `proc` set belongs to the aggregation worker
/// that owns this entry's shard between a steal and the following report.  Ingestion only
/// ever takes the `input` lock.  A steal takes `input` then `proc`, never the other way
/// around.
pub struct MetricEntry {
    path: Box<[u8]>,
    sum: u64,
    id: u64,
    family: Family,
    input: Mutex<ValueSet>,
    proc: Mutex<ValueSet>,
    empty: AtomicI64,
    valid: AtomicBool,
}

impl MetricEntry {
    pub(crate) fn new(family: Family) -> MetricEntry {
        MetricEntry {
            path: Box::default(),
            sum: 0,
            id: 0,
            family,
            input: Mutex::new(ValueSet::default()),
            proc: Mutex::new(ValueSet::default()),
            empty: AtomicI64::new(0),
            valid: AtomicBool::new(false),
        }
    }

    /// Gives a recycled entry its identity.  Only callable while we hold the sole reference.
    pub(crate) fn assign(&mut self, family: Family, path: &[u8], sum: u64, id: u64) {
        self.path = path.into();
        self.sum = sum;
        self.id = id;
        self.family = family;
        *self.empty.get_mut() = 0;
        *self.valid.get_mut() = false;
    }

    pub fn path(&self) -> &[u8] { &self.path }

    pub fn path_str(&self) -> String { String::from_utf8_lossy(&self.path).into_owned() }

    pub fn checksum(&self) -> u64 { self.sum }

    pub fn id(&self) -> u64 { self.id }

    pub fn family(&self) -> Family { self.family }

    pub(crate) fn matches(&self, sum: u64, path: &[u8]) -> bool {
        self.sum == sum && self.is_valid() && &*self.path == path
    }

    pub fn is_valid(&self) -> bool { self.valid.load(Ordering::SeqCst) }

    pub(crate) fn set_valid(&self, valid: bool) { self.valid.store(valid, Ordering::SeqCst) }

    /// Cycles since this entry last produced output, or `GC_EXEMPT`.
    pub fn empty(&self) -> i64 { self.empty.load(Ordering::SeqCst) }

    /// Counts one more cycle without data, unless the entry is exempt.
    pub(crate) fn mark_empty(&self) {
        let _ = self
            .empty
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |e| if e >= 0 { Some(e + 1) } else { None });
    }

    /// Resets the empty counter after a cycle that produced output, unless the entry is exempt.
    pub(crate) fn mark_active(&self) {
        let _ = self
            .empty
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |e| if e > 0 { Some(0) } else { None });
    }

    /// Marks the entry active ahead of a steal.  Returns `false` if the collector has already
    /// invalidated it, in which case nothing may be stolen.
    ///
    /// The collector invalidates first and re-reads `empty` after, while a steal resets
    /// `empty` first and reads the flag after, so at least one side always sees the other.
    pub(crate) fn claim(&self) -> bool {
        self.mark_active();
        self.is_valid()
    }

    /// Exempts this entry from garbage collection for good.
    pub fn exempt(&self) { self.empty.store(GC_EXEMPT, Ordering::Release) }

    pub(crate) fn lock_input(&self) -> MutexGuard<'_, ValueSet> { self.input.lock() }

    pub(crate) fn lock_proc(&self) -> MutexGuard<'_, ValueSet> { self.proc.lock() }

    /// Detaches every point chunk still attached to either value set.
    pub(crate) fn drain_chunks(&self) -> Vec<PointChunk> {
        let mut chunks = self.input.lock().clear();
        chunks.extend(self.proc.lock().clear());
        chunks
    }
}

impl Reusable for MetricEntry {
    fn create() -> Self { MetricEntry::new(Family::Counter) }

    fn reset(&mut self) -> bool {
        self.input.get_mut().clear();
        self.proc.get_mut().clear();
        self.path = Box::default();
        *self.valid.get_mut() = false;
        true
    }
}

impl fmt::Debug for MetricEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MetricEntry")
            .field("path", &self.path_str())
            .field("id", &self.id)
            .field("family", &self.family)
            .field("empty", &self.empty())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A linked-looking entry for unit tests that bypass the registry.
#[cfg(test)]
pub(crate) fn live(family: Family, path: &[u8]) -> MetricEntry {
    let mut entry = MetricEntry::new(family);
    entry.assign(family, path, 0, 1);
    entry.set_valid(true);
    entry
}
