use crate::{
    data::{counter, gauge, timer, Family, MetricEntry, PointChunk},
    error::IngestError,
    pool::Pool,
    registry::Registry,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Points turned away at the ingestion boundary, per family.
#[derive(Debug, Default)]
pub(crate) struct Rejections([AtomicU64; 3]);

impl Rejections {
    pub fn note(&self, family: Family) { self.0[family.index()].fetch_add(1, Ordering::Relaxed); }

    pub fn get(&self, family: Family) -> u64 { self.0[family.index()].load(Ordering::Relaxed) }
}

/// Handle for feeding data points into the aggregator.
///
/// `Sink` is cloneable and every clone writes into the same registries, so each listener
/// thread can own one.  Calls never wait on anything but the lock of the single entry being
/// written, and a point for a path we have not seen before creates that path.
///
/// Malformed points are rejected with an `IngestError` and counted; they never reach the
/// registries.
#[derive(Clone)]
pub struct Sink {
    timers: Arc<Registry>,
    counters: Arc<Registry>,
    gauges: Arc<Registry>,
    chunks: Arc<Pool<PointChunk>>,
    rejected: Arc<Rejections>,
    scope: Option<Vec<u8>>,
}

impl Sink {
    pub(crate) fn new(
        timers: Arc<Registry>, counters: Arc<Registry>, gauges: Arc<Registry>, chunks: Arc<Pool<PointChunk>>,
        rejected: Arc<Rejections>,
    ) -> Sink {
        Sink {
            timers,
            counters,
            gauges,
            chunks,
            rejected,
            scope: None,
        }
    }

    /// Creates a scoped clone of this `Sink`.
    ///
    /// Every path sent through the clone is prefixed with the scope and a `.`, so a listener
    /// can hand out `Sink`s for `app.a` and `app.b` and have them report `app.a.requests`
    /// and `app.b.requests`.  Scopes nest.
    pub fn scoped(&self, scope: &str) -> Result<Sink, IngestError> {
        if scope.is_empty() {
            return Err(IngestError::EmptyPath);
        }

        let mut joined = self.scope.clone().unwrap_or_default();
        joined.extend_from_slice(scope.as_bytes());
        joined.push(b'.');

        let mut sink = self.clone();
        sink.scope = Some(joined);
        Ok(sink)
    }

    /// Adds `delta` to a counter.
    ///
    /// Counter totals are kept as `f64`, so a cycle's sum is exact while its magnitude stays
    /// within 2^53; larger sums are rounded to the nearest representable value.
    pub fn ingest_counter(&self, path: &[u8], delta: i64) -> Result<(), IngestError> {
        self.check(Family::Counter, path, 0.0)?;
        self.write(&self.counters, path, |entry| counter::add(entry, delta as f64));
        Ok(())
    }

    /// Records one timer value.
    pub fn ingest_timer(&self, path: &[u8], value: f64) -> Result<(), IngestError> {
        self.check(Family::Timer, path, value)?;
        let chunks = &self.chunks;
        self.write(&self.timers, path, |entry| timer::append(entry, value, chunks));
        Ok(())
    }

    /// Sets a gauge to `value`.
    pub fn ingest_gauge(&self, path: &[u8], value: f64) -> Result<(), IngestError> {
        self.check(Family::Gauge, path, value)?;
        self.write(&self.gauges, path, |entry| gauge::set(entry, value));
        Ok(())
    }

    /// Moves a gauge up or down by `delta`.
    pub fn ingest_gauge_delta(&self, path: &[u8], delta: f64) -> Result<(), IngestError> {
        self.check(Family::Gauge, path, delta)?;
        self.write(&self.gauges, path, |entry| gauge::adjust(entry, delta));
        Ok(())
    }

    fn check(&self, family: Family, path: &[u8], value: f64) -> Result<(), IngestError> {
        let err = if path.is_empty() {
            IngestError::EmptyPath
        } else if !value.is_finite() {
            IngestError::InvalidValue(String::from_utf8_lossy(path).into_owned())
        } else {
            return Ok(());
        };

        self.rejected.note(family);
        Err(err)
    }

    fn write<F>(&self, registry: &Registry, path: &[u8], f: F)
    where
        F: FnOnce(&MetricEntry),
    {
        match &self.scope {
            None => f(&registry.get_or_create(path)),
            Some(scope) => {
                let mut full = Vec::with_capacity(scope.len() + path.len());
                full.extend_from_slice(scope);
                full.extend_from_slice(path);
                f(&registry.get_or_create(&full))
            },
        }
    }
}
