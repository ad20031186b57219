//! Report lines about the aggregator itself.
use crate::{
    data::{MetricEntry, PointChunk},
    memory,
    output::Pipeline,
    pool::{Pool, PoolStats},
    registry::Registry,
    sink::Rejections,
    stats::{Emitter, WorkerStats},
};
use parking_lot::Mutex;
use std::sync::Arc;

/// A worker's stats as seen from outside its thread.
pub(crate) struct WorkerView {
    pub label: String,
    pub timer: bool,
    pub stats: Arc<Mutex<WorkerStats>>,
}

/// Collects path, worker, pool and target counters into report lines under one prefix.
pub(crate) struct SelfReporter {
    prefix: String,
    registries: Vec<Arc<Registry>>,
    rejected: Arc<Rejections>,
    workers: Vec<WorkerView>,
    entries: Arc<Pool<Arc<MetricEntry>>>,
    chunks: Arc<Pool<PointChunk>>,
}

impl SelfReporter {
    pub fn new(
        prefix: &str, registries: Vec<Arc<Registry>>, rejected: Arc<Rejections>, workers: Vec<WorkerView>,
        entries: Arc<Pool<Arc<MetricEntry>>>, chunks: Arc<Pool<PointChunk>>,
    ) -> SelfReporter {
        SelfReporter {
            prefix: prefix.to_owned(),
            registries,
            rejected,
            workers,
            entries,
            chunks,
        }
    }

    /// Emits one round of self statistics stamped with `ts`.  Returns the number of lines.
    pub fn report(&self, pipeline: &Pipeline, ts: u64) -> u64 {
        let mut out = Emitter::new(pipeline, &self.prefix, ts);

        for registry in &self.registries {
            let family = registry.family();
            let stats = registry.stats();
            let base = format!("paths.{}", family);
            out.line(base.as_bytes(), Some("curr"), stats.live as f64);
            out.count(base.as_bytes(), Some("creates"), stats.creates);
            out.count(base.as_bytes(), Some("gc"), stats.reaped);
            out.count(base.as_bytes(), Some("rejected"), self.rejected.get(family));
        }

        for worker in &self.workers {
            let stats = *worker.stats.lock();
            let base = format!("workers.{}", worker.label);
            out.count(base.as_bytes(), Some("points"), stats.points);
            out.count(base.as_bytes(), Some("active"), stats.active);
            out.count(base.as_bytes(), Some("highest"), stats.highest);
            if worker.timer {
                out.count(base.as_bytes(), Some("path_points_p90"), stats.path_points_p90);
            }
        }

        pool_lines(&mut out, self.entries.name(), self.entries.stats());
        pool_lines(&mut out, self.chunks.name(), self.chunks.stats());
        pool_lines(&mut out, "buffers", pipeline.buffers().pool_stats());

        for target in pipeline.targets() {
            let stats = target.stats();
            let base = format!("targets.{}", target.name());
            out.count(base.as_bytes(), Some("bytes"), stats.bytes);
            out.count(base.as_bytes(), Some("drops"), stats.drops);
            out.count(base.as_bytes(), Some("queued"), stats.queued as u64);
            out.count(base.as_bytes(), Some("connected"), u64::from(stats.connected));
        }

        if let Some(kb) = memory::resident_kb() {
            out.count(b"mem.total", Some("kb"), kb);
        }

        out.flush();
        out.lines()
    }
}

fn pool_lines(out: &mut Emitter, name: &str, stats: PoolStats) {
    let base = format!("mem.{}", name);
    out.count(base.as_bytes(), Some("free"), stats.free as u64);
    out.count(base.as_bytes(), Some("alloc"), stats.total as u64);
}
