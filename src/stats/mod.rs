//! Aggregation workers.
//!
//! Each family runs a fixed set of workers, and worker `i` of `n` owns every bucket whose
//! index is `i mod n`.  A cycle is split in two: `steal` swaps each entry's ingestion-side
//! values over to the worker side under the entry lock, and `report` reduces the stolen
//! values to report lines with no entry lock held.  Counter workers meet the synthetic
//! evaluator between the two halves.
use crate::{
    clock::{Clock, Ticker},
    control::Control,
    data::{counter, gauge, timer, Family, MetricEntry, PointChunk},
    output::Pipeline,
    pool::Pool,
    registry::Registry,
    synth::Gate,
};
use hdrhistogram::Histogram;
use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;
use regex::bytes::RegexSet;
use std::{sync::Arc, time::Duration};

mod render;
mod summary;
mod threshold;

pub use self::{
    render::Emitter,
    summary::{compensated_sum, mode, moments, summarize, Moments, TimerSummary},
    threshold::Threshold,
};
pub(crate) use self::threshold::default_thresholds;

/// Selects the timer paths that get an optional extra statistic.
#[derive(Debug)]
pub struct PathFilter {
    patterns: RegexSet,
    min_points: usize,
}

impl PathFilter {
    pub fn new(patterns: RegexSet, min_points: usize) -> PathFilter { PathFilter { patterns, min_points } }

    pub fn wants(&self, path: &[u8], points: usize) -> bool {
        points >= self.min_points && self.patterns.is_match(path)
    }
}

/// How a family's report lines are produced.
#[derive(Debug, Default)]
pub struct ReportSettings {
    pub prefix: String,
    pub thresholds: Vec<Threshold>,
    pub moments: Option<PathFilter>,
    pub mode: Option<PathFilter>,
}

/// What a worker saw in its most recent cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Cycles run so far.
    pub cycles: u64,
    /// Data points reported last cycle.
    pub points: u64,
    /// Paths that had data last cycle.
    pub active: u64,
    /// Most points any one path had last cycle.
    pub highest: u64,
    /// Data points reported over the worker's lifetime.
    pub total_points: u64,
    /// 90th percentile of points per path last cycle.  Timers only.
    pub path_points_p90: u64,
}

/// Everything a worker thread needs beyond the worker itself.
pub(crate) struct LoopContext {
    pub control: Arc<Control>,
    pub clock: Clock,
    pub pipeline: Arc<Pipeline>,
    pub period_ms: u64,
    pub offset_ms: u64,
    pub jitter_ms: u64,
    pub gate: Option<Arc<Gate>>,
}

/// One aggregation worker.
pub struct Worker {
    id: usize,
    workers: usize,
    registry: Arc<Registry>,
    settings: Arc<ReportSettings>,
    chunks: Arc<Pool<PointChunk>>,
    workspace: Vec<f64>,
    path_points: Option<Histogram<u64>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub(crate) fn new(
        id: usize, workers: usize, registry: Arc<Registry>, settings: Arc<ReportSettings>,
        chunks: Arc<Pool<PointChunk>>,
    ) -> Worker {
        let path_points = match registry.family() {
            Family::Timer => Histogram::new(3).ok(),
            _ => None,
        };

        Worker {
            id,
            workers,
            registry,
            settings,
            chunks,
            workspace: Vec::new(),
            path_points,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn id(&self) -> usize { self.id }

    pub fn family(&self) -> Family { self.registry.family() }

    /// Shared view of this worker's latest cycle statistics.
    pub fn stats_handle(&self) -> Arc<Mutex<WorkerStats>> { Arc::clone(&self.stats) }

    /// Takes the ingested data for every entry in this worker's shard.
    ///
    /// Entries with nothing new count one more empty cycle.  Returns how many had data.
    pub fn steal(&self) -> usize {
        let family = self.registry.family();
        let mut stolen = 0;

        self.registry.for_each_in_shard(self.id, self.workers, |entry| {
            let took = match family {
                Family::Timer => timer::steal(entry),
                Family::Counter => counter::steal(entry),
                Family::Gauge => gauge::steal(entry),
            };

            if took {
                stolen += 1;
            } else {
                entry.mark_empty();
            }
        });

        stolen
    }

    /// Reduces everything stolen to report lines stamped with `ts`.
    pub fn report(&mut self, pipeline: &Pipeline, ts: u64) -> WorkerStats {
        let registry = Arc::clone(&self.registry);
        let settings = Arc::clone(&self.settings);
        let mut emitter = Emitter::new(pipeline, &settings.prefix, ts);
        let mut cycle = Tally::default();

        if let Some(hist) = self.path_points.as_mut() {
            hist.reset();
        }

        registry.for_each_linked_in_shard(self.id, self.workers, |entry| {
            let points = match entry.family() {
                Family::Timer => self.report_timer(entry, &settings, &mut emitter),
                Family::Counter => report_counter(entry, &mut emitter),
                Family::Gauge => report_gauge(entry, &mut emitter),
            };

            if let Some(points) = points {
                entry.mark_active();
                cycle.add(points);
                if let Some(hist) = self.path_points.as_mut() {
                    hist.saturating_record(points);
                }
            }
        });
        emitter.flush();

        let p90 = match self.path_points.as_ref() {
            Some(hist) if !hist.is_empty() => hist.value_at_quantile(0.9),
            _ => 0,
        };

        let mut stats = self.stats.lock();
        stats.cycles += 1;
        stats.points = cycle.points;
        stats.active = cycle.active;
        stats.highest = cycle.highest;
        stats.total_points += cycle.points;
        stats.path_points_p90 = p90;
        *stats
    }

    // Returns the number of points reported, or `None` if the entry had nothing this cycle.
    fn report_timer(&mut self, entry: &MetricEntry, settings: &ReportSettings, out: &mut Emitter) -> Option<u64> {
        let chunks = {
            let mut proc = entry.lock_proc();
            if !proc.pending {
                return None;
            }
            proc.clear()
        };

        timer::flatten(&chunks, &mut self.workspace);
        self.chunks.release_list(chunks);

        let path = entry.path();
        let summary = summarize(&mut self.workspace, &settings.thresholds)?;

        out.count(path, Some("count"), summary.count as u64);
        out.line(path, Some("mean"), summary.mean);
        out.line(path, Some("upper"), summary.upper);
        out.line(path, Some("lower"), summary.lower);
        out.line(path, Some("median"), summary.median);
        for (threshold, value) in settings.thresholds.iter().zip(summary.thresholds.iter()) {
            out.line(path, Some(threshold.label()), *value);
        }

        if settings.moments.as_ref().map_or(false, |f| f.wants(path, summary.count)) {
            if let Some(m) = moments(&self.workspace, summary.mean) {
                out.line(path, Some("stddev"), m.stddev);
                out.line(path, Some("skewness"), m.skewness);
                out.line(path, Some("kurtosis"), m.kurtosis);
            }
        }

        if settings.mode.as_ref().map_or(false, |f| f.wants(path, summary.count)) {
            if let Some((value, occurrences)) = mode(&self.workspace) {
                out.line(path, Some("mode"), value);
                out.count(path, Some("mode_ct"), occurrences as u64);
            }
        }

        Some(summary.count as u64)
    }

    /// Runs the worker on its aligned timer until shutdown.
    pub(crate) fn run(mut self, ctx: LoopContext) {
        let family = self.family();
        info!("{} worker {} started", family, self.id);

        let mut ticker = Ticker::new(ctx.clock.clone(), ctx.period_ms, ctx.offset_ms);
        loop {
            let wait = ticker.wait_ms();
            if !ctx.control.sleep(Duration::from_millis(wait)) {
                break;
            }

            let ts = ctx.clock.now_secs();
            let stolen = self.steal();

            let mut keep_going = match ctx.gate.as_ref() {
                Some(gate) => gate.arrive(&ctx.control),
                None => true,
            };

            if keep_going && ctx.jitter_ms > 0 {
                let jitter = rand::rng().random_range(0..=ctx.jitter_ms);
                keep_going = ctx.control.sleep(Duration::from_millis(jitter));
            }

            // Whatever we stole is ours alone, so it still gets reported on the way out.
            let stats = self.report(&ctx.pipeline, ts);
            debug!(
                "{} worker {}: {} paths stolen, {} active, {} points",
                family, self.id, stolen, stats.active, stats.points
            );

            if !keep_going {
                break;
            }
        }

        info!("{} worker {} stopped", family, self.id);
    }
}

#[derive(Default)]
struct Tally {
    points: u64,
    active: u64,
    highest: u64,
}

impl Tally {
    fn add(&mut self, points: u64) {
        self.points += points;
        self.active += 1;
        self.highest = self.highest.max(points);
    }
}

fn report_counter(entry: &MetricEntry, out: &mut Emitter) -> Option<u64> {
    let (total, count) = {
        let mut proc = entry.lock_proc();
        if !proc.pending || proc.count == 0 {
            return None;
        }
        let taken = (proc.total, proc.count);
        let _ = proc.clear();
        taken
    };

    out.line(entry.path(), None, total);
    Some(count)
}

// Gauges report their last value every cycle, updated or not.  Only an update counts as
// activity, though.
fn report_gauge(entry: &MetricEntry, out: &mut Emitter) -> Option<u64> {
    let (total, count, updated) = {
        let mut proc = entry.lock_proc();
        if proc.count == 0 || !(proc.pending || entry.is_valid()) {
            return None;
        }
        let updated = proc.pending;
        proc.pending = false;
        (proc.total, proc.count, updated)
    };

    out.line(entry.path(), None, total);
    if updated {
        Some(count)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{PathFilter, ReportSettings, Threshold, Worker};
    use crate::{
        data::{counter, gauge, timer, Family, PointChunk},
        gc::sweep,
        output::{Buffers, MemorySink, Pipeline, Snapshot, Target, Transport},
        pool::Pool,
        registry::{IdSource, Registry},
    };
    use regex::bytes::RegexSet;
    use std::sync::Arc;

    struct Bench {
        registry: Arc<Registry>,
        chunks: Arc<Pool<PointChunk>>,
        pipeline: Pipeline,
        sink: MemorySink,
    }

    impl Bench {
        fn new(family: Family) -> Bench {
            let buffers = Arc::new(Buffers::new(4, 4096, 3072));
            let sink = MemorySink::new();
            let transport: Box<dyn Transport> = Box::new(sink.clone());
            let target = Arc::new(Target::new("mem".to_owned(), transport, 64, 1, Arc::clone(&buffers)));

            Bench {
                registry: Arc::new(Registry::new(
                    family,
                    37,
                    Arc::new(Pool::new("entries", 8)),
                    Arc::new(IdSource::default()),
                )),
                chunks: Arc::new(Pool::new("chunks", 4)),
                pipeline: Pipeline::new(buffers, vec![target]),
                sink,
            }
        }

        fn worker(&self, settings: ReportSettings) -> Worker {
            Worker::new(0, 1, Arc::clone(&self.registry), Arc::new(settings), Arc::clone(&self.chunks))
        }

        fn cycle(&self, worker: &mut Worker, ts: u64) -> Snapshot {
            worker.steal();
            worker.report(&self.pipeline, ts);
            self.pipeline.targets()[0].tick();
            Snapshot::parse(&self.sink.take())
        }
    }

    #[test]
    fn test_timer_report() {
        let bench = Bench::new(Family::Timer);
        let mut worker = bench.worker(ReportSettings {
            prefix: "stats.timers.".to_owned(),
            thresholds: vec![Threshold::parse("90").unwrap(), Threshold::parse("10").unwrap()],
            ..Default::default()
        });

        let entry = bench.registry.get_or_create(b"db.query");
        for v in &[5.0, 3.0, 1.0, 4.0, 2.0] {
            timer::append(&entry, *v, &bench.chunks);
        }

        let snap = bench.cycle(&mut worker, 100);
        assert_eq!(snap.value("stats.timers.db.query.count"), Some(5.0));
        assert_eq!(snap.value("stats.timers.db.query.mean"), Some(3.0));
        assert_eq!(snap.value("stats.timers.db.query.upper"), Some(5.0));
        assert_eq!(snap.value("stats.timers.db.query.lower"), Some(1.0));
        assert_eq!(snap.value("stats.timers.db.query.median"), Some(3.0));
        assert_eq!(snap.value("stats.timers.db.query.upper_90"), Some(5.0));
        assert_eq!(snap.value("stats.timers.db.query.lower_10"), Some(1.0));
        assert_eq!(snap.timestamp("stats.timers.db.query.count"), Some(100));
        assert_eq!(snap.len(), 7);

        // The chunk went back to the pool, and an idle cycle reports nothing.
        assert_eq!(bench.chunks.stats().free, bench.chunks.stats().total);
        let idle = bench.cycle(&mut worker, 110);
        assert!(idle.is_empty());
        assert_eq!(entry.empty(), 1);
    }

    #[test]
    fn test_timer_moments_and_mode_follow_filters() {
        let bench = Bench::new(Family::Timer);
        let filter = |min| Some(PathFilter::new(RegexSet::new(&["^api\\."]).unwrap(), min));
        let mut worker = bench.worker(ReportSettings {
            moments: filter(3),
            mode: filter(3),
            ..Default::default()
        });

        for path in &[&b"api.latency"[..], &b"db.latency"[..]] {
            let entry = bench.registry.get_or_create(path);
            for v in &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
                timer::append(&entry, *v, &bench.chunks);
            }
        }

        let snap = bench.cycle(&mut worker, 100);
        assert_eq!(snap.value("api.latency.stddev"), Some(2.0));
        assert!(snap.contains("api.latency.skewness"));
        assert!(snap.contains("api.latency.kurtosis"));
        assert_eq!(snap.value("api.latency.mode"), Some(4.0));
        assert_eq!(snap.value("api.latency.mode_ct"), Some(3.0));
        assert!(!snap.contains("db.latency.stddev"));
        assert!(!snap.contains("db.latency.mode"));
    }

    #[test]
    fn test_counter_report_and_empty_tracking() {
        let bench = Bench::new(Family::Counter);
        let mut worker = bench.worker(ReportSettings::default());

        let entry = bench.registry.get_or_create(b"app.requests");
        for v in &[1.0, 2.0, 3.0] {
            counter::add(&entry, *v);
        }

        let snap = bench.cycle(&mut worker, 50);
        assert_eq!(snap.value("app.requests"), Some(6.0));
        assert_eq!(entry.empty(), 0);

        let snap = bench.cycle(&mut worker, 60);
        assert!(snap.is_empty());
        assert_eq!(entry.empty(), 1);

        counter::add(&entry, 4.0);
        let snap = bench.cycle(&mut worker, 70);
        assert_eq!(snap.value("app.requests"), Some(4.0));
        assert_eq!(entry.empty(), 0);

        let stats = *worker.stats_handle().lock();
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.points, 1);
        assert_eq!(stats.total_points, 4);
    }

    #[test]
    fn test_collection_between_steal_and_report_keeps_data() {
        let bench = Bench::new(Family::Counter);
        let mut worker = bench.worker(ReportSettings::default());

        let entry = bench.registry.get_or_create(b"app.rare");
        for ts in 1..=3 {
            assert!(bench.cycle(&mut worker, ts).is_empty());
        }
        assert_eq!(entry.empty(), 3);

        counter::add(&entry, 5.0);
        assert_eq!(worker.steal(), 1);
        assert_eq!(sweep(&bench.registry, 3, &bench.chunks), 0);
        assert!(entry.is_valid());

        worker.report(&bench.pipeline, 4);
        bench.pipeline.targets()[0].tick();
        let snap = Snapshot::parse(&bench.sink.take());
        assert_eq!(snap.value("app.rare"), Some(5.0));
        assert_eq!(entry.empty(), 0);
    }

    #[test]
    fn test_gauge_reports_every_cycle() {
        let bench = Bench::new(Family::Gauge);
        let mut worker = bench.worker(ReportSettings::default());

        let entry = bench.registry.get_or_create(b"queue.depth");
        gauge::set(&entry, 12.0);
        assert_eq!(bench.cycle(&mut worker, 1).value("queue.depth"), Some(12.0));

        let snap = bench.cycle(&mut worker, 2);
        assert_eq!(snap.value("queue.depth"), Some(12.0));
        assert_eq!(entry.empty(), 1);
        assert_eq!(worker.stats_handle().lock().active, 0);

        gauge::adjust(&entry, -2.0);
        assert_eq!(bench.cycle(&mut worker, 3).value("queue.depth"), Some(10.0));
        assert_eq!(entry.empty(), 0);
    }

    #[test]
    fn test_workers_split_the_table() {
        let bench = Bench::new(Family::Counter);
        let settings = Arc::new(ReportSettings::default());
        let mut workers = (0..3)
            .map(|i| Worker::new(i, 3, Arc::clone(&bench.registry), Arc::clone(&settings), Arc::clone(&bench.chunks)))
            .collect::<Vec<_>>();

        for i in 0..50 {
            counter::add(&bench.registry.get_or_create(format!("c.{}", i).as_bytes()), 1.0);
        }

        let stolen = workers.iter().map(|w| w.steal()).sum::<usize>();
        assert_eq!(stolen, 50);
        for worker in workers.iter_mut() {
            worker.report(&bench.pipeline, 5);
        }
        bench.pipeline.targets()[0].tick();
        assert_eq!(bench.sink.lines().len(), 50);
    }

    #[test]
    fn test_timer_worker_tracks_path_points() {
        let bench = Bench::new(Family::Timer);
        let mut worker = bench.worker(ReportSettings::default());

        for i in 0..10 {
            let entry = bench.registry.get_or_create(format!("t.{}", i).as_bytes());
            for _ in 0..=i {
                timer::append(&entry, 1.0, &bench.chunks);
            }
        }

        worker.steal();
        let stats = worker.report(&bench.pipeline, 1);
        assert_eq!(stats.active, 10);
        assert_eq!(stats.highest, 10);
        assert_eq!(stats.points, 55);
        assert!(stats.path_points_p90 >= 9 && stats.path_points_p90 <= 10);
    }
}
