use crate::{
    clock::{Clock, Ticker},
    configuration::{Configuration, FamilyConfig, GcConfig, IoConfig, MemoryConfig, SelfStatsConfig, TargetKind},
    control::{Control, Controller},
    data::{Family, MetricEntry, PointChunk},
    error::{ConfigError, StartError},
    gc::Collector,
    memory::{self, Ceiling},
    output::{Buffers, MemorySink, Pipeline, Stdout, Target, TargetStats, Tcp, Transport},
    pool::Pool,
    registry::{IdSource, Registry},
    selfstats::{SelfReporter, WorkerView},
    sink::{Rejections, Sink},
    stats::{LoopContext, ReportSettings, Worker},
    synth::{Gate, Synthesizer},
};
use log::{debug, error, info};
use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

/// The metrics store and its aggregation pipeline.
///
/// An `Aggregator` owns the path registries, the workers for every family, the synthetic
/// evaluator, the garbage collector and the output targets.  It can be driven by hand, one
/// `run_cycle` at a time, or handed its own threads with `start`.
pub struct Aggregator {
    control: Arc<Control>,
    clock: Clock,
    timers: Arc<Registry>,
    counters: Arc<Registry>,
    gauges: Arc<Registry>,
    chunks: Arc<Pool<PointChunk>>,
    rejected: Arc<Rejections>,
    workers: Vec<Worker>,
    synth: Synthesizer,
    collector: Collector,
    pipeline: Arc<Pipeline>,
    memory_sinks: HashMap<String, MemorySink>,
    reporter: SelfReporter,
    // Indexed by `Family::index`.
    schedules: [FamilyConfig; 3],
    gc: GcConfig,
    io: IoConfig,
    self_stats: SelfStatsConfig,
    memory: MemoryConfig,
}

impl Aggregator {
    pub(crate) fn from_config(config: Configuration) -> Result<Aggregator, ConfigError> {
        let compiled = config.compile()?;

        let entries = Arc::new(Pool::<Arc<MetricEntry>>::new("entries", config.pool.entries_block));
        let chunks = Arc::new(Pool::<PointChunk>::new("points", config.pool.chunks_block));
        entries.reserve(config.pool.entries_block);
        chunks.reserve(config.pool.chunks_block);
        let ids = Arc::new(IdSource::default());
        let registry = |family, fc: &FamilyConfig| {
            Arc::new(Registry::new(family, fc.hash_size, Arc::clone(&entries), Arc::clone(&ids)))
        };
        let timers = registry(Family::Timer, &config.timers);
        let counters = registry(Family::Counter, &config.counters);
        let gauges = registry(Family::Gauge, &config.gauges);

        let buffers = Arc::new(Buffers::new(
            config.pool.buffers_block,
            config.pool.buffer_size,
            config.pool.high_water,
        ));
        let connect_timeout = Duration::from_millis(config.io.connect_timeout_ms);
        let mut memory_sinks = HashMap::new();
        let targets = config
            .targets
            .iter()
            .map(|tc| {
                let transport: Box<dyn Transport> = match &tc.kind {
                    TargetKind::Tcp { host, port } => Box::new(Tcp::new(host, *port, connect_timeout)),
                    TargetKind::Stdout => Box::new(Stdout),
                    TargetKind::Memory => {
                        let sink = MemorySink::new();
                        memory_sinks.insert(tc.name.clone(), sink.clone());
                        Box::new(sink)
                    },
                };
                Arc::new(Target::new(
                    tc.name.clone(),
                    transport,
                    tc.max_queued,
                    config.io.reconnect_ticks(),
                    Arc::clone(&buffers),
                ))
            })
            .collect();
        let pipeline = Arc::new(Pipeline::new(buffers, targets));

        let timer_settings = Arc::new(ReportSettings {
            prefix: config.timers.prefix.clone(),
            thresholds: compiled.thresholds,
            moments: compiled.moments,
            mode: compiled.mode,
        });
        let plain = |fc: &FamilyConfig| {
            Arc::new(ReportSettings {
                prefix: fc.prefix.clone(),
                ..Default::default()
            })
        };

        let mut workers = Vec::new();
        for (registry, fc, settings) in &[
            (&timers, &config.timers, timer_settings),
            (&counters, &config.counters, plain(&config.counters)),
            (&gauges, &config.gauges, plain(&config.gauges)),
        ] {
            for id in 0..fc.threads {
                workers.push(Worker::new(
                    id,
                    fc.threads,
                    Arc::clone(registry),
                    Arc::clone(settings),
                    Arc::clone(&chunks),
                ));
            }
        }

        let synth = Synthesizer::new(Arc::clone(&counters), &config.synthetics);

        let mut collector = Collector::new(Arc::clone(&chunks));
        collector.watch(Arc::clone(&timers), config.gc.threshold);
        collector.watch(Arc::clone(&counters), config.gc.threshold);
        collector.watch(Arc::clone(&gauges), config.gc.gauge_threshold);

        let rejected = Arc::new(Rejections::default());
        let views = workers
            .iter()
            .map(|w| WorkerView {
                label: format!("{}.{}", w.family(), w.id()),
                timer: w.family() == Family::Timer,
                stats: w.stats_handle(),
            })
            .collect();
        let reporter = SelfReporter::new(
            &config.self_stats.prefix,
            vec![Arc::clone(&timers), Arc::clone(&counters), Arc::clone(&gauges)],
            Arc::clone(&rejected),
            views,
            entries,
            Arc::clone(&chunks),
        );

        Ok(Aggregator {
            control: Arc::new(Control::new()),
            clock: config.clock,
            timers,
            counters,
            gauges,
            chunks,
            rejected,
            workers,
            synth,
            collector,
            pipeline,
            memory_sinks,
            reporter,
            schedules: [config.timers, config.counters, config.gauges],
            gc: config.gc,
            io: config.io,
            self_stats: config.self_stats,
            memory: config.memory,
        })
    }

    /// Gets a builder to configure an `Aggregator` instance with.
    pub fn builder() -> Configuration { Configuration::default() }

    /// Creates a `Sink` bound to this aggregator.
    pub fn sink(&self) -> Sink {
        Sink::new(
            Arc::clone(&self.timers),
            Arc::clone(&self.counters),
            Arc::clone(&self.gauges),
            Arc::clone(&self.chunks),
            Arc::clone(&self.rejected),
        )
    }

    /// Creates a `Controller` bound to this aggregator.
    pub fn controller(&self) -> Controller { Controller::new(Arc::clone(&self.control)) }

    /// The capture handle of a `memory` target.
    pub fn memory_sink(&self, name: &str) -> Option<MemorySink> { self.memory_sinks.get(name).cloned() }

    pub fn target_stats(&self, name: &str) -> Option<TargetStats> {
        self.pipeline
            .targets()
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.stats())
    }

    /// Synthetic metrics in play.
    pub fn synthetics(&self) -> usize { self.synth.len() }

    /// Runs one aggregation cycle for every family on the calling thread.
    ///
    /// Every worker steals first, then the synthetics run against the stolen counters, then
    /// every worker reports.  Report lines are queued on the targets; `flush_targets` sends
    /// them.
    pub fn run_cycle(&mut self) {
        let ts = self.clock.now_secs();

        for worker in &self.workers {
            worker.steal();
        }
        let fired = self.synth.generate();
        for worker in self.workers.iter_mut() {
            worker.report(&self.pipeline, ts);
        }

        debug!("cycle at {}: {} synthetics fired", ts, fired);
    }

    /// Runs one garbage collection pass.  Returns the number of paths reclaimed per family.
    pub fn collect_garbage(&self) -> Vec<(Family, usize)> { self.collector.collect() }

    /// Gives every target one send tick.  Returns the number of bytes written.
    pub fn flush_targets(&self) -> usize { self.pipeline.targets().iter().map(|t| t.tick()).sum() }

    /// Emits one round of self statistics.  Returns the number of lines.
    pub fn report_self_stats(&self) -> u64 { self.reporter.report(&self.pipeline, self.clock.now_secs()) }

    /// Moves the pipeline onto its own threads.
    ///
    /// Each worker gets a thread on its family's aligned cycle, alongside the synthetic
    /// evaluator (when synthetics are defined), one send loop per target, the garbage
    /// collector, the self statistics reporter and the memory watcher (each when enabled).
    pub fn start(self) -> Result<Running, StartError> {
        let mut running = Running {
            control: Arc::clone(&self.control),
            sink: self.sink(),
            pipeline: Arc::clone(&self.pipeline),
            memory_sinks: self.memory_sinks.clone(),
            handles: Vec::new(),
            closed: false,
        };

        if let Err(e) = self.launch(&mut running.handles) {
            running.finish();
            return Err(e);
        }

        info!("started {} threads", running.handles.len());
        Ok(running)
    }

    fn launch(self, handles: &mut Vec<(String, JoinHandle<()>)>) -> Result<(), StartError> {
        let counter_workers = self.schedules[Family::Counter.index()].threads;
        let gate = if self.synth.is_empty() {
            None
        } else {
            Some(Arc::new(Gate::new(counter_workers)))
        };

        for worker in self.workers {
            let family = worker.family();
            let schedule = &self.schedules[family.index()];
            let ctx = LoopContext {
                control: Arc::clone(&self.control),
                clock: self.clock.clone(),
                pipeline: Arc::clone(&self.pipeline),
                period_ms: schedule.period_ms,
                offset_ms: schedule.offset_ms,
                jitter_ms: schedule.jitter_ms,
                gate: match family {
                    Family::Counter => gate.clone(),
                    _ => None,
                },
            };
            let name = format!("tally-{}-{}", family, worker.id());
            spawn(handles, name, move || worker.run(ctx))?;
        }

        if let Some(gate) = gate {
            let control = Arc::clone(&self.control);
            let mut synth = self.synth;
            spawn(handles, "tally-synth".to_owned(), move || {
                info!("synthetic evaluator started with {} synthetics", synth.len());
                while control.is_running() {
                    let passed = gate.evaluate(&control, || {
                        let fired = synth.generate();
                        debug!("{} synthetics fired", fired);
                    });
                    if !passed {
                        break;
                    }
                }
                info!("synthetic evaluator stopped");
            })?;
        }

        let send_interval = Duration::from_millis(self.io.send_interval_ms.max(1));
        for target in self.pipeline.targets() {
            let target = Arc::clone(target);
            let control = Arc::clone(&self.control);
            let name = format!("tally-target-{}", target.name());
            spawn(handles, name, move || {
                info!("target {} send loop started", target.name());
                loop {
                    target.tick();
                    if !control.sleep(send_interval) {
                        break;
                    }
                }
                info!("target {} send loop stopped", target.name());
            })?;
        }

        if self.gc.enabled {
            let collector = self.collector;
            let control = Arc::clone(&self.control);
            let interval = Duration::from_millis(self.gc.interval_ms.max(1));
            spawn(handles, "tally-gc".to_owned(), move || {
                while control.sleep(interval) {
                    collector.collect();
                }
            })?;
        }

        if self.self_stats.enabled {
            let reporter = self.reporter;
            let control = Arc::clone(&self.control);
            let clock = self.clock.clone();
            let pipeline = Arc::clone(&self.pipeline);
            let interval = self.self_stats.interval_ms;
            spawn(handles, "tally-self".to_owned(), move || {
                let mut ticker = Ticker::new(clock.clone(), interval, 0);
                while control.sleep(Duration::from_millis(ticker.wait_ms())) {
                    reporter.report(&pipeline, clock.now_secs());
                }
            })?;
        }

        let ceiling = Ceiling::new(self.memory.max_mb);
        if ceiling.limit_kb() > 0 {
            let control = Arc::clone(&self.control);
            let interval = Duration::from_millis(self.memory.check_interval_ms.max(1));
            spawn(handles, "tally-memory".to_owned(), move || {
                while control.sleep(interval) {
                    if let Some(kb) = memory::resident_kb() {
                        if ceiling.exceeded(kb) {
                            error!(
                                "resident memory {} KB is over the {} KB ceiling, shutting down",
                                kb,
                                ceiling.limit_kb()
                            );
                            control.stop();
                        }
                    }
                }
            })?;
        }

        Ok(())
    }
}

fn spawn<F>(handles: &mut Vec<(String, JoinHandle<()>)>, name: String, f: F) -> Result<(), StartError>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.clone()).spawn(f) {
        Ok(handle) => {
            handles.push((name, handle));
            Ok(())
        },
        Err(source) => Err(StartError::Spawn { name, source }),
    }
}

/// A started `Aggregator`.
///
/// Dropping this without calling `shutdown` still stops and joins every thread.
pub struct Running {
    control: Arc<Control>,
    sink: Sink,
    pipeline: Arc<Pipeline>,
    memory_sinks: HashMap<String, MemorySink>,
    handles: Vec<(String, JoinHandle<()>)>,
    closed: bool,
}

impl Running {
    pub fn sink(&self) -> Sink { self.sink.clone() }

    pub fn controller(&self) -> Controller { Controller::new(Arc::clone(&self.control)) }

    pub fn memory_sink(&self, name: &str) -> Option<MemorySink> { self.memory_sinks.get(name).cloned() }

    pub fn is_running(&self) -> bool { self.control.is_running() }

    /// Blocks until something asks the pipeline to stop, then shuts it down.
    pub fn wait(mut self) {
        while self.control.sleep(Duration::from_secs(1)) {}
        self.finish();
    }

    /// Stops every loop, joins every thread, sends what the targets still hold, and releases
    /// anything left queued.
    pub fn shutdown(mut self) { self.finish(); }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.control.stop();
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("thread {} panicked", name);
            }
        }

        for target in self.pipeline.targets() {
            target.tick();
            target.close();
        }
        info!("shutdown complete");
    }
}

impl Drop for Running {
    fn drop(&mut self) { self.finish(); }
}

#[cfg(test)]
mod tests {
    use super::Aggregator;
    use crate::{
        clock::{Clock, Mock},
        configuration::{FamilyConfig, GcConfig, MemoryConfig, PoolConfig, SynthConfig, TargetConfig},
        data::Family,
    };
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    fn manual(mock: &Arc<Mock>) -> crate::configuration::Configuration {
        Aggregator::builder()
            .clock(Clock::from_source(Arc::clone(mock)))
            .timers(FamilyConfig::timers().threads(2).hash_size(101))
            .counters(FamilyConfig::counters().threads(2).hash_size(101))
            .gauges(FamilyConfig::gauges().threads(1).hash_size(101))
            .target(TargetConfig::memory("mem"))
    }

    #[test]
    fn test_counter_round_trip_then_reaped() {
        let mock = Arc::new(Mock::new(1_000_000));
        let config = manual(&mock).gc(GcConfig {
            threshold: 3,
            ..Default::default()
        });
        let mut agg = config.build().unwrap();
        let sink = agg.sink();
        let out = agg.memory_sink("mem").unwrap();

        for v in &[1, 2, 3] {
            sink.ingest_counter(b"app.requests", *v).unwrap();
        }
        agg.run_cycle();
        agg.flush_targets();
        assert_eq!(out.take(), b"app.requests 6 1000\n".to_vec());

        for _ in 0..2 {
            mock.increment(10_000);
            agg.run_cycle();
        }
        assert_eq!(agg.collect_garbage(), vec![(Family::Timer, 0), (Family::Counter, 0), (Family::Gauge, 0)]);

        agg.run_cycle();
        assert_eq!(agg.collect_garbage()[1], (Family::Counter, 1));

        agg.flush_targets();
        assert!(out.take().is_empty());
    }

    #[test]
    fn test_every_family_in_one_cycle() {
        let mock = Arc::new(Mock::new(5_000));
        let mut agg = manual(&mock).thresholds(vec!["90"]).build().unwrap();
        let sink = agg.sink();

        for v in 1..=10 {
            sink.ingest_timer(b"db.query", f64::from(v)).unwrap();
        }
        sink.ingest_counter(b"hits", 4).unwrap();
        sink.ingest_gauge(b"depth", 9.0).unwrap();
        sink.ingest_gauge_delta(b"depth", 1.5).unwrap();

        agg.run_cycle();
        agg.flush_targets();

        let snap = agg.memory_sink("mem").unwrap().snapshot();
        assert_eq!(snap.value("stats.timers.db.query.count"), Some(10.0));
        assert_eq!(snap.value("stats.timers.db.query.median"), Some(5.5));
        assert_eq!(snap.value("stats.timers.db.query.upper_90"), Some(10.0));
        assert_eq!(snap.value("hits"), Some(4.0));
        assert_eq!(snap.value("depth"), Some(10.5));
        assert_eq!(snap.timestamp("hits"), Some(5));
    }

    #[test]
    fn test_synthetics_see_the_same_cycle() {
        let mock = Arc::new(Mock::new(20_000));
        let mut agg = manual(&mock)
            .synthetic(SynthConfig::new("web.total", "sum", &["web.a", "web.b"]))
            .synthetic(SynthConfig::new("web.share_a", "ratio", &["web.a", "web.total"]).factor(100.0))
            .build()
            .unwrap();
        assert_eq!(agg.synthetics(), 2);

        let sink = agg.sink();
        sink.ingest_counter(b"web.a", 30).unwrap();
        sink.ingest_counter(b"web.b", 70).unwrap();

        agg.run_cycle();
        agg.flush_targets();

        let out = agg.memory_sink("mem").unwrap();
        let snap = out.snapshot();
        assert_eq!(snap.value("web.total"), Some(100.0));
        assert_eq!(snap.value("web.share_a"), Some(30.0));

        // No source data, no synthetic output, and the targets survive collection.
        out.take();
        for _ in 0..5 {
            agg.run_cycle();
        }
        agg.flush_targets();
        assert!(out.take().is_empty());

        let mut gc = agg.collect_garbage();
        gc.retain(|(family, _)| *family == Family::Counter);
        assert_eq!(gc, vec![(Family::Counter, 0)]);
    }

    #[test]
    fn test_full_target_queue_drops_buffers() {
        let mock = Arc::new(Mock::new(0));
        let mut agg = manual(&mock)
            .target(TargetConfig::memory("small").max_queued(1))
            .pool(PoolConfig {
                buffer_size: 256,
                high_water: 128,
                ..Default::default()
            })
            .build()
            .unwrap();
        let sink = agg.sink();

        for i in 0..50 {
            sink.ingest_counter(format!("c.{:02}", i).as_bytes(), 1).unwrap();
        }
        agg.run_cycle();
        agg.flush_targets();

        assert_eq!(agg.memory_sink("mem").unwrap().lines().len(), 50);
        let small = agg.target_stats("small").unwrap();
        assert!(small.drops > 0);
        assert!(agg.memory_sink("small").unwrap().lines().len() < 50);
    }

    #[test]
    fn test_rejections_show_in_self_stats() {
        let mock = Arc::new(Mock::new(0));
        let agg = manual(&mock).build().unwrap();
        let sink = agg.sink();

        assert!(sink.ingest_counter(b"", 1).is_err());
        sink.ingest_counter(b"ok", 1).unwrap();

        assert!(agg.report_self_stats() > 0);
        agg.flush_targets();

        let snap = agg.memory_sink("mem").unwrap().snapshot();
        assert_eq!(snap.value("self.tally.paths.counters.rejected"), Some(1.0));
        assert_eq!(snap.value("self.tally.paths.counters.curr"), Some(1.0));
        assert!(snap.contains("self.tally.workers.timers.1.path_points_p90"));
        assert!(snap.contains("self.tally.targets.mem.bytes"));
    }

    #[test]
    fn test_threaded_pipeline_reports_and_shuts_down() {
        let fast = |fc: FamilyConfig| fc.threads(2).period_ms(50).jitter_ms(0).hash_size(101);
        let agg = Aggregator::builder()
            .timers(fast(FamilyConfig::timers()))
            .counters(fast(FamilyConfig::counters()))
            .gauges(fast(FamilyConfig::gauges()))
            .synthetic(SynthConfig::new("both", "sum", &["left", "right"]))
            .target(TargetConfig::memory("mem"))
            .build()
            .unwrap();

        // Everything goes in before the first cycle can fire, so one cycle sees it all.
        let sink = agg.sink();
        sink.ingest_counter(b"left", 2).unwrap();
        sink.ingest_counter(b"right", 5).unwrap();
        sink.ingest_timer(b"lat", 3.0).unwrap();

        let running = agg.start().unwrap();
        let out = running.memory_sink("mem").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut snap = out.snapshot();
        while !(snap.contains("both") && snap.contains("stats.timers.lat.count")) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
            snap = out.snapshot();
        }

        assert_eq!(snap.value("left"), Some(2.0));
        assert_eq!(snap.value("both"), Some(7.0));
        assert_eq!(snap.value("stats.timers.lat.count"), Some(1.0));

        let controller = running.controller();
        let started = Instant::now();
        running.shutdown();
        assert!(!controller.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_memory_ceiling_stops_the_pipeline() {
        let agg = Aggregator::builder()
            .memory(MemoryConfig {
                max_mb: 1,
                check_interval_ms: 10,
            })
            .build()
            .unwrap();

        let running = agg.start().unwrap();
        let controller = running.controller();
        running.wait();
        assert!(!controller.is_running());
    }
}
