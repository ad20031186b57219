#[macro_use]
extern crate log;

use getopts::Options;
use std::{
    env,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tally::{Aggregator, FamilyConfig, Sink, TargetConfig};

struct Generator {
    sink: Sink,
    paths: Vec<Vec<u8>>,
    sent: Arc<AtomicU64>,
    done: Arc<AtomicBool>,
    t0: Option<Instant>,
    gauge: u64,
}

impl Generator {
    fn new(sink: Sink, id: usize, paths: usize, sent: Arc<AtomicU64>, done: Arc<AtomicBool>) -> Generator {
        Generator {
            sink,
            paths: (0..paths).map(|i| format!("bench.{}.path{}", id, i).into_bytes()).collect(),
            sent,
            done,
            t0: None,
            gauge: 0,
        }
    }

    fn run(&mut self) {
        let mut i = 0;
        while !self.done.load(Ordering::Relaxed) {
            self.gauge += 1;
            let path = &self.paths[i % self.paths.len()];
            i += 1;

            let t1 = Instant::now();
            if let Some(t0) = self.t0 {
                let _ = self.sink.ingest_timer(b"bench.ingest_ns", (t1 - t0).as_nanos() as f64);
                let _ = self.sink.ingest_counter(path, 1);
                let _ = self.sink.ingest_gauge(b"bench.gauge", self.gauge as f64);
                self.sent.fetch_add(3, Ordering::Relaxed);
            }
            self.t0 = Some(t1);
        }
    }
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

pub fn opts() -> Options {
    let mut opts = Options::new();

    opts.optopt("p", "producers", "number of producers", "INTEGER");
    opts.optopt("n", "paths", "number of counter paths per producer", "INTEGER");
    opts.optopt("d", "duration", "number of seconds to run for", "INTEGER");
    opts.optflag("h", "help", "print this help menu");

    opts
}

fn parse_opt(matches: &getopts::Matches, name: &str, default: usize) -> Option<usize> {
    match matches.opt_str(name) {
        None => Some(default),
        Some(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(e) => {
                error!("invalid value for --{}: {}", name, e);
                None
            },
        },
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = &args[0];
    let opts = opts();

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            error!("Failed to parse command line args: {}", f);
            return;
        },
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return;
    }

    let (producers, paths, duration) = match (
        parse_opt(&matches, "producers", 1),
        parse_opt(&matches, "paths", 1000),
        parse_opt(&matches, "duration", 30),
    ) {
        (Some(p), Some(n), Some(d)) => (p, n.max(1), d),
        _ => return,
    };

    info!("tally benchmark");
    info!("producers: {}", producers);
    info!("paths per producer: {}", paths);

    let every_second = |fc: FamilyConfig| fc.period_ms(1000).jitter_ms(0);
    let aggregator = match Aggregator::builder()
        .timers(every_second(FamilyConfig::timers()))
        .counters(every_second(FamilyConfig::counters()))
        .gauges(every_second(FamilyConfig::gauges()))
        .thresholds(vec!["90", "99", "999m"])
        .target(TargetConfig::memory("bench"))
        .build()
    {
        Ok(a) => a,
        Err(e) => {
            error!("bad configuration: {}", e);
            return;
        },
    };

    let sink = aggregator.sink();
    let running = match aggregator.start() {
        Ok(r) => r,
        Err(e) => {
            error!("failed to start: {}", e);
            return;
        },
    };
    let output = match running.memory_sink("bench") {
        Some(o) => o,
        None => return,
    };

    info!("aggregator started");

    // Spin up our producers.
    let sent = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let handles = (0..producers)
        .map(|id| {
            let mut generator = Generator::new(sink.clone(), id, paths, Arc::clone(&sent), Arc::clone(&done));
            thread::spawn(move || generator.run())
        })
        .collect::<Vec<_>>();

    let mut total = 0;
    let mut t0 = Instant::now();
    for _ in 0..duration {
        thread::sleep(Duration::from_secs(1));

        let t1 = Instant::now();
        let turn_total = sent.load(Ordering::Relaxed);
        let rate = (turn_total - total) as f64 / (t1 - t0).as_secs_f64();
        total = turn_total;
        t0 = t1;

        let snapshot = output.snapshot();
        output.take();

        let stat = |name: &str| snapshot.value(&format!("stats.timers.bench.ingest_ns.{}", name)).unwrap_or(0.0);
        info!("rate: {:.0} points per second", rate);
        info!(
            "ingest latency (ns): p50: {} p90: {} p99: {} p999: {} max: {}",
            stat("median"),
            stat("upper_90"),
            stat("upper_99"),
            stat("upper_999"),
            stat("upper")
        );
    }

    done.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }
    running.shutdown();

    info!("total points pushed: {}", total);
}
