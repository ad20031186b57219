//! A statsd-style metrics store and aggregation pipeline.
//!
//! Points come in through a [`Sink`] and land in per-family path registries.  On every cycle
//! the aggregation workers steal what was ingested, reduce it to report lines (counts, sums,
//! percentiles and friends), and hand the lines to the output targets.  Counters can feed
//! synthetic metrics, and paths that go quiet are reclaimed by the garbage collector.
//!
//! ```no_run
//! use tally::{Aggregator, TargetConfig};
//!
//! let aggregator = Aggregator::builder()
//!     .target(TargetConfig::tcp("graphite", "127.0.0.1", 2003))
//!     .build()
//!     .expect("bad configuration");
//!
//! let sink = aggregator.sink();
//! let running = aggregator.start().expect("failed to start");
//!
//! sink.ingest_counter(b"app.requests", 1).unwrap();
//! sink.ingest_timer(b"app.latency", 12.5).unwrap();
//!
//! running.shutdown();
//! ```
mod aggregator;
mod clock;
mod configuration;
mod control;
mod data;
mod error;
mod gc;
mod memory;
mod output;
mod pool;
mod registry;
mod selfstats;
mod sink;
mod stats;
mod synth;

pub use self::{
    aggregator::{Aggregator, Running},
    clock::{Clock, ClockSource, Mock},
    configuration::{
        Configuration, FamilyConfig, GcConfig, IoConfig, MemoryConfig, PathFilterConfig, PoolConfig, SelfStatsConfig,
        SynthConfig, TargetConfig, TargetKind,
    },
    control::Controller,
    data::Family,
    error::{ConfigError, IngestError, StartError},
    memory::resident_kb,
    output::{MemorySink, Snapshot, TargetStats},
    sink::Sink,
    stats::WorkerStats,
};
