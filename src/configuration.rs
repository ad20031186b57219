use crate::{
    aggregator::Aggregator,
    clock::Clock,
    data::Family,
    error::ConfigError,
    stats::{default_thresholds, PathFilter, Threshold},
    synth::{Operation, MAX_SOURCES},
};
use regex::bytes::RegexSet;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;

/// Timing and table settings for one metric family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FamilyConfig {
    /// Aggregation workers for the family.
    pub threads: usize,
    /// Milliseconds between aggregation cycles.
    pub period_ms: u64,
    /// Milliseconds past each period boundary the cycle fires at.
    pub offset_ms: u64,
    /// Prepended to every path this family reports.
    pub prefix: String,
    /// Buckets in the family's path table.
    pub hash_size: usize,
    /// Upper bound on the random pause between steal and report.
    pub jitter_ms: u64,
}

impl FamilyConfig {
    pub fn timers() -> FamilyConfig {
        FamilyConfig {
            threads: 6,
            prefix: "stats.timers.".to_owned(),
            hash_size: 100_003,
            ..FamilyConfig::counters()
        }
    }

    pub fn counters() -> FamilyConfig {
        FamilyConfig {
            threads: 2,
            period_ms: 10_000,
            offset_ms: 0,
            prefix: String::new(),
            hash_size: 10_007,
            jitter_ms: 50,
        }
    }

    pub fn gauges() -> FamilyConfig { FamilyConfig::counters() }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn period_ms(mut self, period_ms: u64) -> Self {
        self.period_ms = period_ms;
        self
    }

    pub fn offset_ms(mut self, offset_ms: u64) -> Self {
        self.offset_ms = offset_ms;
        self
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_owned();
        self
    }

    pub fn hash_size(mut self, hash_size: usize) -> Self {
        self.hash_size = hash_size;
        self
    }

    pub fn jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    fn validate(&self, family: &'static str) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NoThreads(family));
        }
        if self.period_ms == 0 {
            return Err(ConfigError::ZeroPeriod(family));
        }
        if self.hash_size == 0 {
            return Err(ConfigError::ZeroHashSize(family));
        }
        Ok(())
    }
}

// A family section may set any subset of fields; the rest keep that family's defaults.
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FamilyOverrides {
    threads: Option<usize>,
    period_ms: Option<u64>,
    offset_ms: Option<u64>,
    prefix: Option<String>,
    hash_size: Option<usize>,
    jitter_ms: Option<u64>,
}

impl FamilyOverrides {
    fn apply(self, base: FamilyConfig) -> FamilyConfig {
        FamilyConfig {
            threads: self.threads.unwrap_or(base.threads),
            period_ms: self.period_ms.unwrap_or(base.period_ms),
            offset_ms: self.offset_ms.unwrap_or(base.offset_ms),
            prefix: self.prefix.unwrap_or(base.prefix),
            hash_size: self.hash_size.unwrap_or(base.hash_size),
            jitter_ms: self.jitter_ms.unwrap_or(base.jitter_ms),
        }
    }
}

fn timers_section<'de, D: Deserializer<'de>>(d: D) -> Result<FamilyConfig, D::Error> {
    FamilyOverrides::deserialize(d).map(|o| o.apply(FamilyConfig::timers()))
}

fn counters_section<'de, D: Deserializer<'de>>(d: D) -> Result<FamilyConfig, D::Error> {
    FamilyOverrides::deserialize(d).map(|o| o.apply(FamilyConfig::counters()))
}

fn gauges_section<'de, D: Deserializer<'de>>(d: D) -> Result<FamilyConfig, D::Error> {
    FamilyOverrides::deserialize(d).map(|o| o.apply(FamilyConfig::gauges()))
}

/// Opt-in extra timer statistics for matching paths.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathFilterConfig {
    /// Regular expressions matched against the metric path.  Empty disables the statistic.
    pub patterns: Vec<String>,
    /// Fewest points a path needs in a cycle to get the statistic.
    pub min_points: usize,
}

impl Default for PathFilterConfig {
    fn default() -> PathFilterConfig {
        PathFilterConfig {
            patterns: Vec::new(),
            min_points: 30,
        }
    }
}

impl PathFilterConfig {
    fn compile(&self) -> Result<Option<PathFilter>, ConfigError> {
        if self.patterns.is_empty() {
            return Ok(None);
        }

        let set = RegexSet::new(&self.patterns).map_err(|e| ConfigError::InvalidPattern(e.to_string()))?;
        Ok(Some(PathFilter::new(set, self.min_points)))
    }
}

/// Garbage collection of quiet paths.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    /// Milliseconds between collection passes.
    pub interval_ms: u64,
    /// Empty cycles after which a timer or counter path is reclaimed.
    pub threshold: u64,
    /// Empty cycles after which a gauge path is reclaimed.
    pub gauge_threshold: u64,
}

impl Default for GcConfig {
    fn default() -> GcConfig {
        GcConfig {
            enabled: true,
            interval_ms: 17_214,
            threshold: 8_640,
            gauge_threshold: 25_920,
        }
    }
}

/// Pool growth and output buffer sizing.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Metric entries allocated whenever the entry pool runs dry.
    pub entries_block: usize,
    /// Point chunks allocated whenever the chunk pool runs dry.
    pub chunks_block: usize,
    /// Output buffers allocated whenever the buffer pool runs dry.
    pub buffers_block: usize,
    /// Capacity reserved for each output buffer.
    pub buffer_size: usize,
    /// Fill level at which a worker posts its buffer and starts another.
    pub high_water: usize,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            entries_block: 512,
            chunks_block: 128,
            buffers_block: 128,
            buffer_size: 65_536,
            high_water: 61_440,
        }
    }
}

/// Target connection timing.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IoConfig {
    /// Milliseconds between target send ticks.
    pub send_interval_ms: u64,
    /// Milliseconds to wait after a failed connect before trying again.
    pub reconnect_ms: u64,
    /// Milliseconds a single connect attempt may take.
    pub connect_timeout_ms: u64,
}

impl Default for IoConfig {
    fn default() -> IoConfig {
        IoConfig {
            send_interval_ms: 10,
            reconnect_ms: 5_000,
            connect_timeout_ms: 2_000,
        }
    }
}

impl IoConfig {
    /// Send ticks to sit out after a failed connect.
    pub(crate) fn reconnect_ticks(&self) -> u32 {
        let ticks = self.reconnect_ms / self.send_interval_ms.max(1);
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }
}

/// Where a target sends to.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetKind {
    /// A line-protocol backend over TCP.
    Tcp { host: String, port: u16 },
    /// Standard output.
    Stdout,
    /// An in-process sink, read back through `Aggregator::memory_sink`.
    Memory,
}

fn default_max_queued() -> usize { 8_192 }

/// One downstream backend.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: TargetKind,
    /// Buffers that may wait for this target before new ones are dropped.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
}

impl TargetConfig {
    pub fn tcp(name: &str, host: &str, port: u16) -> TargetConfig {
        TargetConfig::new(
            name,
            TargetKind::Tcp {
                host: host.to_owned(),
                port,
            },
        )
    }

    pub fn stdout(name: &str) -> TargetConfig { TargetConfig::new(name, TargetKind::Stdout) }

    pub fn memory(name: &str) -> TargetConfig { TargetConfig::new(name, TargetKind::Memory) }

    fn new(name: &str, kind: TargetKind) -> TargetConfig {
        TargetConfig {
            name: name.to_owned(),
            kind,
            max_queued: default_max_queued(),
        }
    }

    pub fn max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }
}

fn default_factor() -> f64 { 1.0 }

fn default_enable() -> bool { true }

/// A counter derived from other counters.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SynthConfig {
    /// Path the result is reported under.
    pub target: String,
    /// Counter paths combined, in order.
    pub sources: Vec<String>,
    /// Operation name, e.g. `sum` or `ratio`.
    pub operation: String,
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Sources that may lack data before the synthetic is skipped for a cycle.  Defaults
    /// depend on the operation.
    #[serde(default)]
    pub max_absent: Option<usize>,
    #[serde(default = "default_enable")]
    pub enable: bool,
}

impl SynthConfig {
    pub fn new(target: &str, operation: &str, sources: &[&str]) -> SynthConfig {
        SynthConfig {
            target: target.to_owned(),
            sources: sources.iter().map(|s| (*s).to_owned()).collect(),
            operation: operation.to_owned(),
            factor: default_factor(),
            max_absent: None,
            enable: true,
        }
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn max_absent(mut self, max_absent: usize) -> Self {
        self.max_absent = Some(max_absent);
        self
    }

    pub fn enable(mut self, enable: bool) -> Self {
        self.enable = enable;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |why: String| Err(ConfigError::InvalidSynthetic(self.target.clone(), why));

        if self.target.is_empty() {
            return fail("empty target path".to_owned());
        }

        let op = match Operation::parse(&self.operation) {
            Some(op) => op,
            None => return fail(format!("unknown operation {:?}", self.operation)),
        };

        let parts = self.sources.len();
        if parts > MAX_SOURCES {
            return fail(format!("at most {} sources allowed, got {}", MAX_SOURCES, parts));
        }
        if parts < op.min_sources() || parts > op.max_sources() {
            return fail(format!(
                "{} takes {} to {} sources, got {}",
                self.operation,
                op.min_sources(),
                op.max_sources(),
                parts
            ));
        }
        if self.sources.iter().any(String::is_empty) {
            return fail("empty source path".to_owned());
        }
        if !self.factor.is_finite() {
            return fail("factor must be finite".to_owned());
        }

        Ok(())
    }
}

/// Periodic reporting on the aggregator itself.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SelfStatsConfig {
    pub enabled: bool,
    pub prefix: String,
    pub interval_ms: u64,
}

impl Default for SelfStatsConfig {
    fn default() -> SelfStatsConfig {
        SelfStatsConfig {
            enabled: true,
            prefix: "self.tally.".to_owned(),
            interval_ms: 10_000,
        }
    }
}

/// Resident memory ceiling.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Megabytes of resident memory past which we shut down.  Zero means no limit.
    pub max_mb: u64,
    pub check_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> MemoryConfig {
        MemoryConfig {
            max_mb: 0,
            check_interval_ms: 5_000,
        }
    }
}

/// A configuration builder for `Aggregator`.
///
/// Every section also deserializes with serde, and missing sections or fields keep their
/// defaults, so a config file reader only needs to hand us whatever it parsed.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(deserialize_with = "timers_section")]
    pub(crate) timers: FamilyConfig,
    #[serde(deserialize_with = "counters_section")]
    pub(crate) counters: FamilyConfig,
    #[serde(deserialize_with = "gauges_section")]
    pub(crate) gauges: FamilyConfig,
    pub(crate) thresholds: Vec<String>,
    pub(crate) moments: PathFilterConfig,
    pub(crate) mode: PathFilterConfig,
    pub(crate) gc: GcConfig,
    pub(crate) pool: PoolConfig,
    pub(crate) io: IoConfig,
    pub(crate) targets: Vec<TargetConfig>,
    pub(crate) synthetics: Vec<SynthConfig>,
    pub(crate) self_stats: SelfStatsConfig,
    pub(crate) memory: MemoryConfig,
    #[serde(skip)]
    pub(crate) clock: Clock,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            timers: FamilyConfig::timers(),
            counters: FamilyConfig::counters(),
            gauges: FamilyConfig::gauges(),
            thresholds: default_thresholds(),
            moments: PathFilterConfig::default(),
            mode: PathFilterConfig::default(),
            gc: GcConfig::default(),
            pool: PoolConfig::default(),
            io: IoConfig::default(),
            targets: Vec::new(),
            synthetics: Vec::new(),
            self_stats: SelfStatsConfig::default(),
            memory: MemoryConfig::default(),
            clock: Clock::default(),
        }
    }
}

/// Validated, compiled timer statistic settings.
pub(crate) struct Compiled {
    pub thresholds: Vec<Threshold>,
    pub moments: Option<PathFilter>,
    pub mode: Option<PathFilter>,
}

impl Configuration {
    /// Creates a new `Configuration` with default values.
    pub fn new() -> Configuration { Default::default() }

    /// Sets the timer family settings.
    ///
    /// Defaults to 6 workers on a 10 second period, reporting under `stats.timers.`.
    pub fn timers(mut self, timers: FamilyConfig) -> Self {
        self.timers = timers;
        self
    }

    /// Sets the counter family settings.
    ///
    /// Defaults to 2 workers on a 10 second period with no prefix.  Synthetic metrics run on
    /// the counter period.
    pub fn counters(mut self, counters: FamilyConfig) -> Self {
        self.counters = counters;
        self
    }

    /// Sets the gauge family settings.
    ///
    /// Defaults to 2 workers on a 10 second period with no prefix.
    pub fn gauges(mut self, gauges: FamilyConfig) -> Self {
        self.gauges = gauges;
        self
    }

    /// Sets the timer percentile thresholds.
    ///
    /// Defaults to `90`, `95` and `99`.
    ///
    /// Plain numbers are percentages; a trailing `m` makes them per-mille, so `999m` reports
    /// the 99.9th percentile.  Thresholds under the midpoint are labeled `lower_NN`, the rest
    /// `upper_NN`.  The median is always reported, so `50` is not allowed.
    pub fn thresholds<I, S>(mut self, thresholds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.thresholds = thresholds.into_iter().map(Into::into).collect();
        self
    }

    /// Reports standard deviation, skewness and kurtosis for timer paths matching any of
    /// `patterns` that have at least `min_points` values in a cycle.
    pub fn moments(mut self, patterns: &[&str], min_points: usize) -> Self {
        self.moments = PathFilterConfig {
            patterns: patterns.iter().map(|p| (*p).to_owned()).collect(),
            min_points,
        };
        self
    }

    /// Reports the most common value (and how often it occurred) for timer paths matching any
    /// of `patterns` that have at least `min_points` values in a cycle.
    pub fn mode(mut self, patterns: &[&str], min_points: usize) -> Self {
        self.mode = PathFilterConfig {
            patterns: patterns.iter().map(|p| (*p).to_owned()).collect(),
            min_points,
        };
        self
    }

    /// Sets garbage collection settings.
    ///
    /// Defaults to a pass every 17.2 seconds, reclaiming timers and counters after 8640
    /// empty cycles (a day at 10 seconds) and gauges after 25920 (three days).
    pub fn gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    /// Sets pool growth and output buffer sizing.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets target connection timing.
    ///
    /// Defaults to a 10ms send tick and a 5 second reconnect delay.
    pub fn io(mut self, io: IoConfig) -> Self {
        self.io = io;
        self
    }

    /// Adds an output target.  Report buffers go to every target.
    pub fn target(mut self, target: TargetConfig) -> Self {
        self.targets.push(target);
        self
    }

    /// Adds a synthetic metric.  Synthetics are evaluated in the order added.
    pub fn synthetic(mut self, synthetic: SynthConfig) -> Self {
        self.synthetics.push(synthetic);
        self
    }

    /// Sets self statistics reporting.
    pub fn self_stats(mut self, self_stats: SelfStatsConfig) -> Self {
        self.self_stats = self_stats;
        self
    }

    /// Sets the resident memory ceiling.
    ///
    /// Defaults to no limit.
    pub fn memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Sets the clock report timestamps and cycle timers come from.
    ///
    /// Defaults to the system wall clock.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Checks every setting, without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> { self.compile().map(|_| ()) }

    pub(crate) fn compile(&self) -> Result<Compiled, ConfigError> {
        self.timers.validate(Family::Timer.name())?;
        self.counters.validate(Family::Counter.name())?;
        self.gauges.validate(Family::Gauge.name())?;

        let thresholds = self
            .thresholds
            .iter()
            .map(|t| Threshold::parse(t))
            .collect::<Result<Vec<_>, _>>()?;

        let moments = self.moments.compile()?;
        let mode = self.mode.compile()?;

        if self.pool.high_water == 0 || self.pool.buffer_size <= self.pool.high_water {
            return Err(ConfigError::InvalidBufferSize);
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if target.max_queued == 0 {
                return Err(ConfigError::InvalidTarget(
                    target.name.clone(),
                    "max_queued must be greater than zero",
                ));
            }
            if let TargetKind::Tcp { host, .. } = &target.kind {
                if host.is_empty() {
                    return Err(ConfigError::InvalidTarget(target.name.clone(), "empty host"));
                }
            }
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::InvalidTarget(target.name.clone(), "duplicate target name"));
            }
        }

        let mut synth_targets = HashSet::new();
        for synth in &self.synthetics {
            synth.validate()?;
            if !synth_targets.insert(synth.target.as_str()) {
                return Err(ConfigError::InvalidSynthetic(
                    synth.target.clone(),
                    "duplicate synthetic target".to_owned(),
                ));
            }
        }

        Ok(Compiled {
            thresholds,
            moments,
            mode,
        })
    }

    /// Creates an `Aggregator` based on this configuration.
    pub fn build(self) -> Result<Aggregator, ConfigError> { Aggregator::from_config(self) }
}
