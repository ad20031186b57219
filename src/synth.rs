//! Synthetic metrics: counters derived from other counters.
//!
//! A synthetic reads the stolen `proc` totals of its sources and writes its result into its
//! target's `proc` set, where the counter worker owning the target reports it like any other
//! counter.  That only works if it runs after every counter worker has stolen and before any
//! of them reports, so in the threaded runtime counter workers meet the evaluator at a `Gate`
//! between the two phases.
use crate::{
    configuration::SynthConfig,
    control::Control,
    data::MetricEntry,
    registry::Registry,
};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::{sync::Arc, time::Duration};

/// Most sources a single synthetic can combine.
pub const MAX_SOURCES: usize = 4;

// Cycles a synthetic may wait on missing sources before we complain about it.
const UNRESOLVED_WARN_CYCLES: u64 = 10;

const GATE_POLL: Duration = Duration::from_millis(100);

/// How a synthetic combines its sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Sum,
    Diff,
    Ratio,
    Product,
    Cap,
    Max,
    Min,
    Spread,
    Mean,
    MeanIf,
    Count,
    Active,
}

// How many sources may be absent by default.
enum AbsentLimit {
    Any,
    Fixed(usize),
    AllBut(usize),
}

impl Operation {
    /// Looks an operation up by name or alias.
    pub fn parse(name: &str) -> Option<Operation> {
        let op = match name {
            "sum" | "add" | "plus" => Operation::Sum,
            "diff" | "minus" => Operation::Diff,
            "ratio" | "div" => Operation::Ratio,
            "mult" | "product" => Operation::Product,
            "cap" | "limit" => Operation::Cap,
            "max" | "highest" => Operation::Max,
            "min" | "lowest" => Operation::Min,
            "spread" | "width" => Operation::Spread,
            "mean" | "average" => Operation::Mean,
            "meanIf" | "avgIf" => Operation::MeanIf,
            "count" | "nonzero" => Operation::Count,
            "active" | "present" => Operation::Active,
            _ => return None,
        };
        Some(op)
    }

    /// Fewest sources the operation accepts.
    pub fn min_sources(self) -> usize {
        match self {
            Operation::Sum | Operation::Product | Operation::Count | Operation::Active => 1,
            _ => 2,
        }
    }

    /// Most sources the operation accepts.
    pub fn max_sources(self) -> usize {
        match self {
            Operation::Diff | Operation::Ratio | Operation::Cap => 2,
            _ => MAX_SOURCES,
        }
    }

    fn absent_limit(self) -> AbsentLimit {
        match self {
            Operation::Diff | Operation::Ratio | Operation::Cap => AbsentLimit::Fixed(0),
            Operation::Spread => AbsentLimit::AllBut(2),
            Operation::Mean | Operation::MeanIf => AbsentLimit::AllBut(1),
            _ => AbsentLimit::Any,
        }
    }

    /// How many of `parts` sources may be absent before the synthetic stays quiet.
    pub fn default_max_absent(self, parts: usize) -> usize {
        match self.absent_limit() {
            AbsentLimit::Any => parts,
            AbsentLimit::Fixed(n) => n,
            AbsentLimit::AllBut(n) => parts.saturating_sub(n),
        }
    }

    /// Combines source values.  `totals[i]` is `None` for a source with no data this cycle.
    pub fn apply(self, totals: &[Option<f64>], factor: f64) -> f64 {
        let parts = totals.len();
        let present = totals.iter().filter_map(|t| *t).collect::<Vec<_>>();
        let value = |i: usize| totals.get(i).copied().flatten().unwrap_or(0.0);

        match self {
            Operation::Sum => factor * present.iter().sum::<f64>(),
            Operation::Diff => factor * (value(0) - value(1)),
            Operation::Ratio => {
                let b = value(1);
                if b == 0.0 {
                    0.0
                } else {
                    value(0) * factor / b
                }
            },
            Operation::Product => present.iter().fold(factor, |acc, v| acc * v),
            Operation::Cap => value(0).min(value(1)),
            Operation::Max => factor * present.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Operation::Min => factor * present.iter().copied().fold(f64::INFINITY, f64::min),
            Operation::Spread => {
                let max = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let min = present.iter().copied().fold(f64::INFINITY, f64::min);
                factor * (max - min)
            },
            Operation::Mean => factor * present.iter().sum::<f64>() / parts as f64,
            Operation::MeanIf => factor * present.iter().sum::<f64>() / present.len() as f64,
            Operation::Count => factor * present.len() as f64,
            Operation::Active => 1.0,
        }
    }
}

struct Synthetic {
    target: Arc<MetricEntry>,
    paths: Vec<String>,
    sources: Vec<Option<Arc<MetricEntry>>>,
    op: Operation,
    factor: f64,
    max_absent: usize,
    unresolved_cycles: u64,
}

impl Synthetic {
    fn resolve(&mut self, registry: &Registry) -> bool {
        let target = self.target.path_str();
        for (slot, path) in self.sources.iter_mut().zip(self.paths.iter()) {
            // A source the collector got to before our exemption is gone; look it up again.
            if slot.as_ref().map_or(false, |entry| !entry.is_valid()) {
                debug!("source {} for synthetic {} was reclaimed", path, target);
                *slot = None;
            }
            if slot.is_some() {
                continue;
            }

            if let Some(entry) = registry.lookup(path.as_bytes()) {
                // We hold on to it, so it must never be reaped.
                entry.exempt();
                if entry.is_valid() {
                    debug!("found source {} for synthetic {}", path, target);
                    *slot = Some(entry);
                }
            }
        }

        self.sources.iter().all(Option::is_some)
    }

    fn generate(&mut self, registry: &Registry) -> bool {
        if !self.resolve(registry) {
            self.unresolved_cycles += 1;
            if self.unresolved_cycles == UNRESOLVED_WARN_CYCLES {
                let missing = self
                    .sources
                    .iter()
                    .zip(self.paths.iter())
                    .filter(|(s, _)| s.is_none())
                    .map(|(_, p)| p.as_str())
                    .collect::<Vec<_>>();
                warn!(
                    "synthetic {} still has unresolved sources after {} cycles: {}",
                    self.target.path_str(),
                    self.unresolved_cycles,
                    missing.join(", ")
                );
            }
            return false;
        }

        let mut points = 0;
        let mut absent = 0;
        let mut totals = [None; MAX_SOURCES];
        for (total, source) in totals.iter_mut().zip(self.sources.iter().flatten()) {
            let proc = source.lock_proc();
            if proc.count == 0 {
                absent += 1;
            } else {
                points += proc.count;
                *total = Some(proc.total);
            }
        }

        if points == 0 || absent > self.max_absent {
            return false;
        }

        let value = self.op.apply(&totals[..self.sources.len()], self.factor);
        let mut target = self.target.lock_proc();
        target.total = value;
        target.count = points;
        target.pending = true;
        true
    }
}

/// Evaluates every enabled synthetic, in configuration order.
///
/// Order matters: a synthetic may use an earlier one's target as a source and see this
/// cycle's value.
pub struct Synthesizer {
    registry: Arc<Registry>,
    synths: Vec<Synthetic>,
}

impl Synthesizer {
    /// Creates (and exempts from collection) every synthetic target.
    ///
    /// Definitions must already be validated.
    pub(crate) fn new(registry: Arc<Registry>, configs: &[SynthConfig]) -> Synthesizer {
        let mut synths = Vec::new();
        for config in configs.iter().filter(|c| c.enable) {
            let op = match Operation::parse(&config.operation) {
                Some(op) => op,
                None => continue,
            };

            let target = registry.get_or_create(config.target.as_bytes());
            target.exempt();
            info!("synthetic {} ({:?} of {} sources)", config.target, op, config.sources.len());

            synths.push(Synthetic {
                target,
                paths: config.sources.clone(),
                sources: vec![None; config.sources.len()],
                op,
                factor: config.factor,
                max_absent: config
                    .max_absent
                    .unwrap_or_else(|| op.default_max_absent(config.sources.len())),
                unresolved_cycles: 0,
            });
        }

        Synthesizer { registry, synths }
    }

    pub fn len(&self) -> usize { self.synths.len() }

    pub fn is_empty(&self) -> bool { self.synths.is_empty() }

    /// Runs every synthetic once against the counters' stolen values.  Returns how many fired.
    pub fn generate(&mut self) -> usize {
        let registry = &self.registry;
        self.synths.iter_mut().map(|s| s.generate(registry)).filter(|fired| *fired).count()
    }
}

struct GateState {
    ready: usize,
    generation: u64,
}

/// Rendezvous between the counter workers and the synthetic evaluator.
///
/// Each counter worker arrives after stealing and blocks until the evaluator has seen every
/// worker arrive and run the synthetics.  A generation number tells waiters apart from one
/// cycle to the next, so a fast worker can never take a slow worker's release.
pub(crate) struct Gate {
    workers: usize,
    state: Mutex<GateState>,
    arrived: Condvar,
    released: Condvar,
}

impl Gate {
    pub fn new(workers: usize) -> Gate {
        Gate {
            workers: workers.max(1),
            state: Mutex::new(GateState { ready: 0, generation: 0 }),
            arrived: Condvar::new(),
            released: Condvar::new(),
        }
    }

    /// Worker side.  Returns `false` if shutdown was requested while waiting.
    pub fn arrive(&self, control: &Control) -> bool {
        let mut state = self.state.lock();
        state.ready += 1;
        let generation = state.generation;
        self.arrived.notify_one();

        while state.generation == generation {
            if !control.is_running() {
                return false;
            }
            self.released.wait_for(&mut state, GATE_POLL);
        }
        true
    }

    /// Evaluator side: waits for every worker, runs `f`, then lets them all go.
    ///
    /// Returns `false` without running `f` if shutdown was requested while waiting.
    pub fn evaluate<F: FnOnce()>(&self, control: &Control, f: F) -> bool {
        let mut state = self.state.lock();
        while state.ready < self.workers {
            if !control.is_running() {
                return false;
            }
            self.arrived.wait_for(&mut state, GATE_POLL);
        }

        state.ready -= self.workers;
        f();
        state.generation = state.generation.wrapping_add(1);
        self.released.notify_all();
        true
    }
}
