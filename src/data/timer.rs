use super::MetricEntry;
use crate::pool::{Pool, Reusable};

/// Values held per point chunk.
pub const CHUNK_SIZE: usize = 2046;

/// A fixed-capacity run of timer values.
#[derive(Debug)]
pub struct PointChunk {
    vals: Vec<f64>,
}

impl PointChunk {
    pub fn is_full(&self) -> bool { self.vals.len() >= CHUNK_SIZE }

    pub fn len(&self) -> usize { self.vals.len() }

    pub fn is_empty(&self) -> bool { self.vals.is_empty() }

    pub fn values(&self) -> &[f64] { &self.vals }

    fn push(&mut self, value: f64) { self.vals.push(value) }
}

impl Reusable for PointChunk {
    fn create() -> Self {
        PointChunk {
            vals: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn reset(&mut self) -> bool {
        self.vals.clear();
        true
    }
}

/// Appends a value to the entry's head chunk, starting a new chunk when the head is full.
pub(crate) fn append(entry: &MetricEntry, value: f64, chunks: &Pool<PointChunk>) {
    let mut input = entry.lock_input();

    let need_chunk = match input.points.last() {
        Some(head) => head.is_full(),
        None => true,
    };
    if need_chunk {
        input.points.push(chunks.acquire());
    }

    if let Some(head) = input.points.last_mut() {
        head.push(value);
    }
    input.count += 1;
}

/// Hands the whole chunk list over to the worker side.
///
/// Chunks stolen earlier but not yet reported stay in front of the new ones.  Returns
/// `false` if no values arrived since the last steal.
pub(crate) fn steal(entry: &MetricEntry) -> bool {
    let mut input = entry.lock_input();
    if input.is_empty() || !entry.claim() {
        return false;
    }

    let mut proc = entry.lock_proc();
    proc.points.append(&mut input.points);
    proc.count += input.count;
    proc.pending = true;

    let left = input.clear();
    debug_assert!(left.is_empty());
    true
}

/// Copies every stolen value into one flat workspace.
pub(crate) fn flatten(chunks: &[PointChunk], workspace: &mut Vec<f64>) {
    workspace.clear();
    for chunk in chunks {
        workspace.extend_from_slice(chunk.values());
    }
}
