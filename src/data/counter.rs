use super::MetricEntry;

/// Adds a delta to the entry's pending total.
pub(crate) fn add(entry: &MetricEntry, delta: f64) {
    let mut input = entry.lock_input();
    input.total += delta;
    input.count += 1;
}

/// Moves the pending total over to the worker side.
///
/// Returns `false` if nothing was written since the last steal.
pub(crate) fn steal(entry: &MetricEntry) -> bool {
    let mut input = entry.lock_input();
    if input.is_empty() || !entry.claim() {
        return false;
    }

    // Anything stolen but not yet reported stays and gets added to.
    let mut proc = entry.lock_proc();
    proc.total += input.total;
    proc.count += input.count;
    proc.pending = true;

    // Counters never carry chunks.
    let left = input.clear();
    debug_assert!(left.is_empty());
    true
}
