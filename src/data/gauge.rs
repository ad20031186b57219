use super::MetricEntry;

/// Replaces the gauge value.
pub(crate) fn set(entry: &MetricEntry, value: f64) {
    let mut input = entry.lock_input();
    input.total = value;
    input.count += 1;
}

/// Moves the gauge value up or down relative to where it is.
pub(crate) fn adjust(entry: &MetricEntry, delta: f64) {
    let mut input = entry.lock_input();
    input.total += delta;
    input.count += 1;
}

/// Copies the current value over to the worker side.
///
/// Gauges keep their value across cycles, so only the update count is reset.  Returns
/// `false` if the gauge was not touched since the last steal.
pub(crate) fn steal(entry: &MetricEntry) -> bool {
    let mut input = entry.lock_input();
    if input.is_empty() || !entry.claim() {
        return false;
    }

    let mut proc = entry.lock_proc();
    proc.total = input.total;
    proc.count = input.count;
    proc.pending = true;
    input.count = 0;
    true
}

#[cfg(test)]
mod tests {
    use super::{adjust, set, steal};
    use crate::data::{live, Family};

    #[test]
    fn test_gauge_last_write_wins() {
        let entry = live(Family::Gauge, b"g");
        set(&entry, 5.0);
        set(&entry, 42.0);

        assert!(steal(&entry));
        let proc = entry.lock_proc();
        assert_eq!(proc.total, 42.0);
        assert_eq!(proc.count, 2);
    }

    #[test]
    fn test_gauge_keeps_value_across_steals() {
        let entry = live(Family::Gauge, b"g");
        set(&entry, 10.0);
        assert!(steal(&entry));
        assert!(!steal(&entry));

        adjust(&entry, -3.0);
        assert!(steal(&entry));
        assert_eq!(entry.lock_proc().total, 7.0);
    }
}
