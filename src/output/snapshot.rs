use fnv::FnvBuildHasher;
use hashbrown::HashMap;

/// A parsed view of report output.
///
/// Each report line is `<path> <value> <timestamp>`.  This makes it easy to check what a
/// target received without picking through the raw bytes.  When a path shows up more than
/// once, the last line wins.
#[derive(Debug, Default)]
pub struct Snapshot {
    values: HashMap<String, (f64, u64), FnvBuildHasher>,
}

impl Snapshot {
    /// Parses report lines, skipping any that are malformed.
    pub fn parse(data: &[u8]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for line in String::from_utf8_lossy(data).lines() {
            let mut parts = line.split_whitespace();
            let parsed = match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(path), Some(value), Some(ts), None) => {
                    value.parse::<f64>().ok().and_then(|v| ts.parse::<u64>().ok().map(|t| (path, v, t)))
                },
                _ => None,
            };

            if let Some((path, value, ts)) = parsed {
                snapshot.values.insert(path.to_owned(), (value, ts));
            }
        }
        snapshot
    }

    /// Gets the reported value for the given path.
    ///
    /// Returns `None` if the path was not reported.
    pub fn value(&self, path: &str) -> Option<f64> { self.values.get(path).map(|(v, _)| *v) }

    /// Gets the timestamp the given path was reported with.
    pub fn timestamp(&self, path: &str) -> Option<u64> { self.values.get(path).map(|(_, t)| *t) }

    pub fn contains(&self, path: &str) -> bool { self.values.contains_key(path) }

    pub fn len(&self) -> usize { self.values.len() }

    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    /// Every reported path, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths = self.values.keys().map(String::as_str).collect::<Vec<_>>();
        paths.sort_unstable();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::Snapshot;

    #[test]
    fn test_snapshot_parse_and_get() {
        let snapshot = Snapshot::parse(b"a.b 7 100\nstats.timers.t.count 3 100\nc -1.5 101\n");
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.value("a.b"), Some(7.0));
        assert_eq!(snapshot.value("c"), Some(-1.5));
        assert_eq!(snapshot.timestamp("c"), Some(101));
        assert_eq!(snapshot.value("missing"), None);
        assert_eq!(snapshot.paths(), vec!["a.b", "c", "stats.timers.t.count"]);
    }

    #[test]
    fn test_snapshot_skips_malformed_lines() {
        let snapshot = Snapshot::parse(b"ok 1 10\nnovalue\nbad x 10\ntoo many parts 1 10\n\nalso 2 nope\n");
        assert_eq!(snapshot.paths(), vec!["ok"]);
    }

    #[test]
    fn test_snapshot_last_line_wins() {
        let snapshot = Snapshot::parse(b"g 1 10\ng 2 20\n");
        assert_eq!(snapshot.value("g"), Some(2.0));
        assert_eq!(snapshot.timestamp("g"), Some(20));
    }
}
