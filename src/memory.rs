//! Resident memory measurement for the memory ceiling and self statistics.
use std::fs;

/// Current resident set size of this process, in kilobytes.
///
/// Reads `/proc/self/statm` where it exists.  Elsewhere this falls back to the peak resident
/// size from `getrusage`, which only ever grows but is close enough for a ceiling check.
pub fn resident_kb() -> Option<u64> { statm_kb().or_else(rusage_kb) }

fn statm_kb() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let pages = parse_statm(&statm)?;

    // SAFETY: sysconf has no memory-safety preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }

    Some(pages * page_size as u64 / 1024)
}

// The second field is resident pages.
fn parse_statm(statm: &str) -> Option<u64> { statm.split_whitespace().nth(1)?.parse().ok() }

fn rusage_kb() -> Option<u64> {
    // SAFETY: rusage is plain old data, and getrusage only writes into the struct we hand it.
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return None;
        }
        usage
    };

    let max_rss = u64::try_from(usage.ru_maxrss).ok()?;
    if cfg!(target_os = "macos") {
        Some(max_rss / 1024)
    } else {
        Some(max_rss)
    }
}

/// Decides when resident memory has gone past the configured ceiling.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ceiling {
    limit_kb: u64,
}

impl Ceiling {
    /// A ceiling of zero megabytes never trips.
    pub fn new(max_mb: u64) -> Ceiling {
        Ceiling {
            limit_kb: max_mb.saturating_mul(1024),
        }
    }

    pub fn limit_kb(&self) -> u64 { self.limit_kb }

    pub fn exceeded(&self, resident_kb: u64) -> bool { self.limit_kb > 0 && resident_kb > self.limit_kb }
}

#[cfg(test)]
mod tests {
    use super::{parse_statm, resident_kb, Ceiling};

    #[test]
    fn test_parse_statm() {
        assert_eq!(parse_statm("12345 678 90 1 0 300 0\n"), Some(678));
        assert_eq!(parse_statm("12345"), None);
        assert_eq!(parse_statm(""), None);
    }

    #[test]
    fn test_resident_kb_is_nonzero() {
        let kb = resident_kb().unwrap();
        assert!(kb > 0);
    }

    #[test]
    fn test_ceiling() {
        let unlimited = Ceiling::new(0);
        assert!(!unlimited.exceeded(u64::MAX));

        let ceiling = Ceiling::new(64);
        assert_eq!(ceiling.limit_kb(), 65_536);
        assert!(!ceiling.exceeded(65_536));
        assert!(ceiling.exceeded(65_537));
    }
}
