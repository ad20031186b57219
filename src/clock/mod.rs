use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

mod mock;
pub use self::mock::Mock;

/// A source of wall-clock time, in milliseconds since the Unix epoch.
///
/// Report lines carry wall-clock seconds, and cycle timers align to wall-clock period
/// boundaries, so everything that needs "now" goes through this trait.  Tests swap in `Mock`
/// to get deterministic timestamps.
pub trait ClockSource: Send + Sync {
    fn now_ms(&self) -> u64;

    fn now_secs(&self) -> u64 { self.now_ms() / 1000 }
}

impl<T: ClockSource + ?Sized> ClockSource for Arc<T> {
    fn now_ms(&self) -> u64 { (**self).now_ms() }
}

/// The system wall clock.
#[derive(Clone, Copy, Default)]
pub struct Wall;

impl ClockSource for Wall {
    fn now_ms(&self) -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as u64,
            // A clock set before 1970 is not something we can report against.
            Err(_) => 0,
        }
    }
}

/// Shared handle to whichever clock the pipeline runs on.
#[derive(Clone)]
pub struct Clock {
    source: Arc<dyn ClockSource>,
}

impl Clock {
    pub fn new() -> Clock { Clock::from_source(Wall) }

    pub fn from_source<S: ClockSource + 'static>(source: S) -> Clock {
        Clock {
            source: Arc::new(source),
        }
    }

    pub fn now_ms(&self) -> u64 { self.source.now_ms() }

    pub fn now_secs(&self) -> u64 { self.source.now_secs() }

    /// Milliseconds until the next firing of a loop with the given period and offset.
    ///
    /// Firings land on `ceil(now / period) * period + offset`, so every loop sharing a period
    /// wakes at the same wall-clock instant regardless of when it was started.
    pub fn until_next(&self, period_ms: u64, offset_ms: u64) -> u64 {
        let period = period_ms.max(1);
        let now = self.now_ms();
        let offset = offset_ms % period;

        let mut next = (now / period) * period + offset;
        if next <= now {
            next += period;
        }

        next - now
    }
}

impl Default for Clock {
    fn default() -> Clock { Clock::new() }
}

/// Deadline tracker for a periodic loop.
///
/// The first firing lands on the aligned boundary from `Clock::until_next`; after that each
/// deadline is the previous one plus the period.  A loop that overruns gets a zero wait and
/// catches up one cycle at a time instead of skipping ahead.
pub struct Ticker {
    clock: Clock,
    period_ms: u64,
    offset_ms: u64,
    next_ms: Option<u64>,
}

impl Ticker {
    pub fn new(clock: Clock, period_ms: u64, offset_ms: u64) -> Ticker {
        Ticker {
            clock,
            period_ms: period_ms.max(1),
            offset_ms,
            next_ms: None,
        }
    }

    /// Milliseconds to sleep before the next firing.
    pub fn wait_ms(&mut self) -> u64 {
        let now = self.clock.now_ms();
        let next = match self.next_ms {
            Some(prev) => prev + self.period_ms,
            None => now + self.clock.until_next(self.period_ms, self.offset_ms),
        };
        self.next_ms = Some(next);
        next.saturating_sub(now)
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, Mock, Ticker};
    use std::sync::Arc;

    #[test]
    fn test_until_next_aligns_to_period() {
        let mock = Arc::new(Mock::new(10_250));
        let clock = Clock::from_source(mock.clone());

        assert_eq!(clock.until_next(1000, 0), 750);
        assert_eq!(clock.until_next(1000, 500), 250);
        assert_eq!(clock.until_next(1000, 100), 850);

        mock.increment(750);
        assert_eq!(clock.until_next(1000, 0), 1000);
    }

    #[test]
    fn test_now_secs_truncates() {
        let clock = Clock::from_source(Mock::new(1_999));
        assert_eq!(clock.now_secs(), 1);
    }

    #[test]
    fn test_ticker_runs_late_cycles_without_skipping() {
        let mock = Arc::new(Mock::new(500));
        let mut ticker = Ticker::new(Clock::from_source(mock.clone()), 1000, 0);

        assert_eq!(ticker.wait_ms(), 500);

        // The 1000 cycle overran until 3500: 2000 and 3000 are due right away.
        mock.set(3500);
        assert_eq!(ticker.wait_ms(), 0);
        assert_eq!(ticker.wait_ms(), 0);
        assert_eq!(ticker.wait_ms(), 500);

        mock.set(4100);
        assert_eq!(ticker.wait_ms(), 900);
    }
}
