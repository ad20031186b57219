//! The sharded path registry.
//!
//! Each family keeps a fixed array of bucket chains.  A path's checksum, reduced modulo the
//! table size, picks both its bucket and its shard lock (`index & lock_mask`), so the two can
//! never disagree.
//!
//! Chains are copy-on-write (`ArcSwap<Vec<_>>`).  Lookups load the current chain without
//! taking any lock: the only structural changes are insert and unlink, and each publishes a
//! whole new chain atomically, so a reader sees either the old chain or the new one.  A miss
//! on that optimistic read is only a hint; `get_or_create` re-checks under the shard lock
//! before inserting, which is what keeps concurrent first-touches from creating duplicates.
use crate::{
    data::{Family, MetricEntry},
    pool::Pool,
};
use arc_swap::ArcSwap;
use log::warn;
use parking_lot::{Mutex, MutexGuard};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

type Chain = Vec<Arc<MetricEntry>>;

const HASH_PRIMES: [u64; 8] = [2909, 3001, 3083, 3187, 3259, 3343, 3517, 3581];

/// Most shard locks a table will stripe its buckets across.
pub const MAX_SHARD_LOCKS: usize = 32;

/// Checksums a metric path.
///
/// Works a 32-bit word at a time, folding in groups of four words with a shift to keep every
/// bit involved, then picks up the trailing bytes individually.
pub fn path_hash(path: &[u8]) -> u64 {
    let mut sum: u64 = 5381;
    let mut ctr = path.len() >> 2;
    let mut words = path
        .chunks_exact(4)
        .map(|w| u64::from(u32::from_le_bytes([w[0], w[1], w[2], w[3]])));

    while ctr > 4 {
        for _ in 0..4 {
            if let Some(w) = words.next() {
                sum ^= w;
            }
        }
        ctr -= 4;

        sum <<= 4;
        sum = sum.wrapping_add(sum >> 32);
    }

    for w in words {
        sum = (sum << 1) ^ w;
    }

    let tail = &path[path.len() & !0x3..];
    let mut rem = tail.len();
    for &b in tail {
        rem -= 1;
        sum = sum.wrapping_add(u64::from(b) * HASH_PRIMES[rem]);
    }

    sum
}

/// Hands out entry ids.  Ids are monotonic and never reused, even across families.
#[derive(Default)]
pub struct IdSource(AtomicU64);

impl IdSource {
    pub fn next(&self) -> u64 { self.0.fetch_add(1, Ordering::Relaxed) + 1 }
}

/// Point-in-time path counts for a registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Paths currently in the table.
    pub live: i64,
    /// Paths ever created.
    pub creates: u64,
    /// Paths reclaimed by the garbage collector.
    pub reaped: u64,
}

/// A lock-striped hash table of metric entries for one family.
pub struct Registry {
    family: Family,
    buckets: Box<[ArcSwap<Chain>]>,
    locks: Box<[Mutex<()>]>,
    lock_mask: usize,
    entries: Arc<Pool<Arc<MetricEntry>>>,
    ids: Arc<IdSource>,
    counts: Mutex<RegistryStats>,
}

impl Registry {
    pub fn new(family: Family, size: usize, entries: Arc<Pool<Arc<MetricEntry>>>, ids: Arc<IdSource>) -> Registry {
        let size = size.max(1);
        let buckets = (0..size).map(|_| ArcSwap::from_pointee(Vec::new())).collect::<Vec<_>>();

        let lock_count = size.min(MAX_SHARD_LOCKS).next_power_of_two().min(MAX_SHARD_LOCKS);
        let locks = (0..lock_count).map(|_| Mutex::new(())).collect::<Vec<_>>();

        Registry {
            family,
            buckets: buckets.into_boxed_slice(),
            locks: locks.into_boxed_slice(),
            lock_mask: lock_count - 1,
            entries,
            ids,
            counts: Mutex::new(RegistryStats::default()),
        }
    }

    pub fn family(&self) -> Family { self.family }

    /// Number of buckets in the table.
    pub fn size(&self) -> usize { self.buckets.len() }

    pub(crate) fn index(&self, sum: u64) -> usize { (sum % self.buckets.len() as u64) as usize }

    /// Finds the entry for a path, if it exists.
    pub fn lookup(&self, path: &[u8]) -> Option<Arc<MetricEntry>> {
        let sum = path_hash(path);
        self.find(self.index(sum), sum, path)
    }

    /// Finds the entry for a path, creating it on first sight.
    pub fn get_or_create(&self, path: &[u8]) -> Arc<MetricEntry> {
        let sum = path_hash(path);
        let idx = self.index(sum);

        if let Some(entry) = self.find(idx, sum, path) {
            return entry;
        }

        self.create(idx, sum, path)
    }

    fn find(&self, idx: usize, sum: u64, path: &[u8]) -> Option<Arc<MetricEntry>> {
        self.buckets[idx].load().iter().find(|e| e.matches(sum, path)).cloned()
    }

    fn create(&self, idx: usize, sum: u64, path: &[u8]) -> Arc<MetricEntry> {
        // Build the new entry before taking the shard lock; the pool has its own.
        let id = self.ids.next();
        let mut slot = self.entries.acquire();
        let reused = match Arc::get_mut(&mut slot) {
            Some(entry) => {
                entry.assign(self.family, path, sum, id);
                true
            },
            None => false,
        };
        let fresh = if reused {
            slot
        } else {
            let mut entry = MetricEntry::new(self.family);
            entry.assign(self.family, path, sum, id);
            Arc::new(entry)
        };

        let guard = self.lock_shard(idx);
        let chain = self.buckets[idx].load_full();
        if let Some(existing) = chain.iter().find(|e| e.matches(sum, path)) {
            // Someone else got there between our unlocked scan and the lock.
            let existing = Arc::clone(existing);
            drop(guard);
            self.entries.release(fresh);
            return existing;
        }

        fresh.set_valid(true);
        let mut next = Vec::with_capacity(chain.len() + 1);
        next.extend(chain.iter().cloned());
        next.push(Arc::clone(&fresh));
        self.buckets[idx].store(Arc::new(next));
        drop(guard);

        let mut counts = self.counts.lock();
        counts.live += 1;
        counts.creates += 1;

        fresh
    }

    pub(crate) fn lock_shard(&self, idx: usize) -> MutexGuard<'_, ()> { self.locks[idx & self.lock_mask].lock() }

    /// Visits every valid entry in the buckets owned by `worker` out of `workers`.
    pub fn for_each_in_shard<F>(&self, worker: usize, workers: usize, mut f: F)
    where
        F: FnMut(&Arc<MetricEntry>),
    {
        let workers = workers.max(1);
        for idx in (worker..self.buckets.len()).step_by(workers) {
            let chain = self.buckets[idx].load();
            for entry in chain.iter().filter(|e| e.is_valid()) {
                f(entry);
            }
        }
    }

    /// Visits every entry still linked into the buckets owned by `worker`, valid or not.
    ///
    /// Reporting uses this, so data stolen just before the collector invalidated an entry
    /// still goes out.
    pub fn for_each_linked_in_shard<F>(&self, worker: usize, workers: usize, mut f: F)
    where
        F: FnMut(&Arc<MetricEntry>),
    {
        let workers = workers.max(1);
        for idx in (worker..self.buckets.len()).step_by(workers) {
            let chain = self.buckets[idx].load();
            for entry in chain.iter() {
                f(entry);
            }
        }
    }

    /// Visits every valid entry in the table.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&Arc<MetricEntry>),
    {
        self.for_each_in_shard(0, 1, f)
    }

    /// Unlinks every invalidated entry from a bucket, returning them.
    ///
    /// The caller must hold the shard lock for `idx`.
    pub(crate) fn unlink_invalid(&self, idx: usize, _shard: &MutexGuard<'_, ()>) -> Vec<Arc<MetricEntry>> {
        let chain = self.buckets[idx].load_full();
        let (keep, gone): (Chain, Chain) = chain.iter().cloned().partition(|e| e.is_valid());
        if !gone.is_empty() {
            self.buckets[idx].store(Arc::new(keep));
        }
        gone
    }

    /// Sends reclaimed entries back to the pool and takes them off the live count.
    pub(crate) fn recycle(&self, retired: Vec<Arc<MetricEntry>>) {
        let count = retired.len();
        if count == 0 {
            return;
        }

        self.entries.release_list(retired);

        let underflow = {
            let mut counts = self.counts.lock();
            counts.live -= count as i64;
            counts.reaped += count as u64;
            if counts.live < 0 {
                counts.live = 0;
                true
            } else {
                false
            }
        };

        if underflow {
            warn!("live path count for {} went negative, clamped to zero", self.family);
        }
    }

    pub fn stats(&self) -> RegistryStats { *self.counts.lock() }
}

#[cfg(test)]
mod tests {
    use super::{path_hash, IdSource, Registry};
    use crate::{data::Family, pool::Pool};
    use std::{collections::HashSet, sync::Arc, thread};

    fn registry(size: usize) -> Registry {
        Registry::new(
            Family::Counter,
            size,
            Arc::new(Pool::new("entries", 8)),
            Arc::new(IdSource::default()),
        )
    }

    #[test]
    fn test_path_hash_is_stable_and_spreads() {
        assert_eq!(path_hash(b""), 5381);
        assert_eq!(path_hash(b"app.requests"), path_hash(b"app.requests"));
        assert_ne!(path_hash(b"app.requests"), path_hash(b"app.responses"));

        let long = b"a.very.long.metric.path.with.many.words.in.it";
        assert_ne!(path_hash(long), path_hash(&long[..long.len() - 1]));

        let distinct = (0..1000).map(|i| path_hash(format!("host{}.cpu", i).as_bytes())).collect::<HashSet<_>>();
        assert!(distinct.len() > 990);
    }

    #[test]
    fn test_get_or_create_returns_same_entry() {
        let reg = registry(17);
        let a = reg.get_or_create(b"foo.bar");
        let b = reg.get_or_create(b"foo.bar");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.stats().live, 1);
        assert_eq!(reg.stats().creates, 1);

        let c = reg.get_or_create(b"foo.baz");
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(c.id() > a.id());
        assert_eq!(reg.stats().live, 2);
    }

    #[test]
    fn test_lookup_misses_unknown_path() {
        let reg = registry(17);
        assert!(reg.lookup(b"nope").is_none());
        reg.get_or_create(b"yep");
        assert_eq!(reg.lookup(b"yep").map(|e| e.path_str()), Some("yep".to_owned()));
    }

    #[test]
    fn test_concurrent_first_touch_creates_one_entry() {
        let reg = Arc::new(registry(3));
        let handles = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    (0..200)
                        .map(|i| reg.get_or_create(format!("path.{}", i).as_bytes()).id())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let results = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();
        for other in &results[1..] {
            assert_eq!(other, &results[0]);
        }
        assert_eq!(reg.stats().live, 200);

        let mut seen = 0;
        reg.for_each(|_| seen += 1);
        assert_eq!(seen, 200);
    }

    #[test]
    fn test_shards_partition_the_table() {
        let reg = registry(101);
        for i in 0..500 {
            reg.get_or_create(format!("m{}", i).as_bytes());
        }

        let mut ids = HashSet::new();
        for worker in 0..3 {
            reg.for_each_in_shard(worker, 3, |e| assert!(ids.insert(e.id())));
        }
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn test_recycle_clamps_live_count() {
        let reg = registry(7);
        let entry = reg.get_or_create(b"once");
        entry.set_valid(false);

        let idx = reg.index(entry.checksum());
        let gone = {
            let shard = reg.lock_shard(idx);
            reg.unlink_invalid(idx, &shard)
        };
        assert_eq!(gone.len(), 1);
        drop(entry);

        reg.recycle(gone);
        assert_eq!(reg.stats().live, 0);
        assert_eq!(reg.stats().reaped, 1);

        let fake = vec![reg.get_or_create(b"twice")];
        reg.recycle(fake.clone());
        reg.recycle(fake);
        assert_eq!(reg.stats().live, 0);
    }
}
