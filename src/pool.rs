//! Fixed-block object pools.
//!
//! Everything on the ingestion hot path (metric entries, point chunks, output buffers) is
//! recycled through a `Pool` rather than handed back to the allocator.  A pool keeps a
//! mutex-guarded free list; when the list runs dry it allocates a whole block of fresh slots
//! at once and threads them on, so the lock is amortized over many acquires.  Pools only ever
//! grow.
use parking_lot::Mutex;
use std::sync::Arc;

/// A value that can live on a pool free list.
pub trait Reusable: Send + Sized {
    /// Creates a fresh, empty slot.
    fn create() -> Self;

    /// Clears the slot before it goes back on the free list.
    ///
    /// Returns `false` if the slot cannot be reused, i.e. it is still referenced elsewhere.
    /// Such slots are dropped instead of recycled.
    fn reset(&mut self) -> bool;
}

/// Introspection counters for a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots currently sitting on the free list.
    pub free: usize,
    /// Slots ever allocated by this pool.
    pub total: usize,
}

struct FreeList<T> {
    slots: Vec<T>,
    total: usize,
}

/// A typed free-list allocator.
pub struct Pool<T> {
    name: &'static str,
    block: usize,
    inner: Mutex<FreeList<T>>,
}

impl<T: Reusable> Pool<T> {
    pub fn new(name: &'static str, block: usize) -> Pool<T> {
        Pool {
            name,
            block: block.max(1),
            inner: Mutex::new(FreeList {
                slots: Vec::new(),
                total: 0,
            }),
        }
    }

    /// Name used for self-reporting.
    pub fn name(&self) -> &'static str { self.name }

    /// Takes a slot off the free list, growing the pool by a whole block if it is empty.
    pub fn acquire(&self) -> T {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.pop() {
            return slot;
        }

        let block = self.block;
        inner.slots.reserve(block);
        for _ in 0..block - 1 {
            inner.slots.push(T::create());
        }
        inner.total += block;

        T::create()
    }

    /// Returns a single slot to the pool.
    pub fn release(&self, mut slot: T) {
        if !slot.reset() {
            self.forget(1);
            return;
        }

        self.inner.lock().slots.push(slot);
    }

    /// Returns many slots under a single lock acquisition.
    pub fn release_list<I>(&self, slots: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut lost = 0;
        let ready = slots
            .into_iter()
            .filter_map(|mut slot| {
                if slot.reset() {
                    Some(slot)
                } else {
                    lost += 1;
                    None
                }
            })
            .collect::<Vec<_>>();

        let mut inner = self.inner.lock();
        inner.slots.extend(ready);
        inner.total = inner.total.saturating_sub(lost);
    }

    /// Pre-allocates until at least `count` slots are free.
    pub fn reserve(&self, count: usize) {
        let mut inner = self.inner.lock();
        while inner.slots.len() < count {
            for _ in 0..self.block {
                inner.slots.push(T::create());
            }
            inner.total += self.block;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            free: inner.slots.len(),
            total: inner.total,
        }
    }

    // A slot we could not take back is no longer ours to count.
    fn forget(&self, count: usize) {
        let mut inner = self.inner.lock();
        inner.total = inner.total.saturating_sub(count);
    }
}

impl Reusable for Vec<u8> {
    fn create() -> Self { Vec::new() }

    fn reset(&mut self) -> bool {
        self.clear();
        true
    }
}

impl<T: Reusable + Sync> Reusable for Arc<T> {
    fn create() -> Self { Arc::new(T::create()) }

    fn reset(&mut self) -> bool {
        match Arc::get_mut(self) {
            Some(inner) => inner.reset(),
            None => false,
        }
    }
}
