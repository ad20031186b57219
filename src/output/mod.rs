//! Report buffering and fan-out.
//!
//! Workers fill plain byte buffers with report lines and hand them to the `Pipeline`, which
//! wraps each one in a reference-counted `OutputBuffer` and offers it to every target's
//! bounded queue.  A target whose queue is already full drops its reference on the spot:
//! producers are never blocked by a slow or dead backend.  The last target to finish with
//! (or drop) a buffer hands its bytes back to the pool.
use crate::pool::{Pool, PoolStats};
use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};

mod snapshot;
mod target;
mod transport;

pub use self::{
    snapshot::Snapshot,
    target::{Target, TargetStats},
    transport::{MemorySink, Stdout, Tcp, Transport},
};

/// A filled report buffer shared between every target it was posted to.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Vec<u8>,
}

impl OutputBuffer {
    pub fn bytes(&self) -> &[u8] { &self.data }

    pub fn len(&self) -> usize { self.data.len() }

    pub fn is_empty(&self) -> bool { self.data.is_empty() }
}

/// The pool behind every output buffer, plus leak accounting.
pub struct Buffers {
    pool: Pool<Vec<u8>>,
    size: usize,
    high_water: usize,
    outstanding: AtomicI64,
    posted: AtomicU64,
}

impl Buffers {
    pub fn new(block: usize, size: usize, high_water: usize) -> Buffers {
        Buffers {
            pool: Pool::new("buffers", block),
            size,
            high_water,
            outstanding: AtomicI64::new(0),
            posted: AtomicU64::new(0),
        }
    }

    /// Gets an empty buffer with room for at least the configured size.
    pub fn acquire(&self) -> Vec<u8> {
        let mut data = self.pool.acquire();
        data.reserve(self.size);
        data
    }

    /// Gives back a buffer that was never posted.
    pub fn recycle(&self, data: Vec<u8>) { self.pool.release(data) }

    /// Length past which a worker should post its buffer rather than append to it.
    pub fn high_water(&self) -> usize { self.high_water }

    fn wrap(&self, data: Vec<u8>) -> Arc<OutputBuffer> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.posted.fetch_add(1, Ordering::Relaxed);
        Arc::new(OutputBuffer { data })
    }

    /// Drops one target's handle to a buffer, recycling it once nobody holds it.
    ///
    /// Exactly one of any number of concurrent releases gets the bytes back.
    pub fn release(&self, buf: Arc<OutputBuffer>) {
        if let Some(buf) = Arc::into_inner(buf) {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.pool.release(buf.data);
        }
    }

    /// Buffers posted but not yet released by every target.
    pub fn outstanding(&self) -> i64 { self.outstanding.load(Ordering::Acquire) }

    /// Buffers ever posted.
    pub fn posted(&self) -> u64 { self.posted.load(Ordering::Relaxed) }

    pub fn pool_stats(&self) -> PoolStats { self.pool.stats() }
}

/// Fans report buffers out to every configured target.
pub struct Pipeline {
    buffers: Arc<Buffers>,
    targets: Vec<Arc<Target>>,
}

impl Pipeline {
    pub fn new(buffers: Arc<Buffers>, targets: Vec<Arc<Target>>) -> Pipeline { Pipeline { buffers, targets } }

    pub fn buffers(&self) -> &Arc<Buffers> { &self.buffers }

    pub fn targets(&self) -> &[Arc<Target>] { &self.targets }

    /// Posts a filled buffer to every target.  Never blocks.
    pub fn send(&self, data: Vec<u8>) {
        let (last, rest) = match self.targets.split_last() {
            Some(split) if !data.is_empty() => split,
            _ => {
                self.buffers.recycle(data);
                return;
            },
        };

        // The last target takes our own handle, so a buffer every target dropped can still
        // make it back to the pool.
        let buf = self.buffers.wrap(data);
        for target in rest {
            target.enqueue(Arc::clone(&buf));
        }
        last.enqueue(buf);
    }
}
