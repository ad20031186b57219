//! Reclaims entries for paths that have gone quiet.
//!
//! A sweep runs in two passes over a registry.  The first pass takes no locks: it flags every
//! entry that has been empty for `threshold` or more cycles as invalid, which hides it from
//! lookups and stops any further steal from it.  The second pass takes each shard lock in turn just long
//! enough to unlink the flagged entries.  Everything unlinked goes back to the pools in one
//! batch at the end.
use crate::{
    data::{Family, PointChunk},
    pool::Pool,
    registry::Registry,
};
use log::debug;
use std::sync::Arc;

/// Runs one mark-and-reap pass over a registry.  Returns the number of entries reclaimed.
pub fn sweep(registry: &Registry, threshold: i64, chunks: &Pool<PointChunk>) -> usize {
    let mut marked = 0;
    registry.for_each(|entry| {
        // Exempt entries sit at -1 and never get here.
        if entry.empty() >= threshold {
            entry.set_valid(false);
            // A steal that claimed the entry meanwhile has reset `empty`; give it back.
            if entry.empty() < threshold {
                entry.set_valid(true);
            } else {
                marked += 1;
            }
        }
    });

    if marked == 0 {
        return 0;
    }

    let mut retired = Vec::with_capacity(marked);
    for idx in 0..registry.size() {
        let gone = {
            let shard = registry.lock_shard(idx);
            registry.unlink_invalid(idx, &shard)
        };

        for entry in &gone {
            chunks.release_list(entry.drain_chunks());
        }
        retired.extend(gone);
    }

    let reaped = retired.len();
    registry.recycle(retired);
    reaped
}

/// Sweeps every family's registry with its own threshold.
pub struct Collector {
    families: Vec<(Arc<Registry>, i64)>,
    chunks: Arc<Pool<PointChunk>>,
}

impl Collector {
    pub(crate) fn new(chunks: Arc<Pool<PointChunk>>) -> Collector {
        Collector {
            families: Vec::new(),
            chunks,
        }
    }

    pub(crate) fn watch(&mut self, registry: Arc<Registry>, threshold: u64) {
        let threshold = i64::try_from(threshold).unwrap_or(i64::MAX).max(1);
        self.families.push((registry, threshold));
    }

    /// Runs one pass over every family.  Returns the number reclaimed per family.
    pub fn collect(&self) -> Vec<(Family, usize)> {
        self.families
            .iter()
            .map(|(registry, threshold)| {
                let reaped = sweep(registry, *threshold, &self.chunks);
                if reaped > 0 {
                    debug!("reclaimed {} {} paths", reaped, registry.family());
                }
                (registry.family(), reaped)
            })
            .collect()
    }
}
