//! Fragmentation metrics for one instant of the heap.
//!
//! Internal fragmentation is the sum over live blocks of what the allocator
//! granted minus what was asked for. External fragmentation is
//! `1 - biggest_free / total_free`: near 0 when the free memory is one chunk,
//! near 1 when it is scattered in crumbs.

use log::error;
use serde::{Deserialize, Serialize};

use crate::{
    alloc::{HeapService, IntrospectionError},
    util::num::complement_ratio,
    workload::LiveSet,
};

/// The measurement of one time step. Never mutated once built.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeapStats {
    pub time_step: usize,
    pub total_user_requested: usize,
    pub total_heap_committed: usize,
    pub internal_fragmentation: usize,
    pub total_free_on_heap: usize,
    pub biggest_free_block: usize,
    pub external_fragmentation_ratio: f64,
}

/// Free space folded out of a free-chunk walk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeSpace {
    pub total: usize,
    pub biggest: usize,
    pub chunks: usize,
}

impl FreeSpace {
    pub fn add_chunk(&mut self, size: usize) {
        self.total = self.total.saturating_add(size);
        self.biggest = self.biggest.max(size);
        self.chunks += 1;
    }

    pub fn from_sizes<I>(sizes: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let mut free = Self::default();
        sizes.into_iter().for_each(|size| free.add_chunk(size));
        free
    }

    /// `0.0` when there is no free space at all
    pub fn external_fragmentation_ratio(&self) -> f64 {
        complement_ratio(self.biggest, self.total)
    }
}

impl HeapStats {
    pub fn new(time_step: usize, requested: usize, committed: usize, free: FreeSpace) -> Self {
        Self {
            time_step,
            total_user_requested: requested,
            total_heap_committed: committed,
            internal_fragmentation: committed.saturating_sub(requested),
            total_free_on_heap: free.total,
            biggest_free_block: free.biggest,
            external_fragmentation_ratio: free.external_fragmentation_ratio(),
        }
    }
}

/// A step's stats, plus why its free-space figures are zero if they were
/// degraded
#[derive(Debug)]
pub struct Measurement {
    pub stats: HeapStats,
    pub introspection_error: Option<IntrospectionError>,
}

/// Measure `heap` as it stands with `live` allocated.
///
/// Nothing here allocates or frees, so measuring twice without churn in
/// between gives the same stats. If the free-chunk walk fails, the step's free
/// space is reported as zero and the error is handed back instead.
pub fn measure<S>(heap: &S, live: &LiveSet<S::Handle>, time_step: usize) -> Measurement
where
    S: HeapService,
{
    let mut requested = 0usize;
    let mut committed = 0usize;
    for block in live.iter() {
        let usable = heap.usable_size(block.handle());
        if usable < block.requested() {
            error!(
                "allocator granted {usable} bytes for a {} byte request",
                block.requested()
            );
        }
        requested += block.requested();
        committed += usable;
    }

    let mut free = FreeSpace::default();
    let introspection_error = heap
        .walk_free_chunks(&mut |size| free.add_chunk(size))
        .err();
    if introspection_error.is_some() {
        free = FreeSpace::default();
    }

    Measurement {
        stats: HeapStats::new(time_step, requested, committed, free),
        introspection_error,
    }
}
