#![allow(dead_code)]

use std::collections::BTreeMap;

use heapfrag::{
    alloc::{HeapService, IntrospectionError, TuningOutcome},
    config::AllocatorTuning,
};

/// A block handed out by [`MockHeap`]
#[derive(Debug)]
pub struct MockBlock(u64);

/// A deterministic in-memory allocator.
///
/// Usable sizes are requests rounded up to `granularity`. The free summary is
/// `free_chunks`, followed by one hole per released block when
/// `track_holes` is set.
pub struct MockHeap {
    pub granularity: usize,
    pub free_chunks: Vec<usize>,
    pub track_holes: bool,
    /// Every `n`th allocation fails
    pub fail_every: Option<usize>,
    pub broken_walks: bool,
    pub tune_calls: usize,
    pub allocations: usize,
    pub releases: usize,
    holes: Vec<usize>,
    live: BTreeMap<u64, usize>,
    next_id: u64,
}

impl MockHeap {
    pub fn new(granularity: usize) -> Self {
        Self {
            granularity,
            free_chunks: Vec::new(),
            track_holes: false,
            fail_every: None,
            broken_walks: false,
            tune_calls: 0,
            allocations: 0,
            releases: 0,
            holes: Vec::new(),
            live: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Exact-size blocks with a fixed free summary
    pub fn exact(free_chunks: Vec<usize>) -> Self {
        Self {
            free_chunks,
            ..Self::new(1)
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }
}

impl HeapService for MockHeap {
    type Handle = MockBlock;

    fn tune(&mut self, _: &AllocatorTuning) -> TuningOutcome {
        self.tune_calls += 1;
        TuningOutcome::Applied
    }

    fn allocate(&mut self, size: usize) -> Option<MockBlock> {
        self.allocations += 1;
        if self.fail_every.is_some_and(|n| self.allocations % n == 0) {
            return None;
        }
        let usable = size.div_ceil(self.granularity) * self.granularity;
        self.next_id += 1;
        self.live.insert(self.next_id, usable);
        Some(MockBlock(self.next_id))
    }

    fn release(&mut self, handle: MockBlock) {
        let usable = self
            .live
            .remove(&handle.0)
            .expect("released a block that is not live");
        self.releases += 1;
        if self.track_holes {
            self.holes.push(usable);
        }
    }

    fn usable_size(&self, handle: &MockBlock) -> usize {
        self.live[&handle.0]
    }

    fn walk_free_chunks(&self, visit: &mut dyn FnMut(usize)) -> Result<(), IntrospectionError> {
        if self.broken_walks {
            return Err(IntrospectionError::Malformed("mock walk is broken"));
        }
        self.free_chunks
            .iter()
            .chain(self.holes.iter())
            .copied()
            .for_each(visit);
        Ok(())
    }
}
