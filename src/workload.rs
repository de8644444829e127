//! Allocation churn: a steady stream of mid-sized allocations with the odd
//! random release, so the live set grows slowly while leaving holes behind.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{alloc::HeapService, config::SimulationConfig};

/// A live allocation and the size that was asked for. The handle owns the
/// block, so releasing it means giving the handle up.
#[derive(Debug)]
pub struct LiveBlock<H> {
    handle: H,
    requested: usize,
}

impl<H> LiveBlock<H> {
    pub const fn new(handle: H, requested: usize) -> Self {
        Self { handle, requested }
    }

    pub const fn handle(&self) -> &H {
        &self.handle
    }

    pub const fn requested(&self) -> usize {
        self.requested
    }

    pub fn into_handle(self) -> H {
        self.handle
    }
}

/// Every block currently allocated by the workload, in no particular order
#[derive(Debug)]
pub struct LiveSet<H> {
    blocks: Vec<LiveBlock<H>>,
}

impl<H> Default for LiveSet<H> {
    fn default() -> Self {
        Self { blocks: Vec::new() }
    }
}

impl<H> LiveSet<H> {
    /// Reserve room for `capacity` blocks up front, so the live set does not
    /// reallocate mid-run on the heap being measured.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            blocks: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LiveBlock<H>> {
        self.blocks.iter()
    }

    pub fn push(&mut self, block: LiveBlock<H>) {
        self.blocks.push(block);
    }

    /// Remove the block at `index`, moving the last block into its place.
    ///
    /// # Panics
    /// - If `index` is out of bounds
    pub fn swap_remove(&mut self, index: usize) -> LiveBlock<H> {
        self.blocks.swap_remove(index)
    }

    /// Release every block back to `heap`
    pub fn release_all<S>(&mut self, heap: &mut S)
    where
        S: HeapService<Handle = H>,
    {
        for block in self.blocks.drain(..) {
            heap.release(block.handle);
        }
    }
}

/// What one step of churn did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Churn {
    pub allocated: usize,
    /// Allocations the heap could not satisfy. They are skipped, not retried.
    pub failed: usize,
    /// Bytes requested by the skipped allocations
    pub failed_bytes: usize,
    pub released: bool,
}

pub struct WorkloadSimulator {
    allocations_per_step: usize,
    min_size: usize,
    size_range: usize,
    free_threshold: usize,
    rng: StdRng,
}

impl WorkloadSimulator {
    /// `config` must already be validated
    pub fn new(config: &SimulationConfig, seed: u64) -> Self {
        debug_assert!(config.validate().is_ok());
        Self {
            allocations_per_step: config.allocations_per_step,
            min_size: config.min_size,
            size_range: config.size_range,
            free_threshold: config.free_threshold,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn next_size(&mut self) -> usize {
        self.rng
            .gen_range(self.min_size..self.min_size + self.size_range)
    }

    /// Run one step of churn against `heap`: `allocations_per_step`
    /// allocations of random size, then at most one random release if the
    /// live set is over the threshold.
    pub fn step<S>(&mut self, heap: &mut S, live: &mut LiveSet<S::Handle>) -> Churn
    where
        S: HeapService,
    {
        let mut churn = Churn::default();
        for _ in 0..self.allocations_per_step {
            let size = self.next_size();
            match heap.allocate(size) {
                Some(handle) => {
                    live.push(LiveBlock::new(handle, size));
                    churn.allocated += 1;
                }
                None => {
                    churn.failed += 1;
                    churn.failed_bytes += size;
                }
            }
        }

        if live.len() > self.free_threshold {
            let index = self.rng.gen_range(0..live.len());
            heap.release(live.swap_remove(index).handle);
            churn.released = true;
        }
        churn
    }
}
