//! A first-fit heap over a single `mmap()`'d region.
//!
//! ```plaintext
//! +-------+----------------+-------+------------+-----------------------+
//! | busy  | free           | busy  | free       | free (never used)     |
//! +-------+----------------+-------+------------+-----------------------+
//! ^ offset 0                                                 capacity ^
//! ```
//!
//! Chunks tile the whole region with no gaps. Bookkeeping lives in a map on the
//! side rather than in the region, but every chunk is still charged
//! [`CHUNK_OVERHEAD`] bytes as if it carried a header, so the numbers look
//! like those of a real boundary-tag allocator. Adjacent free chunks are
//! always merged, so no two free chunks are ever neighbours.

use std::{collections::BTreeMap, io, ptr::NonNull};

use log::error;

use super::{HeapBackend, HeapService, IntrospectionError, TuningOutcome};
use crate::{
    config::{AllocatorTuning, SimulationConfig},
    os::mem::MmapRegion,
    util::num::{round_down, round_up},
};

/// Chunk sizes and offsets are multiples of this
pub const CHUNK_ALIGN: usize = 16;
/// Bytes of every chunk that the caller can't use
pub const CHUNK_OVERHEAD: usize = 16;
/// A remainder smaller than this is not split off, it is handed out with the
/// allocation
pub const MIN_CHUNK: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Chunk {
    size: usize,
    busy: bool,
}

/// A live arena allocation
#[derive(Debug)]
pub struct ArenaBlock {
    offset: usize,
    data: NonNull<u8>,
}

impl ArenaBlock {
    /// Start of the usable bytes
    pub const fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }
}

pub struct ArenaHeap {
    region: MmapRegion,
    /// Chunk offset -> chunk, in address order
    chunks: BTreeMap<usize, Chunk>,
}

impl ArenaHeap {
    /// Map an arena of at least `capacity` bytes, rounded up to whole pages.
    /// The arena starts as a single free chunk.
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        let region = MmapRegion::map_noreserve(capacity)?;
        let size = round_down(region.len(), CHUNK_ALIGN);
        let mut chunks = BTreeMap::new();
        chunks.insert(0, Chunk { size, busy: false });
        Ok(Self { region, chunks })
    }

    /// Total bytes under management, busy and free, overhead included
    pub fn capacity(&self) -> usize {
        round_down(self.region.len(), CHUNK_ALIGN)
    }

    /// Number of chunks, busy and free
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunk size needed to serve a request of `size` bytes
    fn chunk_size_for(size: usize) -> Option<usize> {
        let size = size.checked_add(CHUNK_OVERHEAD)?;
        round_up(size, CHUNK_ALIGN).map(|size| size.max(MIN_CHUNK))
    }

    fn first_fit(&self, need: usize) -> Option<(usize, Chunk)> {
        self.chunks
            .iter()
            .find(|(_, chunk)| !chunk.busy && chunk.size >= need)
            .map(|(&offset, &chunk)| (offset, chunk))
    }

    /// Merge the free chunk at `offset` with its free neighbours
    fn coalesce(&mut self, mut offset: usize) {
        let Some(&chunk) = self.chunks.get(&offset) else {
            return;
        };
        let mut size = chunk.size;

        if let Some((&next_offset, &next)) = self.chunks.range(offset + 1..).next() {
            if next_offset == offset + size && !next.busy {
                self.chunks.remove(&next_offset);
                size += next.size;
            }
        }
        if let Some((&prev_offset, &prev)) = self.chunks.range(..offset).next_back() {
            if prev_offset + prev.size == offset && !prev.busy {
                self.chunks.remove(&offset);
                offset = prev_offset;
                size += prev.size;
            }
        }
        self.chunks.insert(offset, Chunk { size, busy: false });
    }
}

impl HeapService for ArenaHeap {
    type Handle = ArenaBlock;

    /// There is no fast path to disable, so tuning always holds trivially
    fn tune(&mut self, _: &AllocatorTuning) -> TuningOutcome {
        TuningOutcome::Applied
    }

    fn allocate(&mut self, size: usize) -> Option<ArenaBlock> {
        let need = Self::chunk_size_for(size)?;
        let (offset, chunk) = self.first_fit(need)?;

        let granted = if chunk.size - need >= MIN_CHUNK {
            self.chunks.insert(
                offset + need,
                Chunk {
                    size: chunk.size - need,
                    busy: false,
                },
            );
            need
        } else {
            chunk.size
        };
        self.chunks.insert(
            offset,
            Chunk {
                size: granted,
                busy: true,
            },
        );

        // SAFETY: `offset + CHUNK_OVERHEAD` is inside the chunk, which is
        // inside the region, and the region pointer is non-null.
        let data =
            unsafe { NonNull::new_unchecked(self.region.as_ptr().add(offset + CHUNK_OVERHEAD)) };
        Some(ArenaBlock { offset, data })
    }

    fn release(&mut self, handle: ArenaBlock) {
        match self.chunks.get_mut(&handle.offset) {
            Some(chunk) if chunk.busy => chunk.busy = false,
            _ => {
                error!("released a block at offset {} this arena does not own", handle.offset);
                return;
            }
        }
        self.coalesce(handle.offset);
    }

    fn usable_size(&self, handle: &ArenaBlock) -> usize {
        self.chunks
            .get(&handle.offset)
            .map_or(0, |chunk| chunk.size - CHUNK_OVERHEAD)
    }

    fn walk_free_chunks(&self, visit: &mut dyn FnMut(usize)) -> Result<(), IntrospectionError> {
        self.chunks
            .values()
            .filter(|chunk| !chunk.busy)
            .for_each(|chunk| visit(chunk.size - CHUNK_OVERHEAD));
        Ok(())
    }
}

impl HeapBackend for ArenaHeap {
    const NAME: &'static str = "arena";

    fn open(config: &SimulationConfig) -> io::Result<Self> {
        Self::with_capacity(config.arena_capacity)
    }
}
