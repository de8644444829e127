//! The allocator service the rest of the crate measures.
//!
//! [`HeapService`] is the only boundary the workload and the inspector see.
//! Each backend answers the free-chunk question its own way: glibc by parsing
//! the `malloc_info()` report, Windows by walking the heap under `HeapLock()`,
//! and the arena by walking its own chunk map. The backend is picked at build
//! time through [`PlatformHeap`].

use std::{error, fmt, io};

use serde::Serialize;

use crate::config::{AllocatorTuning, SimulationConfig};

#[cfg(unix)]
pub mod arena;
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub mod glibc;
pub mod malloc_info;
#[cfg(windows)]
pub mod windows;

#[cfg(all(target_os = "linux", target_env = "gnu", not(feature = "arena")))]
pub type PlatformHeap = glibc::GlibcHeap;

#[cfg(all(windows, not(feature = "arena")))]
pub type PlatformHeap = windows::WinHeap;

#[cfg(all(
    unix,
    any(feature = "arena", not(all(target_os = "linux", target_env = "gnu")))
))]
pub type PlatformHeap = arena::ArenaHeap;

#[cfg(all(windows, feature = "arena"))]
compile_error!("the arena backend needs mmap() and is only available on unix");

#[cfg(not(any(unix, windows)))]
compile_error!("unsupported platform");

/// What happened when the allocator was asked to tune itself
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum TuningOutcome {
    Applied,
    /// Some of the request took effect
    Partial(String),
    Rejected(String),
    /// The backend has nothing to tune
    Unsupported,
}

impl fmt::Display for TuningOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuningOutcome::Applied => write!(f, "applied"),
            TuningOutcome::Partial(why) => write!(f, "partially applied ({why})"),
            TuningOutcome::Rejected(why) => write!(f, "rejected ({why})"),
            TuningOutcome::Unsupported => write!(f, "unsupported"),
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum IntrospectionError {
    /// The allocator report could not be produced
    Report(io::Error),
    /// The allocator report could not be understood
    Malformed(&'static str),
    /// The heap walk stopped with this OS error code
    Walk(u32),
}

impl fmt::Display for IntrospectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntrospectionError::Report(e) => write!(f, "heap report failed: {e}"),
            IntrospectionError::Malformed(why) => write!(f, "malformed heap report: {why}"),
            IntrospectionError::Walk(code) => write!(f, "heap walk failed with error {code}"),
        }
    }
}

impl error::Error for IntrospectionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            IntrospectionError::Report(e) => Some(e),
            _ => None,
        }
    }
}

/// Sizes of every free, non-contiguous region at one instant
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeChunkSummary {
    sizes: Vec<usize>,
}

impl FreeChunkSummary {
    pub fn from_sizes(sizes: Vec<usize>) -> Self {
        Self { sizes }
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// `0` when there are no free chunks
    pub fn biggest(&self) -> usize {
        self.sizes.iter().copied().max().unwrap_or(0)
    }
}

/// An allocator whose layout can be inspected.
///
/// Handles are deliberately not `Copy`: [`HeapService::release`] consumes
/// the handle, so a block cannot be released twice. Dropping a handle without
/// releasing it leaks the block.
pub trait HeapService {
    type Handle;

    /// Apply process-wide tuning. Never fatal; the worst outcome is a heap
    /// that shows less fragmentation.
    fn tune(&mut self, tuning: &AllocatorTuning) -> TuningOutcome;

    /// `None` when the allocator is out of memory
    fn allocate(&mut self, size: usize) -> Option<Self::Handle>;

    fn release(&mut self, handle: Self::Handle);

    /// Bytes actually granted for `handle`, at least what was requested
    fn usable_size(&self, handle: &Self::Handle) -> usize;

    /// Call `visit` with the size of every free chunk on the heap. This must
    /// not allocate from, move, or coalesce the heap being walked.
    fn walk_free_chunks(&self, visit: &mut dyn FnMut(usize)) -> Result<(), IntrospectionError>;

    /// Collect the free chunk sizes. The collection itself allocates, so
    /// measurements go through [`HeapService::walk_free_chunks`] instead.
    fn free_chunk_summary(&self) -> Result<FreeChunkSummary, IntrospectionError> {
        let mut sizes = Vec::new();
        self.walk_free_chunks(&mut |size| sizes.push(size))?;
        Ok(FreeChunkSummary::from_sizes(sizes))
    }
}

/// A [`HeapService`] the binary can construct for the current platform
pub trait HeapBackend: HeapService + Sized {
    const NAME: &'static str;

    fn open(config: &SimulationConfig) -> io::Result<Self>;
}
