use std::{
    env,
    ffi::c_void,
    io,
    ptr::{self, NonNull},
    str,
};

use libc::{
    fclose, fflush, fmemopen, free, ftell, malloc, malloc_info, malloc_usable_size, mallopt,
    rewind, setvbuf, FILE, M_MMAP_MAX, M_MXFAST, _IONBF,
};
use log::{debug, warn};
use once_cell::sync::OnceCell;

use super::{malloc_info, HeapBackend, HeapService, IntrospectionError, TuningOutcome};
use crate::{
    config::{AllocatorTuning, SimulationConfig},
    os::mem::MmapRegion,
};

/// Room for the `malloc_info()` report. Mapped without reserving, so only the
/// pages the report actually fills cost anything.
const REPORT_CAPACITY: usize = 1 << 20;

/// `mallopt()` is process-wide, so it is only ever applied once.
static TUNING: OnceCell<TuningOutcome> = OnceCell::new();

/// The glibc tunable that empties the per-thread cache. Freed chunks that sit
/// in tcache look busy to `malloc_info()`.
const TCACHE_OFF: &str = "glibc.malloc.tcache_count=0";

/// A live `malloc()` allocation
#[derive(Debug)]
pub struct GlibcBlock(NonNull<c_void>);

/// The process heap, as managed by glibc `malloc()`.
///
/// Only one should exist at a time: it measures the whole process heap, so
/// anything else allocating on the same thread mid-step shows up in the
/// numbers.
///
/// The `malloc_info()` stream is opened once, unbuffered, over a mapping the
/// heap owns. Its `FILE` is the only thing it ever takes from `malloc()`, and
/// that happens before the first step, so walking the heap never changes it.
pub struct GlibcHeap {
    report: NonNull<FILE>,
    scratch: MmapRegion,
}

impl GlibcHeap {
    /// # Errors
    /// - The OS error if the report buffer cannot be mapped or the stream
    ///   over it cannot be opened
    pub fn new() -> io::Result<Self> {
        let scratch = MmapRegion::map_noreserve(REPORT_CAPACITY)?;
        // SAFETY: `scratch` is writable for `scratch.len()` bytes and is
        // owned by the returned heap, which closes the stream before
        // unmapping it.
        let report = unsafe {
            let stream = fmemopen(scratch.as_ptr() as *mut c_void, scratch.len(), c"w".as_ptr());
            let stream = NonNull::new(stream).ok_or_else(io::Error::last_os_error)?;
            if setvbuf(stream.as_ptr(), ptr::null_mut(), _IONBF, 0) != 0 {
                let err = io::Error::last_os_error();
                fclose(stream.as_ptr());
                return Err(err);
            }
            stream
        };
        Ok(Self { report, scratch })
    }

    /// Write a fresh `malloc_info()` report over the previous one and return
    /// it. Nothing here calls `malloc()` or `free()`.
    fn write_report(&self) -> Result<&[u8], IntrospectionError> {
        let stream = self.report.as_ptr();
        // SAFETY: `stream` stays open for the life of `self` and writes only
        // within `self.scratch`. It is flushed before the buffer is read.
        let len = unsafe {
            rewind(stream);
            if malloc_info(0, stream) != 0 || fflush(stream) != 0 {
                return Err(IntrospectionError::Report(io::Error::last_os_error()));
            }
            ftell(stream)
        };
        let len = usize::try_from(len)
            .map_err(|_| IntrospectionError::Report(io::Error::last_os_error()))?;
        Ok(&self.scratch.as_slice()[..len.min(self.scratch.len())])
    }
}

impl Drop for GlibcHeap {
    fn drop(&mut self) {
        // SAFETY: The stream was opened in `new()` and is closed only here,
        // before `self.scratch` is unmapped.
        unsafe {
            fclose(self.report.as_ptr());
        }
    }
}

fn apply_mallopt(tuning: &AllocatorTuning) -> TuningOutcome {
    let mut refused = Vec::new();
    // SAFETY: `mallopt()` only adjusts allocator parameters, which is sound at
    // any time.
    if tuning.disable_mmap && unsafe { mallopt(M_MMAP_MAX, 0) } == 0 {
        refused.push("M_MMAP_MAX");
    }
    if tuning.disable_fast_bins && unsafe { mallopt(M_MXFAST, 0) } == 0 {
        refused.push("M_MXFAST");
    }

    let tcache_off = env::var("GLIBC_TUNABLES").is_ok_and(|tunables| {
        tunables.split(':').any(|tunable| tunable == TCACHE_OFF)
    });

    let requested = usize::from(tuning.disable_mmap) + usize::from(tuning.disable_fast_bins);
    if requested > 0 && refused.len() == requested {
        TuningOutcome::Rejected(format!("mallopt() refused {}", refused.join(", ")))
    } else if !refused.is_empty() {
        TuningOutcome::Partial(format!("mallopt() refused {}", refused.join(", ")))
    } else if tuning.disable_fast_bins && !tcache_off {
        warn!("tcache is enabled; run with GLIBC_TUNABLES={TCACHE_OFF} to see every free chunk");
        TuningOutcome::Partial(String::from("tcache still enabled"))
    } else {
        TuningOutcome::Applied
    }
}

impl HeapService for GlibcHeap {
    type Handle = GlibcBlock;

    fn tune(&mut self, tuning: &AllocatorTuning) -> TuningOutcome {
        let mut first = false;
        let outcome = TUNING.get_or_init(|| {
            first = true;
            apply_mallopt(tuning)
        });
        if !first {
            debug!("mallopt() tuning already applied to this process, reusing outcome");
        }
        outcome.clone()
    }

    fn allocate(&mut self, size: usize) -> Option<GlibcBlock> {
        // SAFETY: `malloc()` is sound for any size, and a null return is
        // handled.
        NonNull::new(unsafe { malloc(size) }).map(GlibcBlock)
    }

    fn release(&mut self, handle: GlibcBlock) {
        // SAFETY: `GlibcBlock` is only made from a `malloc()` result and is
        // consumed here, so this is the one and only `free()` of it.
        unsafe { free(handle.0.as_ptr()) }
    }

    fn usable_size(&self, handle: &GlibcBlock) -> usize {
        // SAFETY: The handle is a live `malloc()` allocation.
        unsafe { malloc_usable_size(handle.0.as_ptr()) }
    }

    /// Parses the `malloc_info()` report in place, in memory that is mapped
    /// outside the heap.
    fn walk_free_chunks(&self, visit: &mut dyn FnMut(usize)) -> Result<(), IntrospectionError> {
        let report = str::from_utf8(self.write_report()?)
            .map_err(|_| IntrospectionError::Malformed("report is not utf-8"))?;
        malloc_info::parse_report(report, visit)
    }
}

impl HeapBackend for GlibcHeap {
    const NAME: &'static str = "glibc";

    fn open(_: &SimulationConfig) -> io::Result<Self> {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_size_covers_request() {
        let mut heap = GlibcHeap::new().unwrap();
        let block = heap.allocate(1000).unwrap();
        assert!(heap.usable_size(&block) >= 1000);
        heap.release(block);
    }

    #[test]
    fn live_report_parses() {
        let heap = GlibcHeap::new().unwrap();
        let summary = heap.free_chunk_summary().unwrap();
        assert!(summary.biggest() <= summary.total());
    }

    #[test]
    fn each_report_replaces_the_last() {
        let heap = GlibcHeap::new().unwrap();
        for _ in 0..3 {
            let report = str::from_utf8(heap.write_report().unwrap()).unwrap();
            assert!(report.starts_with("<malloc"));
            assert_eq!(report.matches("</malloc>").count(), 1);
        }
    }

    #[test]
    fn tuning_is_applied_once() {
        let mut heap = GlibcHeap::new().unwrap();
        let tuning = AllocatorTuning::default();
        let first = heap.tune(&tuning);
        let second = heap.tune(&AllocatorTuning {
            disable_mmap: false,
            disable_fast_bins: false,
        });
        assert_eq!(first, second);
    }
}
