use std::{
    ffi::c_void,
    io, mem,
    ptr::{self, NonNull},
};

use windows_sys::Win32::{
    Foundation::{GetLastError, ERROR_NO_MORE_ITEMS, HANDLE},
    System::Memory::{
        HeapAlloc, HeapCompatibilityInformation, HeapCreate, HeapDestroy, HeapFree, HeapLock,
        HeapSetInformation, HeapSize, HeapUnlock, HeapWalk, PROCESS_HEAP_ENTRY,
        PROCESS_HEAP_ENTRY_BUSY, PROCESS_HEAP_REGION, PROCESS_HEAP_UNCOMMITTED_RANGE,
    },
};

use super::{HeapBackend, HeapService, IntrospectionError, TuningOutcome};
use crate::config::{AllocatorTuning, SimulationConfig};

/// Entries with any of these flags are not free blocks
const NOT_FREE: u32 = PROCESS_HEAP_ENTRY_BUSY as u32
    | PROCESS_HEAP_REGION as u32
    | PROCESS_HEAP_UNCOMMITTED_RANGE as u32;

/// `HeapCompatibilityInformation` value for the standard front end (no LFH)
const STANDARD_HEAP: u32 = 0;

#[derive(Debug)]
pub struct WinBlock(NonNull<c_void>);

/// A private growable heap. The process heap is shared with everything else
/// in the process (including Rust's own allocations), so it is not used.
pub struct WinHeap {
    heap: HANDLE,
}

/// Holds `HeapLock()` on a heap until dropped. Other threads allocating from
/// the heap block until then.
struct HeapLockGuard {
    heap: HANDLE,
}

impl HeapLockGuard {
    fn acquire(heap: HANDLE) -> Result<Self, IntrospectionError> {
        // SAFETY: `heap` is a live heap handle owned by a `WinHeap`.
        if unsafe { HeapLock(heap) } == 0 {
            return Err(IntrospectionError::Walk(unsafe { GetLastError() }));
        }
        Ok(Self { heap })
    }
}

impl Drop for HeapLockGuard {
    fn drop(&mut self) {
        // SAFETY: We hold the lock, acquired in `acquire()`.
        unsafe { HeapUnlock(self.heap) };
    }
}

impl WinHeap {
    pub fn create() -> io::Result<Self> {
        // SAFETY: No flags, growable, no initial commit.
        let heap = unsafe { HeapCreate(0, 0, 0) };
        if heap == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { heap })
    }
}

impl Drop for WinHeap {
    fn drop(&mut self) {
        // SAFETY: The heap was created in `create()` and is destroyed exactly
        // once. Blocks still live go with it; their handles can only be used
        // through `self`, which no longer exists.
        unsafe { HeapDestroy(self.heap) };
    }
}

impl HeapService for WinHeap {
    type Handle = WinBlock;

    fn tune(&mut self, tuning: &AllocatorTuning) -> TuningOutcome {
        if !tuning.disable_fast_bins {
            return TuningOutcome::Unsupported;
        }
        let info = STANDARD_HEAP;
        // SAFETY: `info` is a valid `ULONG` for the whole call.
        let ok = unsafe {
            HeapSetInformation(
                self.heap,
                HeapCompatibilityInformation,
                &info as *const u32 as *const c_void,
                mem::size_of::<u32>(),
            )
        };
        if ok == 0 {
            TuningOutcome::Rejected(format!("HeapSetInformation() failed with error {}", unsafe {
                GetLastError()
            }))
        } else {
            TuningOutcome::Applied
        }
    }

    fn allocate(&mut self, size: usize) -> Option<WinBlock> {
        // SAFETY: `self.heap` is live; a null return is handled.
        NonNull::new(unsafe { HeapAlloc(self.heap, 0, size) }).map(WinBlock)
    }

    fn release(&mut self, handle: WinBlock) {
        // SAFETY: The handle came from `HeapAlloc()` on this heap and is
        // consumed here.
        unsafe { HeapFree(self.heap, 0, handle.0.as_ptr()) };
    }

    fn usable_size(&self, handle: &WinBlock) -> usize {
        // SAFETY: The handle is a live block of this heap.
        let size = unsafe { HeapSize(self.heap, 0, handle.0.as_ptr()) };
        if size == usize::MAX {
            0
        } else {
            size
        }
    }

    fn walk_free_chunks(&self, visit: &mut dyn FnMut(usize)) -> Result<(), IntrospectionError> {
        let _lock = HeapLockGuard::acquire(self.heap)?;
        // SAFETY: All-zero is the documented starting state for `HeapWalk()`
        // (`lpData` null).
        let mut entry: PROCESS_HEAP_ENTRY = unsafe { mem::zeroed() };
        entry.lpData = ptr::null_mut();
        // SAFETY: The heap is locked for the whole walk and `entry` is only
        // ever filled in by `HeapWalk()`.
        while unsafe { HeapWalk(self.heap, &mut entry) } != 0 {
            if u32::from(entry.wFlags) & NOT_FREE == 0 {
                visit(entry.cbData as usize);
            }
        }
        match unsafe { GetLastError() } {
            ERROR_NO_MORE_ITEMS => Ok(()),
            code => Err(IntrospectionError::Walk(code)),
        }
    }
}

impl HeapBackend for WinHeap {
    const NAME: &'static str = "windows";

    fn open(_: &SimulationConfig) -> io::Result<Self> {
        Self::create()
    }
}
