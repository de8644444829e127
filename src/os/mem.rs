//! Memory that is obtained straight from the kernel, so that using it never
//! touches the allocator being measured.

use std::{io, ptr, slice};

use libc::{
    mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use once_cell::sync::Lazy;

use crate::util::num::round_up;

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// The system page size
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// A private, anonymous, read/write mapping. Unmapped on drop.
pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned region of at least `size` bytes.
    /// Pages are not reserved in swap, so a large region only costs what is
    /// actually touched.
    ///
    /// # Errors
    /// - `InvalidInput` if `size` is zero or overflows when rounded to pages
    /// - The OS error if the mapping itself fails (almost always `ENOMEM`)
    pub fn map_noreserve(size: usize) -> io::Result<MmapRegion> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "attempted to mmap() 0 bytes",
            ));
        }
        let size = round_up(size, page_size()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "mapping size overflows")
        })?;
        // SAFETY: We ask for a fresh anonymous mapping and let the kernel pick
        // the address, so no existing memory can be affected.
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MmapRegion {
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Length in bytes, always a whole number of pages
    pub const fn len(&self) -> usize {
        self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The mapping is readable for `self.size` bytes for as long as
        // `self` lives, and anonymous mappings start zero-filled.
        unsafe { slice::from_raw_parts(self.ptr, self.size) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `size` are exactly what `mmap()` returned and
        // rounded to, and only this region owns them, so the range is
        // unmapped once. The glibc heap closes its report stream over the
        // region before dropping it, and the arena drops it with itself.
        unsafe {
            munmap(self.ptr.cast(), self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{page_size, MmapRegion};

    #[test]
    fn region_is_rounded_to_whole_pages() {
        let region = MmapRegion::map_noreserve(100).unwrap();
        assert_eq!(region.len(), page_size());
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn region_is_writable() {
        let region = MmapRegion::map_noreserve(page_size() + 1).unwrap();
        assert_eq!(region.len(), 2 * page_size());
        unsafe { region.as_ptr().add(page_size()).write(0xab) };
        assert_eq!(region.as_slice()[page_size()], 0xab);
    }

    #[test]
    fn zero_sized_region_is_rejected() {
        assert!(MmapRegion::map_noreserve(0).is_err());
    }
}
