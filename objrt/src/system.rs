//! Page level memory for the arena: anonymous private mappings on unix,
//! page aligned zeroed heap blocks elsewhere.

use std::ptr::NonNull;

pub const OS_PAGE_SIZE: usize = 4096;

#[cfg(unix)]
mod os {
    use core::ffi::c_void;
    use std::ptr::NonNull;

    const PROT_READ: i32 = 0x1;
    const PROT_WRITE: i32 = 0x2;
    const MAP_PRIVATE: i32 = 0x02;
    #[cfg(target_os = "linux")]
    const MAP_ANON: i32 = 0x20;
    #[cfg(not(target_os = "linux"))]
    const MAP_ANON: i32 = 0x1000;
    const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    pub fn reserve(len: usize) -> Option<NonNull<u8>> {
        // SAFETY: no hint address and no file, the kernel picks a fresh range
        let ptr = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if ptr as isize == MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast())
    }

    /// # Safety
    /// `ptr` and `len` must be exactly what an earlier `reserve` returned
    /// and was called with.
    pub unsafe fn release(ptr: NonNull<u8>, len: usize) {
        let _ = unsafe { munmap(ptr.as_ptr().cast(), len) };
    }
}

#[cfg(not(unix))]
mod os {
    use std::{
        alloc::{Layout, alloc_zeroed, dealloc},
        ptr::NonNull,
    };

    use super::OS_PAGE_SIZE;

    pub fn reserve(len: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(len, OS_PAGE_SIZE).ok()?;
        // SAFETY: callers never ask for zero bytes
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    /// # Safety
    /// `ptr` and `len` must be exactly what an earlier `reserve` returned
    /// and was called with.
    pub unsafe fn release(ptr: NonNull<u8>, len: usize) {
        if let Ok(layout) = Layout::from_size_align(len, OS_PAGE_SIZE) {
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// Rounds `size` up to whole pages.
#[inline]
pub const fn page_align(size: usize) -> usize {
    (size + OS_PAGE_SIZE - 1) & !(OS_PAGE_SIZE - 1)
}

/// Fresh zeroed, page aligned memory of `size` bytes. `None` for an empty
/// request or when the system refuses.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    os::reserve(size)
}

/// Gives a [`map_memory`] region back. `size` must match the request.
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: pairs with map_memory per the contract above
    unsafe { os::release(ptr, size) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_memory_is_page_aligned_and_writable() {
        let size = page_align(10_000);
        assert_eq!(size, 3 * OS_PAGE_SIZE);

        let ptr = map_memory(size).expect("mapping failed");
        assert_eq!(ptr.as_ptr() as usize % OS_PAGE_SIZE, 0);

        unsafe {
            assert_eq!(*ptr.as_ptr(), 0);
            ptr.as_ptr().write_bytes(0x5a, size);
            assert_eq!(*ptr.as_ptr().add(size - 1), 0x5a);
        }
        unmap_memory(ptr, size);
    }

    #[test]
    fn zero_sized_mapping_is_refused() {
        assert!(map_memory(0).is_none());
    }
}
