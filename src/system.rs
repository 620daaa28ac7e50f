//! Page-aligned anonymous mappings backing heap chunks.

use std::ptr::NonNull;

pub const PAGE_SIZE: usize = 4 * 1024;

/// Map `size` bytes of zero-filled memory, page aligned.
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size % PAGE_SIZE == 0);
    // SAFETY: anonymous private mapping with no fixed address.
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(raw as *mut u8)
}

/// Release a mapping previously returned by [`map_memory`].
///
/// # Safety
/// `ptr` and `size` must describe exactly one live mapping.
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: by contract the mapping is live and exactly this large.
    let result = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
    debug_assert_eq!(result, 0, "munmap failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_zero_filled_and_page_aligned() {
        let size = 4 * PAGE_SIZE;
        let ptr = map_memory(size).expect("map memory");
        assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
        // SAFETY: freshly mapped region of `size` bytes.
        unsafe {
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), size);
            assert!(bytes.iter().all(|&b| b == 0));
            unmap_memory(ptr, size);
        }
    }
}
