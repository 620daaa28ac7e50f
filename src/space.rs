//! Chunked bump-pointer spaces.
//!
//! A space is a chain of chunks. Allocation is word-aligned bump inside the
//! current chunk; overflow appends a chunk unless the allocation budget is
//! spent, in which case the caller is expected to collect. Inside a
//! [`NoAllocationFailureScope`] chunks are appended unconditionally so a
//! collection can always make forward progress.
//!
//! Chunk memory is zero-filled by the mapping, so a zero word marks the end
//! of the parsed objects in a chunk. Mark-sweep leaves fillers (low bits
//! `111`, size in the remaining bits) over dead regions so linear parsing
//! stays possible.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::HeapObject;
use crate::store_buffer::StoreBuffer;
use crate::system::{map_memory, unmap_memory, PAGE_SIZE};
use crate::visitor::{HeapObjectVisitor, PointerVisitor, PointsIntoSpaceChecker};

pub const DEFAULT_MINIMUM_CHUNK_SIZE: usize = 4 * 1024;
pub const DEFAULT_MAXIMUM_CHUNK_SIZE: usize = 256 * 1024;

const FILLER_TAG: usize = 0b111;

/// Total bytes currently mapped for all spaces.
static ALLOCATED: AtomicUsize = AtomicUsize::new(0);

pub fn total_allocated() -> usize {
    ALLOCATED.load(Ordering::Relaxed)
}

#[inline]
pub fn round_up_to_word(size: usize) -> usize {
    (size + 7) & !7
}

fn round_up_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A contiguous block of memory owned by a space.
pub struct Chunk {
    base: usize,
    limit: usize,
    next: *mut Chunk,
}

impl Chunk {
    fn allocate(size: usize) -> *mut Chunk {
        let size = round_up_to_page(size);
        let memory = map_memory(size).expect("out of chunk memory");
        ALLOCATED.fetch_add(size, Ordering::Relaxed);
        let base = memory.as_ptr() as usize;
        Box::into_raw(Box::new(Chunk {
            base,
            limit: base + size,
            next: std::ptr::null_mut(),
        }))
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn size(&self) -> usize {
        self.limit - self.base
    }

    pub fn includes(&self, address: usize) -> bool {
        address >= self.base && address < self.limit
    }

    unsafe fn free(chunk: *mut Chunk) {
        // SAFETY: chunks are only freed once, by their owning space.
        let chunk = unsafe { Box::from_raw(chunk) };
        ALLOCATED.fetch_sub(chunk.size(), Ordering::Relaxed);
        let ptr = NonNull::new(chunk.base as *mut u8).expect("chunk base");
        unsafe { unmap_memory(ptr, chunk.size()) };
    }
}

/// Free regions rebuilt by sweeping, used only when mark-sweep is the
/// configured collector.
#[derive(Default)]
pub struct FreeList {
    regions: Vec<(usize, usize)>,
}

impl FreeList {
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn add_region(&mut self, address: usize, size: usize) {
        debug_assert!(size % 8 == 0);
        // Leave a filler so linear object parsing can skip the hole.
        // SAFETY: the region lies inside a live chunk of the owning space.
        unsafe { *(address as *mut usize) = (size << 3) | FILLER_TAG };
        if size > std::mem::size_of::<usize>() {
            // SAFETY: same region; zero the rest so parsing past the filler
            // never sees stale words.
            unsafe {
                std::ptr::write_bytes(
                    (address + 8) as *mut u8,
                    0,
                    size - 8,
                )
            };
        }
        self.regions.push((address, size));
    }

    fn allocate(&mut self, size: usize) -> Option<usize> {
        let index = self
            .regions
            .iter()
            .position(|&(_, region_size)| region_size >= size)?;
        let (address, region_size) = self.regions[index];
        let remainder = region_size - size;
        if remainder > 0 {
            // A remainder always gets a filler so linear parsing can skip
            // it; regions too small to allocate from leave the list.
            // SAFETY: still inside the original free region.
            unsafe {
                *((address + size) as *mut usize) = (remainder << 3) | FILLER_TAG
            };
        }
        if remainder >= 16 {
            self.regions[index] = (address + size, remainder);
        } else {
            self.regions.swap_remove(index);
        }
        // SAFETY: the handed-out words must read as untouched memory.
        unsafe { std::ptr::write_bytes(address as *mut u8, 0, size) };
        Some(address)
    }
}

/// A linked list of chunks with bump allocation at the tail.
pub struct Space {
    first: *mut Chunk,
    last: *mut Chunk,
    used: usize,
    top: usize,
    limit: usize,
    allocation_budget: isize,
    no_allocation_nesting: u32,
    free_list: Option<FreeList>,
}

// The owning heap serializes all mutation; spaces cross threads only while
// the program is stopped.
unsafe impl Send for Space {}

impl Space {
    pub fn new(maximum_initial_size: usize) -> Space {
        Space {
            first: std::ptr::null_mut(),
            last: std::ptr::null_mut(),
            used: 0,
            top: 0,
            limit: 0,
            allocation_budget: maximum_initial_size
                .max(DEFAULT_MINIMUM_CHUNK_SIZE) as isize,
            no_allocation_nesting: 0,
            free_list: None,
        }
    }

    /// A space that also maintains a free list, for the mark-sweep
    /// collector.
    pub fn with_free_list(maximum_initial_size: usize) -> Space {
        let mut space = Space::new(maximum_initial_size);
        space.free_list = Some(FreeList::default());
        space
    }

    pub fn free_list(&mut self) -> Option<&mut FreeList> {
        self.free_list.as_mut()
    }

    pub fn default_chunk_size(heap_size: usize) -> usize {
        // Keep chunks between the bounds and below 20% of the heap.
        (heap_size / 5)
            .max(DEFAULT_MINIMUM_CHUNK_SIZE)
            .min(DEFAULT_MAXIMUM_CHUNK_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn set_used(&mut self, used: usize) {
        self.used = used;
    }

    /// Total size of all chunks.
    pub fn size(&self) -> usize {
        let mut total = 0;
        let mut chunk = self.first;
        while !chunk.is_null() {
            // SAFETY: chunk chain is owned by this space.
            let c = unsafe { &*chunk };
            total += c.size();
            chunk = c.next;
        }
        total
    }

    pub fn includes(&self, address: usize) -> bool {
        let mut chunk = self.first;
        while !chunk.is_null() {
            // SAFETY: chunk chain is owned by this space.
            let c = unsafe { &*chunk };
            if c.includes(address) {
                return true;
            }
            chunk = c.next;
        }
        false
    }

    pub fn in_no_allocation_failure_scope(&self) -> bool {
        self.no_allocation_nesting != 0
    }

    pub fn needs_garbage_collection(&self) -> bool {
        self.allocation_budget <= 0
    }

    pub fn adjust_allocation_budget(&mut self, used_outside_space: usize) {
        self.allocation_budget =
            (self.used() + used_outside_space).max(DEFAULT_MINIMUM_CHUNK_SIZE)
                as isize;
    }

    pub fn increase_allocation_budget(&mut self, size: usize) {
        self.allocation_budget += size as isize;
    }

    pub fn decrease_allocation_budget(&mut self, size: usize) {
        self.allocation_budget -= size as isize;
    }

    pub fn set_allocation_budget(&mut self, new_budget: isize) {
        self.allocation_budget = new_budget.max(DEFAULT_MINIMUM_CHUNK_SIZE as isize);
    }

    /// Word-aligned bump allocation. Returns 0 when a collection is
    /// needed. The budget is charged per allocated byte; it gates chunk
    /// growth, so an exhausted budget only fails once the current chunk
    /// is full.
    pub fn allocate(&mut self, size: usize) -> usize {
        let size = round_up_to_word(size);
        debug_assert!(size > 0);
        if self.top + size <= self.limit {
            let result = self.top;
            self.top += size;
            self.used += size;
            self.allocation_budget -= size as isize;
            return result;
        }
        if let Some(free_list) = self.free_list.as_mut() {
            if let Some(address) = free_list.allocate(size) {
                self.used += size;
                self.allocation_budget -= size as isize;
                return address;
            }
        }
        self.allocate_in_new_chunk(size)
    }

    fn allocate_in_new_chunk(&mut self, size: usize) -> usize {
        if !self.in_no_allocation_failure_scope()
            && self.needs_garbage_collection()
        {
            return 0;
        }
        let chunk_size = Space::default_chunk_size(self.used() + size).max(size);
        let chunk = Chunk::allocate(chunk_size);
        // SAFETY: freshly allocated chunk.
        let (base, chunk_size) = unsafe { ((*chunk).base, (*chunk).size()) };
        self.append(chunk);
        self.top = base + size;
        self.limit = base + chunk_size;
        self.used += size;
        self.allocation_budget -= size as isize;
        tracing::trace!(chunk_size, total = total_allocated(), "new chunk");
        base
    }

    /// Rewind the bump pointer if `location` is the most recent allocation.
    pub fn try_dealloc(&mut self, location: usize, size: usize) {
        let size = round_up_to_word(size);
        if self.top == location + size {
            self.top = location;
            self.used -= size;
            self.allocation_budget += size as isize;
            // The rewound words must read as untouched memory again.
            // SAFETY: the region was the most recent allocation in the
            // current chunk.
            unsafe { std::ptr::write_bytes(location as *mut u8, 0, size) };
        }
    }

    /// Make the space consistent for iteration. With zero-filled chunk
    /// tails nothing is pending; kept as the seam where an allocation mode
    /// switch must synchronize.
    pub fn flush(&mut self) {}

    fn append(&mut self, chunk: *mut Chunk) {
        if self.last.is_null() {
            self.first = chunk;
            self.last = chunk;
        } else {
            // SAFETY: last is a live chunk owned by this space.
            unsafe { (*self.last).next = chunk };
            self.last = chunk;
        }
    }

    pub fn first_chunk(&self) -> Option<&Chunk> {
        // SAFETY: chunk chain is owned by this space.
        unsafe { self.first.as_ref() }
    }

    /// Take all chunks of `other` and prepend them to this space.
    pub fn prepend_space(&mut self, mut other: Space) {
        if other.is_empty() {
            return;
        }
        if self.first.is_null() {
            self.first = other.first;
            self.last = other.last;
            self.top = other.top;
            self.limit = other.limit;
        } else {
            // SAFETY: both chains are live and disjoint.
            unsafe { (*other.last).next = self.first };
            self.first = other.first;
        }
        self.used += other.used;
        other.first = std::ptr::null_mut();
        other.last = std::ptr::null_mut();
        other.used = 0;
    }

    /// The allocation end for a chunk during linear parsing: the bump top
    /// for the chunk currently allocated into, the limit otherwise.
    fn parse_end(&self, chunk: &Chunk) -> usize {
        if chunk.includes(self.top) || self.top == chunk.limit {
            self.top
        } else {
            chunk.limit
        }
    }

    /// Walk every object in this space in address order.
    pub fn iterate_objects(&mut self, visitor: &mut dyn HeapObjectVisitor) {
        let mut chunk_ptr = self.first;
        while !chunk_ptr.is_null() {
            // SAFETY: chunk chain is owned by this space.
            let chunk = unsafe { &*chunk_ptr };
            let end = self.parse_end(chunk);
            let mut scan = chunk.base;
            while scan < end {
                // SAFETY: scan stays inside the chunk's mapped range.
                let word = unsafe { *(scan as *const usize) };
                if word == 0 {
                    break;
                }
                if word & FILLER_TAG == FILLER_TAG {
                    scan += word >> 3;
                    continue;
                }
                // SAFETY: a nonzero non-filler word is an object header.
                let object = unsafe { HeapObject::from_address(scan) };
                scan += object.size_in_bytes();
                visitor.visit(object);
            }
            visitor.chunk_end(scan);
            chunk_ptr = chunk.next;
        }
    }

    /// Cheney-style grey set processing: scan objects in allocation order,
    /// visiting their pointers, until the scan pointer catches up with the
    /// allocation top. New objects copied during the walk extend the walk.
    pub fn complete_scavenge(&mut self, visitor: &mut dyn PointerVisitor) {
        self.complete_scavenge_with(
            &mut |object, v| object.iterate_pointers(v),
            visitor,
        );
    }

    /// Grey set processing for the mutable collection: additionally
    /// records every scanned object with a field into `immutable_space`
    /// in the new store buffer, and keeps stacks tracked.
    pub fn complete_scavenge_mutable(
        &mut self,
        visitor: &mut dyn PointerVisitor,
        immutable_space: &Space,
        store_buffer: &mut StoreBuffer,
    ) {
        self.complete_scavenge_with(
            &mut |object, v| {
                object.iterate_pointers(v);
                if object.is_stack() {
                    store_buffer.insert(object);
                    return;
                }
                let mut checker = PointsIntoSpaceChecker::new(immutable_space);
                object.iterate_pointers(&mut checker);
                if checker.found() {
                    store_buffer.insert(object);
                }
            },
            visitor,
        );
    }

    fn complete_scavenge_with(
        &mut self,
        process: &mut dyn FnMut(HeapObject, &mut dyn PointerVisitor),
        visitor: &mut dyn PointerVisitor,
    ) {
        let mut chunk_ptr = self.first;
        if chunk_ptr.is_null() {
            return;
        }
        // The chunk chain and the allocation top move under us while the
        // visitor copies objects, so every read goes through the raw
        // pointer afresh.
        // SAFETY: chunks are never freed during a scavenge, and new ones
        // are only appended behind the one being scanned.
        let mut scan = unsafe { (*chunk_ptr).base };
        loop {
            let (base, limit) =
                unsafe { ((*chunk_ptr).base, (*chunk_ptr).limit) };
            let end = if self.top >= base && self.top <= limit {
                self.top
            } else {
                limit
            };
            while scan < end {
                // SAFETY: scan stays inside the chunk's mapped range.
                let word = unsafe { *(scan as *const usize) };
                if word == 0 {
                    break;
                }
                // SAFETY: a nonzero word at an object boundary is a header.
                let object = unsafe { HeapObject::from_address(scan) };
                scan += object.size_in_bytes();
                process(object, visitor);
            }
            if chunk_ptr == self.last && scan >= self.top {
                break;
            }
            // SAFETY: see above.
            let next = unsafe { (*chunk_ptr).next };
            if next.is_null() {
                // The allocation top advanced within this chunk while we
                // were scanning; go around again.
                continue;
            }
            chunk_ptr = next;
            // SAFETY: freshly appended live chunk.
            scan = unsafe { (*chunk_ptr).base };
        }
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        let mut chunk = self.first;
        while !chunk.is_null() {
            // SAFETY: chunk chain is owned and dropped exactly once.
            let next = unsafe { (*chunk).next };
            unsafe { Chunk::free(chunk) };
            chunk = next;
        }
    }
}

/// While alive, allocation in the space never fails; the space grows
/// instead. Used during collections to guarantee forward progress.
pub struct NoAllocationFailureScope {
    space: *mut Space,
}

impl NoAllocationFailureScope {
    pub fn new(space: &mut Space) -> Self {
        space.no_allocation_nesting += 1;
        Self { space }
    }
}

impl Drop for NoAllocationFailureScope {
    fn drop(&mut self) {
        // SAFETY: the space outlives the scope by construction.
        unsafe { (*self.space).no_allocation_nesting -= 1 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_is_word_aligned_and_contiguous() {
        let mut space = Space::new(0);
        let a = space.allocate(24);
        let b = space.allocate(17);
        let c = space.allocate(8);
        assert_ne!(a, 0);
        assert_eq!(b, a + 24);
        assert_eq!(c, b + 24, "17 bytes must round up to 24");
        assert_eq!(space.used(), 24 + 24 + 8);
        assert!(space.includes(a));
        assert!(space.includes(c));
        assert!(!space.includes(a.wrapping_sub(8)));
    }

    #[test]
    fn overflow_appends_a_chunk_until_the_budget_is_spent() {
        let mut space = Space::new(0);
        let first = space.allocate(64);
        assert_ne!(first, 0);
        let mut allocations = 1;
        loop {
            let result = space.allocate(DEFAULT_MINIMUM_CHUNK_SIZE / 2);
            if result == 0 {
                break;
            }
            allocations += 1;
            assert!(allocations < 10_000, "budget never ran out");
        }
        assert!(space.needs_garbage_collection());
        assert!(space.size() >= space.used());
    }

    #[test]
    fn no_allocation_failure_scope_grows_past_the_budget() {
        let mut space = Space::new(0);
        while space.allocate(DEFAULT_MINIMUM_CHUNK_SIZE / 2) != 0 {}
        {
            let _scope = NoAllocationFailureScope::new(&mut space);
            let result = space.allocate(DEFAULT_MINIMUM_CHUNK_SIZE / 2);
            assert_ne!(result, 0, "in-scope allocation must not fail");
        }
        assert_eq!(space.allocate(DEFAULT_MINIMUM_CHUNK_SIZE * 2), 0);
    }

    #[test]
    fn try_dealloc_rewinds_only_the_most_recent_allocation() {
        let mut space = Space::new(0);
        let a = space.allocate(32);
        let b = space.allocate(16);
        let used = space.used();
        space.try_dealloc(a, 32);
        assert_eq!(space.used(), used, "non-top allocation must not rewind");
        space.try_dealloc(b, 16);
        assert_eq!(space.used(), used - 16);
        let again = space.allocate(16);
        assert_eq!(again, b, "rewound region is reused");
    }

    #[test]
    fn prepend_space_transfers_chunks_and_used_bytes() {
        let mut receiver = Space::new(0);
        let first = receiver.allocate(64);
        let mut donor = Space::new(0);
        let donated = donor.allocate(128);
        let donor_used = donor.used();
        receiver.prepend_space(donor);
        assert!(receiver.includes(first));
        assert!(receiver.includes(donated));
        assert_eq!(receiver.used(), 64 + donor_used);
    }

    #[test]
    fn free_list_allocation_reuses_swept_regions() {
        let mut space = Space::with_free_list(0);
        let backing = space.allocate(1024);
        assert_ne!(backing, 0);
        // Fill the rest of the chunk so bump allocation is exhausted.
        let fill = space.allocate(DEFAULT_MINIMUM_CHUNK_SIZE - 1024);
        assert_ne!(fill, 0);
        // A sweep would now hand the first region back.
        space.free_list().expect("free list").add_region(backing, 512);
        let used_before = space.used();
        let reused = space.allocate(96);
        assert_eq!(reused, backing, "the swept region is reused");
        assert_eq!(space.used(), used_before + 96);
        let next = space.allocate(64);
        assert_eq!(next, backing + 96, "the remainder keeps serving");
    }
}
