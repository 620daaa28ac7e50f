//! The two-level dynamic-dispatch cache and the per-thread state that
//! owns it.
//!
//! The primary table is direct mapped and read by the interpreter fast
//! path; the secondary catches entries the primary evicts. Entries carry a
//! nonzero intrinsic tag: the address of an intrinsic implementation, or
//! the literal 1 for "call the function". A zero tag marks an empty slot.

use crate::object::Class;
use crate::platform::Monitor;
use crate::tagged::Value;

pub const PRIMARY_SIZE: usize = 512;
pub const SECONDARY_SIZE: usize = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Entry {
    pub class: usize,
    pub selector: usize,
    pub target: Value,
    pub tag: usize,
}

impl Entry {
    pub const fn empty() -> Entry {
        Entry { class: 0, selector: 0, target: Value::zero(), tag: 0 }
    }

    pub fn matches(&self, class: Class, selector: usize) -> bool {
        self.class == class.address() && self.selector == selector
    }
}

pub struct LookupCache {
    primary: Box<[Entry]>,
    secondary: Box<[Entry]>,
}

impl LookupCache {
    pub fn new() -> LookupCache {
        LookupCache {
            primary: vec![Entry::empty(); PRIMARY_SIZE].into_boxed_slice(),
            secondary: vec![Entry::empty(); SECONDARY_SIZE].into_boxed_slice(),
        }
    }

    pub fn compute_primary_index(class: Class, selector: usize) -> usize {
        ((class.address() >> 3) ^ selector) & (PRIMARY_SIZE - 1)
    }

    pub fn compute_secondary_index(class: Class, selector: usize) -> usize {
        Self::secondary_index_raw(class.address(), selector)
    }

    fn secondary_index_raw(class_address: usize, selector: usize) -> usize {
        ((class_address >> 3).wrapping_mul(31) ^ selector.rotate_left(8))
            & (SECONDARY_SIZE - 1)
    }

    pub fn primary(&self, index: usize) -> &Entry {
        &self.primary[index]
    }

    pub fn primary_mut(&mut self, index: usize) -> &mut Entry {
        &mut self.primary[index]
    }

    pub fn secondary(&self, index: usize) -> &Entry {
        &self.secondary[index]
    }

    /// Copy the entry about to be evicted from the primary into the
    /// secondary slot derived from its own keys.
    pub fn demote_primary(&mut self, index: usize) {
        let entry = self.primary[index];
        if entry.tag == 0 {
            return;
        }
        let slot = Self::secondary_index_raw(entry.class, entry.selector);
        self.secondary[slot] = entry;
    }

    pub fn clear(&mut self) {
        self.primary.fill(Entry::empty());
        self.secondary.fill(Entry::empty());
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread interpreter state: the lookup cache and the monitor the
/// scheduler parks idle threads on. Lives as long as the thread.
pub struct ThreadState {
    cache: Option<Box<LookupCache>>,
    idle_monitor: Monitor,
}

impl ThreadState {
    pub fn new() -> ThreadState {
        ThreadState { cache: None, idle_monitor: Monitor::new() }
    }

    pub fn ensure_cache(&mut self) -> &mut LookupCache {
        self.cache.get_or_insert_with(|| Box::new(LookupCache::new()))
    }

    pub fn cache(&mut self) -> Option<&mut LookupCache> {
        self.cache.as_deref_mut()
    }

    pub fn idle_monitor(&self) -> &Monitor {
        &self.idle_monitor
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;

    #[test]
    fn primary_and_secondary_indices_are_in_range_and_differ() {
        let mut program = Program::new(Default::default());
        let class = program.create_class(0);
        for selector in [0usize, 1, 0x501, 0xFFFF] {
            assert!(
                LookupCache::compute_primary_index(class, selector)
                    < PRIMARY_SIZE
            );
            assert!(
                LookupCache::compute_secondary_index(class, selector)
                    < SECONDARY_SIZE
            );
        }
    }

    #[test]
    fn demoted_entry_is_reachable_from_its_old_keys() {
        let mut program = Program::new(Default::default());
        let class = program.create_class(0);
        let selector = 0x207;
        let mut cache = LookupCache::new();
        let index = LookupCache::compute_primary_index(class, selector);
        *cache.primary_mut(index) = Entry {
            class: class.address(),
            selector,
            target: Value::from_smi(0),
            tag: 1,
        };
        cache.demote_primary(index);
        let secondary =
            cache.secondary(LookupCache::compute_secondary_index(
                class, selector,
            ));
        assert!(secondary.matches(class, selector));
        assert_eq!(secondary.tag, 1);
    }

    #[test]
    fn empty_entries_are_not_demoted() {
        let mut cache = LookupCache::new();
        cache.demote_primary(7);
        assert!(cache.secondary.iter().all(|entry| entry.tag == 0));
    }

    #[test]
    fn thread_state_creates_its_cache_lazily() {
        let mut state = ThreadState::new();
        assert!(state.cache().is_none());
        state.ensure_cache();
        assert!(state.cache().is_some());
    }
}
