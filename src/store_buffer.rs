//! The remembered set: mutable-heap objects that may hold references into
//! the shared heap, plus freshly allocated aggregates that need tracking.
//! A superset is fine; visitors are idempotent and duplicates are squeezed
//! out on demand.

use ahash::AHashSet;

use crate::object::HeapObject;
use crate::visitor::PointerVisitor;

#[derive(Default)]
pub struct StoreBuffer {
    objects: Vec<HeapObject>,
}

impl StoreBuffer {
    pub fn new() -> StoreBuffer {
        StoreBuffer::default()
    }

    pub fn insert(&mut self, object: HeapObject) {
        self.objects.push(object);
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, object: HeapObject) -> bool {
        self.objects.contains(&object)
    }

    /// Present every buffered object's pointers to the visitor. The same
    /// object may be presented more than once.
    pub fn iterate_pointers_to_immutable_space(
        &self,
        visitor: &mut dyn PointerVisitor,
    ) {
        for object in &self.objects {
            object.iterate_pointers(visitor);
        }
    }

    /// Install the buffer rebuilt by a mutable collection. Entries of the
    /// old buffer that were evacuated are carried over through their
    /// forwarding addresses; entries that died are dropped.
    pub fn replace_after_mutable_gc(&mut self, new_buffer: StoreBuffer) {
        let old = std::mem::replace(&mut self.objects, new_buffer.objects);
        for object in old {
            if let Some(forwarded) = object.forwarding_address() {
                self.objects.push(forwarded);
            }
        }
        self.compact();
    }

    /// Deduplicate in place, keeping first-insertion order.
    pub fn compact(&mut self) {
        let mut seen = AHashSet::with_capacity(self.objects.len());
        self.objects.retain(|object| seen.insert(object.address()));
    }

    pub fn number_of_entries(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::SignalKind;
    use crate::object::Array;
    use crate::program::Program;

    #[test]
    fn compact_squeezes_duplicates_but_keeps_order() {
        let mut program = Program::new(Default::default());
        let process = program.spawn_process(std::ptr::null_mut());
        // SAFETY: freshly spawned, single-threaded test.
        let process = unsafe { &mut *process };
        let a = Array::from_value(process.new_array(1)).object();
        let b = Array::from_value(process.new_array(1)).object();
        let mut buffer = StoreBuffer::new();
        buffer.insert(a);
        buffer.insert(b);
        buffer.insert(a);
        buffer.insert(b);
        assert_eq!(buffer.number_of_entries(), 4);
        buffer.compact();
        assert_eq!(buffer.number_of_entries(), 2);
        assert!(buffer.contains(a));
        assert!(buffer.contains(b));
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }
}
