//! Visitor contracts shared by the scavenger, the marker, the validator
//! and the program collector.

use crate::object::HeapObject;
use crate::tagged::Value;

/// Visits, and may rewrite, pointer slots.
///
/// `visit_block` must be equivalent to calling `visit` on every slot in
/// `[start, end)`. Implementations must be idempotent: the store buffer may
/// present the same object more than once.
pub trait PointerVisitor {
    fn visit_block(&mut self, start: *mut Value, end: *mut Value);

    fn visit(&mut self, slot: *mut Value) {
        // SAFETY: one past a valid slot is a valid block end.
        self.visit_block(slot, unsafe { slot.add(1) });
    }

    /// Visiting the class slot of an object. By default no different from
    /// any other slot.
    fn visit_class(&mut self, slot: *mut Value) {
        self.visit(slot);
    }
}

/// Visits whole objects while walking a space linearly.
pub trait HeapObjectVisitor {
    fn visit(&mut self, object: HeapObject);

    /// Called after the last object of each chunk, with the address one
    /// past that object. Sweeping uses this to close out free runs.
    fn chunk_end(&mut self, _end: usize) {}
}

/// Adapter turning a pointer visitor into an object visitor by walking
/// each object's internal pointers.
pub struct HeapObjectPointerVisitor<'a> {
    visitor: &'a mut dyn PointerVisitor,
}

impl<'a> HeapObjectPointerVisitor<'a> {
    pub fn new(visitor: &'a mut dyn PointerVisitor) -> Self {
        Self { visitor }
    }
}

impl HeapObjectVisitor for HeapObjectPointerVisitor<'_> {
    fn visit(&mut self, object: HeapObject) {
        object.iterate_pointers(self.visitor);
    }
}

/// Pointer visitor that only records whether any visited slot holds a
/// reference into a given space.
pub struct PointsIntoSpaceChecker<'a> {
    space: &'a crate::space::Space,
    found: bool,
}

impl<'a> PointsIntoSpaceChecker<'a> {
    pub fn new(space: &'a crate::space::Space) -> Self {
        Self { space, found: false }
    }

    pub fn found(&self) -> bool {
        self.found
    }
}

impl PointerVisitor for PointsIntoSpaceChecker<'_> {
    /// Class words always target the program heap; they are not what the
    /// remembered set tracks.
    fn visit_class(&mut self, _slot: *mut Value) {}

    fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut current = start;
        while current < end {
            // SAFETY: the caller hands us a valid slot range.
            let value = unsafe { *current };
            if value.is_heap_object() && self.space.includes(value.address()) {
                self.found = true;
                return;
            }
            current = unsafe { current.add(1) };
        }
    }
}
