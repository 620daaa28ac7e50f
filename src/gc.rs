//! The collectors: a copying scavenger and the optional mark-sweep
//! alternative, plus the stack-chaining variants the program collector
//! builds on.

use crate::object::{HeapObject, InstanceKind, Stack};
use crate::process::Process;
use crate::space::{FreeList, Space};
use crate::tagged::Value;
use crate::visitor::{HeapObjectVisitor, PointerVisitor};

/// Which mutable collector a program runs. Selected at construction; both
/// variants share the weak-pointer and port-cleanup phases.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum GcStrategy {
    #[default]
    Scavenge,
    MarkSweep,
}

/// Copies every reachable from-space object into to-space, leaving
/// forwarding addresses behind and rewriting the visited slots.
pub struct ScavengeVisitor {
    from: *const Space,
    to: *mut Space,
}

impl ScavengeVisitor {
    pub fn new(from: *const Space, to: *mut Space) -> ScavengeVisitor {
        ScavengeVisitor { from, to }
    }

    #[inline]
    fn scavenge_pointer(&mut self, slot: *mut Value) -> Option<HeapObject> {
        // SAFETY: the caller hands us a valid slot.
        let value = unsafe { *slot };
        if !value.is_heap_object() {
            return None;
        }
        let object = HeapObject::from_value(value);
        // SAFETY: from outlives the collection.
        if !unsafe { &*self.from }.includes(object.address()) {
            return None;
        }
        let forwarded = object.forwarding_address().is_some();
        // SAFETY: to outlives the collection and is growable in scope.
        let copy = object.clone_in_to_space(unsafe { &mut *self.to });
        // SAFETY: same slot as read above.
        unsafe { *slot = copy.to_value() };
        (!forwarded).then_some(copy)
    }
}

impl PointerVisitor for ScavengeVisitor {
    fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            self.scavenge_pointer(slot);
            // SAFETY: still inside the block.
            slot = unsafe { slot.add(1) };
        }
    }
}

/// Scavenger that additionally chains every newly copied stack behind the
/// process's current coroutine stack, which must be visited first.
pub struct ScavengeAndChainStacksVisitor {
    process: *mut Process,
    inner: ScavengeVisitor,
    number_of_stacks: usize,
}

impl ScavengeAndChainStacksVisitor {
    pub fn new(
        process: *mut Process,
        from: *const Space,
        to: *mut Space,
    ) -> ScavengeAndChainStacksVisitor {
        ScavengeAndChainStacksVisitor {
            process,
            inner: ScavengeVisitor::new(from, to),
            number_of_stacks: 0,
        }
    }

    pub fn number_of_stacks(&self) -> usize {
        self.number_of_stacks
    }

    fn chain_stack(&mut self, stack: Stack) {
        self.number_of_stacks += 1;
        // SAFETY: the process outlives its own collection.
        let process_stack = unsafe { &*self.process }.stack();
        if process_stack != stack {
            // The current coroutine stack is visited first, so it already
            // lives in to-space and heads the chain.
            stack.set_next(process_stack.next());
            process_stack.set_next(stack.to_value());
        }
    }
}

impl PointerVisitor for ScavengeAndChainStacksVisitor {
    fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            if let Some(copy) = self.inner.scavenge_pointer(slot) {
                if copy.kind() == InstanceKind::Stack {
                    self.chain_stack(Stack::cast(copy));
                }
            }
            // SAFETY: still inside the block.
            slot = unsafe { slot.add(1) };
        }
    }
}

/// Grey objects awaiting their pointer scan during marking.
#[derive(Default)]
pub struct MarkingStack {
    objects: Vec<HeapObject>,
}

impl MarkingStack {
    pub fn push(&mut self, object: HeapObject) {
        self.objects.push(object);
    }

    /// Drain the stack, visiting the pointers of every popped object.
    /// Visiting may push further objects.
    pub fn process(&mut self, visitor: &mut dyn PointerVisitor) {
        while let Some(object) = self.objects.pop() {
            object.iterate_pointers(visitor);
        }
    }
}

/// Marks every reachable object in one space.
pub struct MarkingVisitor {
    space: *const Space,
    marking_stack: *mut MarkingStack,
}

impl MarkingVisitor {
    pub fn new(
        space: *const Space,
        marking_stack: *mut MarkingStack,
    ) -> MarkingVisitor {
        MarkingVisitor { space, marking_stack }
    }

    #[inline]
    fn mark_pointer(&mut self, slot: *mut Value) -> Option<HeapObject> {
        // SAFETY: the caller hands us a valid slot.
        let value = unsafe { *slot };
        if !value.is_heap_object() {
            return None;
        }
        let object = HeapObject::from_value(value);
        // SAFETY: the space outlives the collection.
        if !unsafe { &*self.space }.includes(object.address()) {
            return None;
        }
        if object.is_marked() {
            return None;
        }
        object.set_mark();
        // SAFETY: the marking stack outlives the collection.
        unsafe { &mut *self.marking_stack }.push(object);
        Some(object)
    }
}

impl PointerVisitor for MarkingVisitor {
    fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            self.mark_pointer(slot);
            // SAFETY: still inside the block.
            slot = unsafe { slot.add(1) };
        }
    }
}

/// Marker that also chains stacks, mirroring the scavenging variant.
pub struct MarkAndChainStacksVisitor {
    process: *mut Process,
    inner: MarkingVisitor,
    number_of_stacks: usize,
}

impl MarkAndChainStacksVisitor {
    pub fn new(
        process: *mut Process,
        space: *const Space,
        marking_stack: *mut MarkingStack,
    ) -> MarkAndChainStacksVisitor {
        MarkAndChainStacksVisitor {
            process,
            inner: MarkingVisitor::new(space, marking_stack),
            number_of_stacks: 0,
        }
    }

    pub fn number_of_stacks(&self) -> usize {
        self.number_of_stacks
    }
}

impl PointerVisitor for MarkAndChainStacksVisitor {
    fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            if let Some(object) = self.inner.mark_pointer(slot) {
                if object.kind() == InstanceKind::Stack {
                    self.number_of_stacks += 1;
                    let stack = Stack::cast(object);
                    // SAFETY: the process outlives its own collection.
                    let process_stack =
                        unsafe { &*self.process }.stack();
                    if process_stack != stack {
                        stack.set_next(process_stack.next());
                        process_stack.set_next(stack.to_value());
                    }
                }
            }
            // SAFETY: still inside the block.
            slot = unsafe { slot.add(1) };
        }
    }
}

/// Rebuilds the free list from the mark bits, clearing them as it goes.
pub struct SweepingVisitor {
    free_list: *mut FreeList,
    free_start: usize,
    used: usize,
}

impl SweepingVisitor {
    pub fn new(free_list: *mut FreeList) -> SweepingVisitor {
        // SAFETY: the free list outlives the sweep.
        unsafe { &mut *free_list }.clear();
        SweepingVisitor { free_list, free_start: 0, used: 0 }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    fn end_free_region(&mut self, end: usize) {
        if self.free_start != 0 {
            // SAFETY: the free list outlives the sweep.
            unsafe { &mut *self.free_list }
                .add_region(self.free_start, end - self.free_start);
            self.free_start = 0;
        }
    }
}

impl HeapObjectVisitor for SweepingVisitor {
    fn visit(&mut self, object: HeapObject) {
        if object.is_marked() {
            self.end_free_region(object.address());
            object.clear_mark();
            self.used += object.size_in_bytes();
        } else if self.free_start == 0 {
            self.free_start = object.address();
        }
    }

    fn chunk_end(&mut self, end: usize) {
        self.end_free_region(end);
    }
}

/// Asserts that every visited pointer lands in one of the given spaces.
/// Driven by the `validate_heaps` flag.
pub struct HeapPointerValidator {
    spaces: Vec<*const Space>,
}

impl HeapPointerValidator {
    pub fn new(spaces: Vec<*const Space>) -> HeapPointerValidator {
        HeapPointerValidator { spaces }
    }
}

impl PointerVisitor for HeapPointerValidator {
    fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            // SAFETY: the caller hands us a valid slot range.
            let value = unsafe { *slot };
            if value.is_heap_object() {
                let address = value.address();
                // SAFETY: the spaces outlive the validation pass.
                let found = self
                    .spaces
                    .iter()
                    .any(|&space| unsafe { &*space }.includes(address));
                assert!(found, "dangling reference {address:#x}");
            }
            slot = unsafe { slot.add(1) };
        }
    }
}
