//! Object heaps: typed factories over a space, the weak-pointer registry
//! and foreign-memory accounting. Every factory returns either the new
//! object or the retry-after-gc sentinel; the caller collects and retries
//! exactly once.

use parking_lot::{Mutex, MutexGuard};

use crate::object::{
    Array, ByteArray, Class, Coroutine, Function, HeapObject, Instance,
    InstanceKind, LargeInteger, Stack, WORD_SIZE,
};
use crate::space::{round_up_to_word, Space};
use crate::tagged::{Failure, Value};

pub type WeakPointerCallback = fn(HeapObject, &mut Heap);

struct WeakPointer {
    object: HeapObject,
    callback: WeakPointerCallback,
}

pub struct Heap {
    space: Box<Space>,
    weak_pointers: Vec<WeakPointer>,
    foreign_memory: usize,
}

impl Heap {
    pub fn new(maximum_initial_size: usize) -> Heap {
        Heap {
            space: Box::new(Space::new(maximum_initial_size)),
            weak_pointers: Vec::new(),
            foreign_memory: 0,
        }
    }

    /// A heap whose space maintains a free list, for mark-sweep programs.
    pub fn with_mark_sweep(maximum_initial_size: usize) -> Heap {
        Heap {
            space: Box::new(Space::with_free_list(maximum_initial_size)),
            weak_pointers: Vec::new(),
            foreign_memory: 0,
        }
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut Space {
        &mut self.space
    }

    /// Raw allocation; 0 means collect and retry.
    pub fn allocate(&mut self, size: usize) -> usize {
        self.space.allocate(size)
    }

    fn allocate_object(
        &mut self,
        class: Class,
        size: usize,
    ) -> Option<HeapObject> {
        let address = self.allocate(size);
        if address == 0 {
            return None;
        }
        // SAFETY: freshly allocated, word-aligned region.
        let object = unsafe { HeapObject::from_address(address) };
        object.set_class(class);
        Some(object)
    }

    pub fn create_array(
        &mut self,
        class: Class,
        length: usize,
        fill: Value,
    ) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::Array);
        let size = (Array::HEADER_WORDS + length) * WORD_SIZE;
        let Some(object) = self.allocate_object(class, size) else {
            return Failure::retry_after_gc();
        };
        object.set_value_at(
            Array::LENGTH_INDEX,
            Value::from_smi(length as isize),
        );
        let array = Array::cast(object);
        for index in 0..length {
            array.set(index, fill);
        }
        array.to_value()
    }

    pub fn create_byte_array(&mut self, class: Class, length: usize) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::ByteArray);
        let size =
            ByteArray::HEADER_WORDS * WORD_SIZE + round_up_to_word(length);
        let Some(object) = self.allocate_object(class, size) else {
            return Failure::retry_after_gc();
        };
        object.set_value_at(
            ByteArray::LENGTH_INDEX,
            Value::from_smi(length as isize),
        );
        object.to_value()
    }

    pub fn create_instance(&mut self, class: Class, init: Value) -> Value {
        let fields = class.number_of_instance_fields();
        let size = (1 + fields) * WORD_SIZE;
        let Some(object) = self.allocate_object(class, size) else {
            return Failure::retry_after_gc();
        };
        let instance = Instance::cast(object);
        for index in 0..fields {
            instance.set_instance_field(index, init);
        }
        instance.to_value()
    }

    pub fn create_coroutine(&mut self, class: Class) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::Coroutine);
        let size = (1 + Coroutine::NUMBER_OF_FIELDS) * WORD_SIZE;
        let Some(object) = self.allocate_object(class, size) else {
            return Failure::retry_after_gc();
        };
        object.set_value_at(1, Value::zero());
        object.set_value_at(2, Value::zero());
        object.to_value()
    }

    /// A stack in the canonical suspended-empty state: no frames, the
    /// register spill slots zeroed, the chain link cleared.
    pub fn create_stack(&mut self, class: Class, length: usize) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::Stack);
        debug_assert!(length >= 2);
        let size = (Stack::HEADER_WORDS + length) * WORD_SIZE;
        let Some(object) = self.allocate_object(class, size) else {
            return Failure::retry_after_gc();
        };
        object.set_value_at(
            Stack::LENGTH_INDEX,
            Value::from_smi(length as isize),
        );
        let stack = Stack::cast(object);
        stack.set_next(Value::zero());
        stack.set_word_at(length - 1, 0);
        stack.set_word_at(length - 2, 0);
        stack.set_top(length - 2);
        stack.to_value()
    }

    pub fn create_one_byte_string(
        &mut self,
        class: Class,
        length: usize,
    ) -> Value {
        let raw = self.create_one_byte_string_uninitialized(class, length);
        if raw.is_failure() {
            return raw;
        }
        // SAFETY: the payload bytes were just allocated.
        unsafe {
            std::ptr::write_bytes(
                (raw.address() + ByteArray::HEADER_WORDS * WORD_SIZE)
                    as *mut u8,
                0,
                length,
            )
        };
        raw
    }

    pub fn create_one_byte_string_uninitialized(
        &mut self,
        class: Class,
        length: usize,
    ) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::OneByteString);
        let size =
            ByteArray::HEADER_WORDS * WORD_SIZE + round_up_to_word(length);
        let Some(object) = self.allocate_object(class, size) else {
            return Failure::retry_after_gc();
        };
        object.set_value_at(
            ByteArray::LENGTH_INDEX,
            Value::from_smi(length as isize),
        );
        object.to_value()
    }

    pub fn create_two_byte_string(
        &mut self,
        class: Class,
        length: usize,
    ) -> Value {
        let raw = self.create_two_byte_string_uninitialized(class, length);
        if raw.is_failure() {
            return raw;
        }
        // SAFETY: the payload units were just allocated.
        unsafe {
            std::ptr::write_bytes(
                (raw.address() + ByteArray::HEADER_WORDS * WORD_SIZE)
                    as *mut u8,
                0,
                length * 2,
            )
        };
        raw
    }

    pub fn create_two_byte_string_uninitialized(
        &mut self,
        class: Class,
        length: usize,
    ) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::TwoByteString);
        let size =
            ByteArray::HEADER_WORDS * WORD_SIZE + round_up_to_word(length * 2);
        let Some(object) = self.allocate_object(class, size) else {
            return Failure::retry_after_gc();
        };
        object.set_value_at(
            ByteArray::LENGTH_INDEX,
            Value::from_smi(length as isize),
        );
        object.to_value()
    }

    pub fn create_boxed(&mut self, class: Class, value: Value) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::Boxed);
        let Some(object) = self.allocate_object(class, 2 * WORD_SIZE) else {
            return Failure::retry_after_gc();
        };
        object.set_value_at(1, value);
        object.to_value()
    }

    pub fn create_double(&mut self, class: Class, value: f64) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::Double);
        let Some(object) = self.allocate_object(class, 2 * WORD_SIZE) else {
            return Failure::retry_after_gc();
        };
        crate::object::Double::cast(object).set_value(value);
        object.to_value()
    }

    pub fn create_large_integer(&mut self, class: Class, value: i64) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::LargeInteger);
        let Some(object) = self.allocate_object(class, 2 * WORD_SIZE) else {
            return Failure::retry_after_gc();
        };
        LargeInteger::cast(object).set_value(value);
        object.to_value()
    }

    /// Rewind the most recent large-integer allocation; used when the
    /// value turned out to fit a smi after all.
    pub fn try_dealloc_integer(&mut self, object: LargeInteger) {
        self.space.try_dealloc(object.address(), 2 * WORD_SIZE);
    }

    pub fn create_class(
        &mut self,
        meta_class: Class,
        kind: InstanceKind,
        fields: usize,
    ) -> Value {
        let Some(object) =
            self.allocate_object(meta_class, Class::SIZE_WORDS * WORD_SIZE)
        else {
            return Failure::retry_after_gc();
        };
        object.set_value_at(Class::KIND_INDEX, Value::from_smi(kind as isize));
        object.set_value_at(
            Class::FIELDS_INDEX,
            Value::from_smi(fields as isize),
        );
        object.set_value_at(Class::METHODS_INDEX, Value::zero());
        object.set_value_at(Class::SUPER_INDEX, Value::zero());
        object.to_value()
    }

    pub fn create_function(
        &mut self,
        class: Class,
        arity: usize,
        bytecode: &[u8],
        literals: Value,
    ) -> Value {
        debug_assert_eq!(class.instance_kind(), InstanceKind::Function);
        let size = Function::HEADER_WORDS * WORD_SIZE
            + round_up_to_word(bytecode.len());
        let Some(object) = self.allocate_object(class, size) else {
            return Failure::retry_after_gc();
        };
        object.set_value_at(
            Function::ARITY_INDEX,
            Value::from_smi(arity as isize),
        );
        object.set_value_at(
            Function::BYTECODE_SIZE_INDEX,
            Value::from_smi(bytecode.len() as isize),
        );
        object.set_value_at(Function::LITERALS_INDEX, literals);
        let function = Function::cast(object);
        // SAFETY: the allocation covers the rounded-up bytecode size.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytecode.as_ptr(),
                function.bytecode_address_for(0),
                bytecode.len(),
            );
        }
        function.to_value()
    }

    // Weak pointers. After a collection has determined liveness, dead
    // targets get their callback invoked with this heap as argument.

    pub fn add_weak_pointer(
        &mut self,
        object: HeapObject,
        callback: WeakPointerCallback,
    ) {
        self.weak_pointers.push(WeakPointer { object, callback });
    }

    pub fn remove_weak_pointer(&mut self, object: HeapObject) {
        self.weak_pointers.retain(|weak| weak.object != object);
    }

    /// Weak processing after a copying collection: `collected` is the
    /// vacated from-space, still holding the forwarding addresses.
    pub fn process_weak_pointers(&mut self, collected: &Space) {
        let pointers = std::mem::take(&mut self.weak_pointers);
        let mut survivors = Vec::with_capacity(pointers.len());
        for mut weak in pointers {
            if !collected.includes(weak.object.address()) {
                survivors.push(weak);
                continue;
            }
            match weak.object.forwarding_address() {
                Some(forwarded) => {
                    weak.object = forwarded;
                    survivors.push(weak);
                }
                None => (weak.callback)(weak.object, self),
            }
        }
        debug_assert!(self.weak_pointers.is_empty());
        self.weak_pointers = survivors;
    }

    /// Weak processing after marking, before the sweep clears the bits.
    pub fn process_weak_pointers_marked(&mut self) {
        let pointers = std::mem::take(&mut self.weak_pointers);
        let mut survivors = Vec::with_capacity(pointers.len());
        for weak in pointers {
            if weak.object.is_marked() {
                survivors.push(weak);
            } else {
                (weak.callback)(weak.object, self);
            }
        }
        debug_assert!(self.weak_pointers.is_empty());
        self.weak_pointers = survivors;
    }

    /// Run every pending weak callback; the heap is going away and all of
    /// its objects with it.
    pub fn finalize_all_weak_pointers(&mut self) {
        let pointers = std::mem::take(&mut self.weak_pointers);
        for weak in pointers {
            (weak.callback)(weak.object, self);
        }
    }

    // Foreign memory accounting. Every live foreign buffer contributes to
    // the counter until its finalizer runs.

    pub fn allocated_foreign_memory(&mut self, bytes: usize) {
        self.foreign_memory += bytes;
        self.space.decrease_allocation_budget(bytes);
    }

    pub fn freed_foreign_memory(&mut self, bytes: usize) {
        debug_assert!(self.foreign_memory >= bytes);
        self.foreign_memory -= bytes;
        self.space.increase_allocation_budget(bytes);
    }

    pub fn foreign_memory(&self) -> usize {
        self.foreign_memory
    }

    pub fn replace_space(&mut self, space: Space) {
        self.space = Box::new(space);
    }

    pub fn take_space(&mut self) -> Space {
        std::mem::replace(&mut self.space, Space::new(0))
    }

    pub fn adjust_allocation_budget(&mut self) {
        let foreign = self.foreign_memory;
        self.space.adjust_allocation_budget(foreign);
    }
}

/// The program-wide immutable heap. Objects placed here are never written
/// after construction; all processes allocate into it under the lock.
pub struct SharedHeap {
    heap: Mutex<Heap>,
}

impl SharedHeap {
    pub fn new() -> SharedHeap {
        SharedHeap { heap: Mutex::new(Heap::new(0)) }
    }

    pub fn heap(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock()
    }

    pub fn estimated_used(&self) -> usize {
        self.heap.lock().space().used()
    }

    pub fn estimated_size(&self) -> usize {
        self.heap.lock().space().size()
    }

    /// Retarget the allocation budget after a shared collection, scaled by
    /// how much the processes hold in their own heaps.
    pub fn update_limit_after_gc(&self, process_heap_sizes: usize) {
        let mut heap = self.heap.lock();
        heap.space_mut().adjust_allocation_budget(process_heap_sizes);
    }
}

impl Default for SharedHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::SignalKind;
    use crate::program::Program;

    fn failed_callback(_object: HeapObject, heap: &mut Heap) {
        // Account a sentinel so the test can observe the invocation.
        heap.allocated_foreign_memory(1);
    }

    #[test]
    fn factories_return_retry_after_gc_when_the_budget_is_spent() {
        let program = Program::new(Default::default());
        let array_class = program.array_class();
        let mut heap = Heap::new(0);
        let mut failures = 0;
        for _ in 0..100_000 {
            let result = heap.create_array(array_class, 64, Value::zero());
            if result.is_failure() {
                assert_eq!(result, Failure::retry_after_gc());
                failures += 1;
                break;
            }
        }
        assert_eq!(failures, 1, "exhaustion must surface as a failure");
        assert!(heap.space().needs_garbage_collection());
    }

    #[test]
    fn try_dealloc_integer_rewinds_the_top_allocation() {
        let program = Program::new(Default::default());
        let class = program.large_integer_class();
        let mut heap = Heap::new(0);
        let used_before = heap.space().used();
        let integer = heap.create_large_integer(class, 7);
        let integer = LargeInteger::from_value(integer);
        assert_eq!(integer.value(), 7);
        heap.try_dealloc_integer(integer);
        assert_eq!(heap.space().used(), used_before);
    }

    #[test]
    fn dead_weak_target_runs_its_callback_exactly_once() {
        let mut program = Program::new(Default::default());
        let process = program.spawn_process(std::ptr::null_mut());
        // SAFETY: freshly spawned, single-threaded test.
        let process = unsafe { &mut *process };
        let doomed =
            HeapObject::from_value(process.new_array(1));
        process.heap_mut().add_weak_pointer(doomed, failed_callback);
        // Nothing roots the array, so a mutable collection kills it.
        process.collect_mutable_garbage();
        assert_eq!(
            process.heap().foreign_memory(),
            1,
            "callback must have run"
        );
        process.collect_mutable_garbage();
        assert_eq!(
            process.heap().foreign_memory(),
            1,
            "callback must not run twice"
        );
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn surviving_weak_target_is_rewritten_through_forwarding() {
        let mut program = Program::new(Default::default());
        let process = program.spawn_process(std::ptr::null_mut());
        // SAFETY: freshly spawned, single-threaded test.
        let process = unsafe { &mut *process };
        let kept = process.new_array(1);
        // Root it through the exception slot so the collection keeps it.
        process.set_exception(kept);
        process
            .heap_mut()
            .add_weak_pointer(HeapObject::from_value(kept), failed_callback);
        process.collect_mutable_garbage();
        assert_eq!(process.heap().foreign_memory(), 0, "target survived");
        let moved = process.exception();
        assert_ne!(moved, kept, "the array moved to the new space");
        process
            .heap_mut()
            .remove_weak_pointer(HeapObject::from_value(moved));
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn foreign_memory_counter_balances() {
        let mut heap = Heap::new(0);
        heap.allocated_foreign_memory(128);
        assert_eq!(heap.foreign_memory(), 128);
        heap.freed_foreign_memory(128);
        assert_eq!(heap.foreign_memory(), 0);
    }
}
