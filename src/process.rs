//! The per-process execution context: heaps, the coroutine stack, the
//! root set, mutable garbage collection, the interrupt handshake with the
//! scheduler, the lookup-cache miss path and debug stepping.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use bitflags::bitflags;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::bytecode::{
    self, names, IntrinsicsTable, Opcode, Selector, SelectorKind,
    GUARANTEED_FRAME_SIZE,
};
use crate::debug::{DebugInfo, NO_BREAKPOINT_ID};
use crate::frame::{self, Frame};
use crate::gc::{
    GcStrategy, MarkAndChainStacksVisitor, MarkingStack, MarkingVisitor,
    ScavengeAndChainStacksVisitor, ScavengeVisitor, SweepingVisitor,
};
use crate::heap::Heap;
use crate::links::{Links, Port, ProcessHandle, Signal, SignalKind};
use crate::lookup::{Entry, LookupCache, ThreadState};
use crate::mailbox::Mailbox;
use crate::object::{
    Array, Class, Coroutine, Function, HeapObject, Instance, LargeInteger,
    Stack,
};
use crate::platform;
use crate::program::Program;
use crate::space::{NoAllocationFailureScope, Space};
use crate::store_buffer::StoreBuffer;
use crate::tagged::{Failure, Value};
use crate::visitor::{HeapObjectPointerVisitor, PointerVisitor};

bitflags! {
    /// Interrupt markers OR-ed into the stack-limit word.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct StackMarker: usize {
        const PREEMPT = 1 << 0;
        const PROFILE = 1 << 1;
        const DEBUG_INTERRUPT = 1 << 2;
    }
}

/// Values at or above this are marker encodings, not real limits.
pub const MAX_STACK_MARKER: usize = !0b111;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StackCheckResult {
    Continue,
    Interrupt,
    DebugInterrupt,
    Overflow,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Sleeping,
    Ready,
    Running,
    Terminated,
}

/// Heap usage snapshot around a collection, for statistics logging.
#[derive(Debug, Default, Copy, Clone)]
pub struct HeapUsage {
    pub timestamp: u64,
    pub process_used: usize,
    pub process_size: usize,
    pub immutable_used: usize,
    pub immutable_size: usize,
    pub program_used: usize,
    pub program_size: usize,
}

impl HeapUsage {
    pub fn total_used(&self) -> usize {
        self.process_used + self.immutable_used + self.program_used
    }

    pub fn total_size(&self) -> usize {
        self.process_size + self.immutable_size + self.program_size
    }
}

pub struct Process {
    coroutine: Value,
    stack_limit: AtomicUsize,
    program: *mut Program,
    statics: Value,
    exception: Value,
    heap: Heap,
    store_buffer: StoreBuffer,
    mailbox: Mailbox,
    ports: *mut Port,
    state: ProcessState,
    thread_state: *mut ThreadState,
    signal: AtomicPtr<Signal>,
    process_handle: *mut ProcessHandle,
    links: Links,
    process_list_next: *mut Process,
    process_list_prev: *mut Process,
    parent: *mut Process,
    random: SmallRng,
    errno_cache: i32,
    debug_info: Option<Box<DebugInfo>>,
    cooked_stack_deltas: Vec<Vec<usize>>,
    gc: GcStrategy,
    #[cfg(debug_assertions)]
    true_then_false: bool,
}

// A process is owned by at most one thread at a time; the cross-thread
// surface is limited to the atomic stack limit and signal slot.
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
    /// Create a detached process for `program`. The caller owns the raw
    /// pointer; deletion goes through the program's process list.
    pub(crate) fn new(
        program: *mut Program,
        parent: *mut Process,
    ) -> *mut Process {
        // SAFETY: the program outlives all of its processes.
        let program_ref = unsafe { &mut *program };
        let seed = program_ref.random_u32() as u64 + 1;
        let process = Box::into_raw(Box::new(Process {
            coroutine: Value::zero(),
            stack_limit: AtomicUsize::new(0),
            program,
            statics: Value::zero(),
            exception: program_ref.null_object(),
            heap: match program_ref.gc_strategy() {
                GcStrategy::Scavenge => Heap::new(4 * 1024),
                GcStrategy::MarkSweep => Heap::with_mark_sweep(4 * 1024),
            },
            store_buffer: StoreBuffer::new(),
            mailbox: Mailbox::new(),
            ports: std::ptr::null_mut(),
            state: ProcessState::Sleeping,
            thread_state: std::ptr::null_mut(),
            signal: AtomicPtr::new(std::ptr::null_mut()),
            process_handle: std::ptr::null_mut(),
            links: Links::default(),
            process_list_next: std::ptr::null_mut(),
            process_list_prev: std::ptr::null_mut(),
            parent,
            random: SmallRng::seed_from_u64(seed),
            errno_cache: 0,
            debug_info: None,
            cooked_stack_deltas: Vec::new(),
            gc: program_ref.gc_strategy(),
            #[cfg(debug_assertions)]
            true_then_false: true,
        }));
        // SAFETY: just created, not shared yet.
        let this = unsafe { &mut *process };
        this.process_handle = ProcessHandle::new(process);

        // Every process starts with its own mutable copy of the program's
        // static fields.
        let static_fields = program_ref.static_fields();
        let statics = this.new_array(static_fields.length());
        debug_assert!(!statics.is_failure());
        let statics = Array::from_value(statics);
        for index in 0..static_fields.length() {
            statics.set(index, static_fields.get(index));
        }
        this.statics = statics.to_value();
        process
    }

    pub fn program(&self) -> &Program {
        // SAFETY: the program outlives all of its processes.
        unsafe { &*self.program }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn store_buffer(&self) -> &StoreBuffer {
        &self.store_buffer
    }

    pub fn store_buffer_mut(&mut self) -> &mut StoreBuffer {
        &mut self.store_buffer
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn exception(&self) -> Value {
        self.exception
    }

    pub fn set_exception(&mut self, exception: Value) {
        self.exception = exception;
    }

    pub fn statics(&self) -> Array {
        Array::from_value(self.statics)
    }

    pub fn coroutine(&self) -> Coroutine {
        Coroutine::from_value(self.coroutine)
    }

    pub fn stack(&self) -> Stack {
        self.coroutine().stack()
    }

    pub fn ports(&self) -> *mut Port {
        self.ports
    }

    pub fn set_ports(&mut self, ports: *mut Port) {
        self.ports = ports;
    }

    pub fn process_handle(&self) -> *mut ProcessHandle {
        self.process_handle
    }

    pub fn links(&mut self) -> &mut Links {
        &mut self.links
    }

    pub fn parent(&self) -> *mut Process {
        self.parent
    }

    pub fn thread_state(&self) -> *mut ThreadState {
        self.thread_state
    }

    pub fn set_thread_state(&mut self, thread_state: *mut ThreadState) {
        self.thread_state = thread_state;
    }

    pub(crate) fn process_list_next(&self) -> *mut Process {
        self.process_list_next
    }

    pub(crate) fn set_process_list_next(&mut self, next: *mut Process) {
        self.process_list_next = next;
    }

    pub(crate) fn process_list_prev(&self) -> *mut Process {
        self.process_list_prev
    }

    pub(crate) fn set_process_list_prev(&mut self, prev: *mut Process) {
        self.process_list_prev = prev;
    }

    pub fn random_u32(&mut self) -> u32 {
        self.random.next_u32()
    }

    // Execution stack.

    /// Give the process its initial coroutine with a fresh 256-word stack.
    pub fn setup_execution_stack(&mut self) {
        debug_assert_eq!(self.coroutine, Value::zero());
        let stack = self.new_stack(256);
        debug_assert!(!stack.is_failure());
        let coroutine_class = self.program().coroutine_class();
        let coroutine = self.heap.create_coroutine(coroutine_class);
        debug_assert!(!coroutine.is_failure());
        let coroutine = Coroutine::from_value(coroutine);
        coroutine.set_stack(Stack::from_value(stack));
        self.update_coroutine(coroutine);
    }

    pub fn update_coroutine(&mut self, coroutine: Coroutine) {
        debug_assert!(coroutine.has_stack());
        self.coroutine = coroutine.to_value();
        self.update_stack_limit();
        self.store_buffer.insert(coroutine.stack().object());
    }

    /// Called when the interpreter's stack check fails: either service an
    /// interrupt marker, or grow the stack by at least `addition` words.
    pub fn handle_stack_overflow(
        &mut self,
        addition: usize,
    ) -> StackCheckResult {
        let current_limit = self.stack_limit();

        if current_limit >= MAX_STACK_MARKER {
            if current_limit & StackMarker::PREEMPT.bits() != 0 {
                self.clear_stack_marker(StackMarker::PREEMPT);
                self.update_stack_limit();
                return StackCheckResult::Interrupt;
            }
            if current_limit & StackMarker::DEBUG_INTERRUPT.bits() != 0 {
                self.clear_stack_marker(StackMarker::DEBUG_INTERRUPT);
                self.update_stack_limit();
                return StackCheckResult::DebugInterrupt;
            }
            if current_limit & StackMarker::PROFILE.bits() != 0 {
                self.clear_stack_marker(StackMarker::PROFILE);
                self.update_stack_limit();
                return StackCheckResult::Continue;
            }
        }

        let size_increase = addition.next_power_of_two().max(256);
        let new_size = self.stack().length() + size_increase;
        if new_size > platform::max_stack_size_in_words() {
            return StackCheckResult::Overflow;
        }

        let mut new_stack_object = self.new_stack(new_size);
        if new_stack_object == Failure::retry_after_gc() {
            self.collect_mutable_garbage();
            new_stack_object = self.new_stack(new_size);
            if new_stack_object == Failure::retry_after_gc() {
                return StackCheckResult::Overflow;
            }
        }

        let new_stack = Stack::from_value(new_stack_object);
        let old_stack = self.stack();
        let height = old_stack.length() - old_stack.top();
        new_stack.set_top(new_stack.length() - height);
        // SAFETY: both live suffixes are `height` words by construction.
        unsafe {
            std::ptr::copy_nonoverlapping(
                old_stack.pointer(old_stack.top()),
                new_stack.pointer(new_stack.top()),
                height,
            );
        }
        frame::update_frame_pointers(new_stack, old_stack);
        debug_assert!(self.coroutine().has_stack());
        self.coroutine().set_stack(new_stack);
        self.store_buffer.insert(new_stack.object());
        self.update_stack_limit();
        StackCheckResult::Continue
    }

    // The stack-limit word: either a real limit or marker bits OR-ed onto
    // the sentinel. The interpreter's stack check is one compare against
    // this word.

    pub fn stack_limit(&self) -> usize {
        self.stack_limit.load(Ordering::Acquire)
    }

    pub fn set_stack_marker(&self, marker: StackMarker) {
        let mut limit = self.stack_limit.load(Ordering::Relaxed);
        loop {
            let base =
                if limit < MAX_STACK_MARKER { MAX_STACK_MARKER } else { limit };
            let updated = base | marker.bits();
            match self.stack_limit.compare_exchange_weak(
                limit,
                updated,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => limit = observed,
            }
        }
    }

    pub fn clear_stack_marker(&self, marker: StackMarker) {
        let mut limit = self.stack_limit.load(Ordering::Relaxed);
        loop {
            debug_assert_ne!(limit & marker.bits(), 0, "marker not set");
            let updated = limit & !marker.bits();
            match self.stack_limit.compare_exchange_weak(
                limit,
                updated,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => limit = observed,
            }
        }
    }

    pub fn preempt(&self) {
        self.set_stack_marker(StackMarker::PREEMPT);
    }

    pub fn profile(&self) {
        self.set_stack_marker(StackMarker::PROFILE);
    }

    pub fn debug_interrupt(&self) {
        self.set_stack_marker(StackMarker::DEBUG_INTERRUPT);
    }

    /// Install the real limit, unless marker bits are still pending.
    pub fn update_stack_limit(&self) {
        // Reserve a slot for a return address and an extra temporary each
        // bytecode may use internally.
        let stack = self.stack();
        let frame_size = GUARANTEED_FRAME_SIZE + 2;
        let current = self.stack_limit.load(Ordering::Relaxed);
        if current <= MAX_STACK_MARKER {
            let new_limit = stack.pointer(frame_size) as usize;
            let _ = self.stack_limit.compare_exchange(
                current,
                new_limit,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    // Factories. Immutable payloads (strings, numbers, byte arrays) live
    // in the program's shared heap; containers and stacks live here.

    pub fn new_array(&mut self, length: usize) -> Value {
        let class = self.program().array_class();
        let null = self.program().null_object();
        self.heap.create_array(class, length, null)
    }

    pub fn new_byte_array(&mut self, length: usize) -> Value {
        let class = self.program().byte_array_class();
        self.program().shared_heap().heap().create_byte_array(class, length)
    }

    pub fn new_double(&mut self, value: f64) -> Value {
        let class = self.program().double_class();
        self.program().shared_heap().heap().create_double(class, value)
    }

    pub fn new_integer(&mut self, value: i64) -> Value {
        let class = self.program().large_integer_class();
        self.program()
            .shared_heap()
            .heap()
            .create_large_integer(class, value)
    }

    /// Opportunistically unallocate a large integer that turned out to be
    /// smi-sized.
    pub fn try_dealloc_integer(&mut self, object: LargeInteger) {
        self.program().shared_heap().heap().try_dealloc_integer(object);
    }

    pub fn to_integer(&mut self, value: i64) -> Value {
        if Value::smi_is_valid(value) {
            Value::from_smi(value as isize)
        } else {
            self.new_integer(value)
        }
    }

    pub fn new_one_byte_string(&mut self, length: usize) -> Value {
        let class = self.program().one_byte_string_class();
        self.program()
            .shared_heap()
            .heap()
            .create_one_byte_string(class, length)
    }

    pub fn new_two_byte_string(&mut self, length: usize) -> Value {
        let class = self.program().two_byte_string_class();
        self.program()
            .shared_heap()
            .heap()
            .create_two_byte_string(class, length)
    }

    pub fn new_one_byte_string_uninitialized(
        &mut self,
        length: usize,
    ) -> Value {
        let class = self.program().one_byte_string_class();
        self.program()
            .shared_heap()
            .heap()
            .create_one_byte_string_uninitialized(class, length)
    }

    pub fn new_two_byte_string_uninitialized(
        &mut self,
        length: usize,
    ) -> Value {
        let class = self.program().two_byte_string_class();
        self.program()
            .shared_heap()
            .heap()
            .create_two_byte_string_uninitialized(class, length)
    }

    pub fn new_string_from_ascii(&mut self, value: &str) -> Value {
        debug_assert!(value.is_ascii());
        let raw = self.new_one_byte_string_uninitialized(value.len());
        if raw.is_failure() {
            return raw;
        }
        let result = crate::object::OneByteString::from_value(raw);
        for (index, byte) in value.bytes().enumerate() {
            result.set_char_code(index, byte);
        }
        raw
    }

    pub fn new_boxed(&mut self, value: Value) -> Value {
        let class = self.program().boxed_class();
        self.heap.create_boxed(class, value)
    }

    pub fn new_instance(&mut self, class: Class, immutable: bool) -> Value {
        let null = self.program().null_object();
        if immutable {
            self.program().shared_heap().heap().create_instance(class, null)
        } else {
            self.heap.create_instance(class, null)
        }
    }

    /// Stacks are tracked by the store buffer from birth.
    pub fn new_stack(&mut self, length: usize) -> Value {
        let class = self.program().stack_class();
        let result = self.heap.create_stack(class, length);
        if result.is_failure() {
            return result;
        }
        self.store_buffer.insert(HeapObject::from_value(result));
        result
    }

    // Garbage collection.

    /// Merge the heaps carried by received exit messages, so their
    /// objects are collected as part of this process.
    pub fn take_child_heaps(&mut self) {
        self.mailbox.merge_all_child_heaps(&mut self.heap);
    }

    pub fn collect_mutable_garbage(&mut self) {
        match self.gc {
            GcStrategy::Scavenge => self.collect_mutable_scavenge(),
            GcStrategy::MarkSweep => {
                self.collect_mutable_mark_sweep(false);
            }
        }
    }

    fn heap_usage(&self) -> HeapUsage {
        HeapUsage {
            timestamp: platform::get_microseconds(),
            process_used: self.heap.space().used(),
            process_size: self.heap.space().size(),
            immutable_used: self.program().shared_heap().estimated_used(),
            immutable_size: self.program().shared_heap().estimated_size(),
            program_used: self.program().heap().space().used(),
            program_size: self.program().heap().space().size(),
        }
    }

    fn collect_mutable_scavenge(&mut self) {
        self.take_child_heaps();

        let print_statistics = self.program().flags().print_heap_statistics;
        let usage_before =
            print_statistics.then(|| self.heap_usage());

        let mut to = Space::new(self.heap.space().used() / 10);
        let mut new_buffer = StoreBuffer::new();
        {
            // While collecting, allocation must not fail; grow to-space
            // instead.
            let _scope = NoAllocationFailureScope::new(&mut to);
            let from: *const Space = self.heap.space();
            let mut visitor = ScavengeVisitor::new(from, &mut to);
            self.iterate_roots(&mut visitor);
            debug_assert!(!to.is_empty());
            let shared_space = {
                let shared = self.program().shared_heap().heap();
                shared.space() as *const Space
            };
            // SAFETY: the shared heap is only read, and only moves while
            // every process is stopped.
            to.complete_scavenge_mutable(
                &mut visitor,
                unsafe { &*shared_space },
                &mut new_buffer,
            );
        }
        self.store_buffer.replace_after_mutable_gc(new_buffer);

        let old_space = self.heap.take_space();
        self.heap.process_weak_pointers(&old_space);
        self.ports = Port::cleanup_ports(&old_space, self.ports);
        self.heap.replace_space(to);
        drop(old_space);
        self.heap.adjust_allocation_budget();

        if let Some(before) = usage_before {
            let after = self.heap_usage();
            tracing::debug!(
                elapsed_us = after.timestamp - before.timestamp,
                process_before = before.process_used,
                process_after = after.process_used,
                total_before = before.total_size(),
                total_after = after.total_size(),
                "process gc"
            );
        }

        self.update_stack_limit();
    }

    /// The mark-sweep rendition of the mutable collection. With `chain`
    /// set, stacks are chained behind the current coroutine stack and
    /// counted for a following program collection.
    fn collect_mutable_mark_sweep(&mut self, chain: bool) -> usize {
        self.take_child_heaps();

        let mut marking_stack = MarkingStack::default();
        let space: *const Space = self.heap.space();
        let number_of_stacks = if chain {
            let mut visitor = MarkAndChainStacksVisitor::new(
                self,
                space,
                &mut marking_stack,
            );
            // The current coroutine stack heads the chain, so mark it
            // before any other root can reach a stack.
            visitor.visit(self.coroutine().stack_slot());
            self.iterate_roots(&mut visitor);
            marking_stack.process(&mut visitor);
            visitor.number_of_stacks()
        } else {
            let mut visitor = MarkingVisitor::new(space, &mut marking_stack);
            self.iterate_roots(&mut visitor);
            marking_stack.process(&mut visitor);
            0
        };

        self.heap.process_weak_pointers_marked();
        self.ports = Port::cleanup_ports_marked(self.heap.space(), self.ports);

        // Sweep: flush pending chunk state, rebuild the free list.
        self.heap.space_mut().flush();
        let free_list: *mut _ = self
            .heap
            .space_mut()
            .free_list()
            .expect("mark-sweep heap has a free list");
        let mut sweeper = SweepingVisitor::new(free_list);
        self.heap.space_mut().iterate_objects(&mut sweeper);
        let used = sweeper.used();
        self.heap.space_mut().set_used(used);
        self.heap.adjust_allocation_budget();

        self.update_stack_limit();
        number_of_stacks
    }

    /// Mutable collection that additionally chains all reachable stacks
    /// behind the current coroutine stack; the count feeds `cook_stacks`.
    pub fn collect_mutable_garbage_and_chain_stacks(&mut self) -> usize {
        match self.gc {
            GcStrategy::Scavenge => self.collect_scavenge_and_chain_stacks(),
            GcStrategy::MarkSweep => self.collect_mutable_mark_sweep(true),
        }
    }

    fn collect_scavenge_and_chain_stacks(&mut self) -> usize {
        let mut to = Space::new(self.heap.space().used() / 10);
        let mut new_buffer = StoreBuffer::new();
        let number_of_stacks;
        {
            let _scope = NoAllocationFailureScope::new(&mut to);
            let from: *const Space = self.heap.space();
            let mut visitor =
                ScavengeAndChainStacksVisitor::new(self, from, &mut to);
            // The current coroutine stack is visited first and heads the
            // chain.
            visitor.visit(self.coroutine().stack_slot());
            self.iterate_roots(&mut visitor);
            let shared_space = {
                let shared = self.program().shared_heap().heap();
                shared.space() as *const Space
            };
            // SAFETY: the shared heap is only read, and only moves while
            // every process is stopped.
            to.complete_scavenge_mutable(
                &mut visitor,
                unsafe { &*shared_space },
                &mut new_buffer,
            );
            number_of_stacks = visitor.number_of_stacks();
        }
        self.store_buffer.replace_after_mutable_gc(new_buffer);

        let old_space = self.heap.take_space();
        self.heap.process_weak_pointers(&old_space);
        self.ports = Port::cleanup_ports(&old_space, self.ports);
        self.heap.replace_space(to);
        drop(old_space);
        self.heap.adjust_allocation_budget();
        self.update_stack_limit();
        number_of_stacks
    }

    /// Entry point used by the program collector: merge child heaps, then
    /// collect while chaining stacks.
    pub fn collect_garbage_and_chain_stacks(&mut self) -> usize {
        self.take_child_heaps();
        self.collect_mutable_garbage_and_chain_stacks()
    }

    /// Walk every root of this process exactly once.
    pub fn iterate_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        visitor.visit(&mut self.statics as *mut Value);
        visitor.visit(&mut self.coroutine as *mut Value);
        visitor.visit(&mut self.exception as *mut Value);
        if let Some(debug_info) = self.debug_info.as_mut() {
            debug_info.visit_pointers(visitor);
        }
        self.mailbox.iterate_pointers(visitor);
    }

    /// Walk every pointer from this process into the program heap.
    /// Requires cooked stacks: raw bytecode pointers must not be live.
    pub fn iterate_program_pointers(
        &mut self,
        visitor: &mut dyn PointerVisitor,
    ) {
        debug_assert!(self.stacks_are_cooked());
        let mut object_visitor = HeapObjectPointerVisitor::new(visitor);
        self.heap.space_mut().iterate_objects(&mut object_visitor);
        self.store_buffer.iterate_pointers_to_immutable_space(visitor);
        if let Some(debug_info) = self.debug_info.as_mut() {
            debug_info.visit_program_pointers(visitor);
        }
        visitor.visit(&mut self.exception as *mut Value);
        self.mailbox.iterate_pointers(visitor);
    }

    pub fn validate_heaps(&mut self) {
        let shared = self.program().shared_heap().heap();
        let spaces: Vec<*const Space> = vec![
            self.heap.space(),
            self.program().heap().space(),
            shared.space(),
        ];
        drop(shared);
        let mut validator = crate::gc::HeapPointerValidator::new(spaces);
        self.iterate_roots(&mut validator);
        let mut object_visitor = HeapObjectPointerVisitor::new(&mut validator);
        self.heap.space_mut().iterate_objects(&mut object_visitor);
    }

    // Cooking. Between `cook_stacks` and `uncook_and_unchain_stacks`
    // every frame's bcp slot holds a function reference and the deltas
    // table supplies the offset, so a moving program collection can
    // relocate bytecode without invalidating execution state.

    pub fn stacks_are_cooked(&self) -> bool {
        !self.cooked_stack_deltas.is_empty()
    }

    pub fn cook_stacks(&mut self, number_of_stacks: usize) {
        debug_assert!(self.cooked_stack_deltas.is_empty());
        let mut raw_current = self.stack().to_value();
        self.cooked_stack_deltas = Vec::with_capacity(number_of_stacks);
        for _ in 0..number_of_stacks {
            let current = Stack::from_value(raw_current);
            let mut deltas = Vec::new();
            let mut frame = Frame::new(current);
            while frame.move_previous() {
                let bcp = frame.byte_code_pointer();
                let function = frame.function_from_byte_code_pointer();
                let start = function.bytecode_address_for(0);
                frame.set_cooked_function(function);
                deltas.push(bcp as usize - start as usize);
            }
            self.cooked_stack_deltas.push(deltas);
            raw_current = current.next();
        }
        debug_assert_eq!(raw_current, Value::zero());
    }

    pub fn uncook_and_unchain_stacks(&mut self) {
        let mut raw_current = self.stack().to_value();
        let all_deltas = std::mem::take(&mut self.cooked_stack_deltas);
        for deltas in all_deltas {
            let current = Stack::from_value(raw_current);
            let mut index = 0;
            let mut frame = Frame::new(current);
            while frame.move_previous() {
                let function = frame.cooked_function();
                let delta = deltas[index];
                index += 1;
                // SAFETY: the delta was taken from this frame when it was
                // cooked; the function carries at least that much
                // bytecode.
                let bcp =
                    unsafe { function.bytecode_address_for(0).add(delta) };
                frame.set_byte_code_pointer(bcp);
            }
            raw_current = current.next();
            current.set_next(Value::zero());
        }
        debug_assert_eq!(raw_current, Value::zero());
    }

    pub fn update_breakpoints(&mut self) {
        if let Some(debug_info) = self.debug_info.as_mut() {
            debug_info.update_breakpoints();
        }
    }

    // Finalizers.

    pub fn register_finalizer(
        &mut self,
        object: HeapObject,
        callback: crate::heap::WeakPointerCallback,
    ) {
        let address = object.address();
        if self.heap.space().includes(address) {
            self.heap.add_weak_pointer(object, callback);
        } else {
            let program = self.program();
            let mut shared = program.shared_heap().heap();
            debug_assert!(shared.space().includes(address));
            shared.add_weak_pointer(object, callback);
        }
    }

    pub fn unregister_finalizer(&mut self, object: HeapObject) {
        // Weak pointers on the shared heap cannot be unregistered.
        debug_assert!(self.heap.space().includes(object.address()));
        self.heap.remove_weak_pointer(object);
    }

    /// Finalizer for foreign-memory instances: free the buffer and settle
    /// the accounting.
    pub fn finalize_foreign(foreign: HeapObject, heap: &mut Heap) {
        let instance = Instance::cast(foreign);
        let address = instance.get_consecutive_smis(0);
        let length = instance.get_instance_field(2).as_smi() as usize;
        // SAFETY: the instance owns the buffer; nothing reaches it after
        // finalization.
        unsafe { libc::free(address as *mut libc::c_void) };
        heap.freed_foreign_memory(length);
    }

    /// Finalizer for language-side process objects: drop the handle
    /// reference the object held.
    pub fn finalize_process(object: HeapObject, _heap: &mut Heap) {
        let handle = ProcessHandle::from_dart_object(Instance::cast(object));
        // SAFETY: the object held exactly one reference.
        unsafe { ProcessHandle::decrement_ref(handle) };
    }

    // Ports.

    /// Open a port on `channel`, linked into this process's port list.
    pub fn allocate_port(&mut self, channel: Value) -> *mut Port {
        let port = Port::new(self, channel, self.ports);
        self.ports = port;
        port
    }

    // Signals.

    /// Install `signal` as this process's pending death signal. At most
    /// one wins; losers give up their reference.
    pub fn send_signal(&self, signal: *mut Signal) {
        while self.signal.load(Ordering::Acquire).is_null() {
            if self
                .signal
                .compare_exchange_weak(
                    std::ptr::null_mut(),
                    signal,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
        // SAFETY: the caller passed us one reference to give up.
        unsafe { Signal::decrement_ref(signal) };
    }

    pub fn signal(&self) -> *mut Signal {
        self.signal.load(Ordering::Acquire)
    }

    /// Detach everything externally visible: ports, handle, links.
    /// Runs once, before the process is deleted.
    pub fn cleanup(&mut self, kind: SignalKind) {
        self.program().event_handler().receiver_for_ports_died(self.ports);

        while !self.ports.is_null() {
            // SAFETY: the list holds one reference per port.
            let port = unsafe { &*self.ports };
            let next = port.next();
            port.owner_process_terminating();
            unsafe { Port::decrement_ref(self.ports) };
            self.ports = next;
        }

        // From here on linking and monitoring through the handle fails.
        // SAFETY: the handle lives until the destructor drops its
        // reference.
        unsafe { &*self.process_handle }.owner_process_terminating();

        // Nobody can send messages or signals anymore; notify everyone
        // linked to us.
        let handle = self.process_handle;
        self.links.notify_linked_processes(handle, kind);
        self.state = ProcessState::Terminated;
    }

    // Lookup cache.

    /// The slow path behind a primary-cache miss. May only run when the
    /// program is in non-compact mode; compact programs dispatch through
    /// the table.
    pub fn lookup_entry_slow(
        &mut self,
        primary_index: usize,
        class: Class,
        selector: usize,
    ) -> Entry {
        debug_assert!(!self.program().is_compact());
        debug_assert!(!self.thread_state.is_null());
        // SAFETY: the owning thread's state outlives the process's run.
        let state = unsafe { &mut *self.thread_state };
        let cache = state.ensure_cache();

        let secondary_index =
            LookupCache::compute_secondary_index(class, selector);
        if cache.secondary(secondary_index).matches(class, selector) {
            return *cache.secondary(secondary_index);
        }

        let mut tag = 1;
        let target = match class.lookup_method(selector) {
            Some(target) => {
                if let Some(intrinsic) =
                    target.compute_intrinsic(IntrinsicsTable::get_default())
                {
                    tag = intrinsic;
                }
                target
            }
            None => class
                .lookup_method(Selector::encode(
                    names::NO_SUCH_METHOD_TRAMPOLINE,
                    SelectorKind::Method,
                    0,
                ))
                .expect("no-such-method trampoline"),
        };

        cache.demote_primary(primary_index);
        let entry = Entry {
            class: class.address(),
            selector,
            target: target.to_value(),
            tag,
        };
        *cache.primary_mut(primary_index) = entry;
        entry
    }

    /// Alternator for debug-build assertions that want to exercise both
    /// sides of a branch across calls.
    #[cfg(debug_assertions)]
    pub fn true_then_false(&mut self) -> bool {
        let result = self.true_then_false;
        self.true_then_false = !result;
        result
    }

    // Errno caching around native-call boundaries.

    pub fn store_errno(&mut self) {
        // SAFETY: reading the thread-local errno location.
        self.errno_cache = unsafe { *errno_location() };
    }

    pub fn restore_errno(&mut self) {
        // SAFETY: writing the thread-local errno location.
        unsafe { *errno_location() = self.errno_cache };
    }

    // Debug stepping.

    pub fn ensure_debugger_attached(&mut self) {
        if self.debug_info.is_none() {
            self.debug_info = Some(Box::new(DebugInfo::new()));
        }
    }

    pub fn debug_info(&mut self) -> Option<&mut DebugInfo> {
        self.debug_info.as_deref_mut()
    }

    /// Prepare stepping over the instruction the process is suspended at.
    /// For invoke instructions this installs a one-shot breakpoint at the
    /// following instruction, qualified by the expected post-return stack
    /// height so recursive re-entries do not fire it.
    pub fn prepare_step_over(&mut self) -> i32 {
        self.ensure_debugger_attached();

        let stack = self.stack();
        let mut frame = Frame::new(stack);
        frame.move_previous();
        let current_bcp = frame.byte_code_pointer();
        // SAFETY: a suspended frame's bcp points at a valid instruction.
        let opcode =
            Opcode::from_byte(unsafe { *current_bcp }).expect("opcode");

        if !opcode.is_invoke_variant() {
            // For non-invoke instructions step over equals step.
            self.debug_info.as_mut().expect("attached").set_stepping();
            return NO_BREAKPOINT_ID;
        }

        let stack_diff = match opcode {
            Opcode::InvokeMethod
            | Opcode::InvokeMethodUnfold
            | Opcode::InvokeNoSuchMethod => {
                // SAFETY: invoke instructions carry a 4-byte operand.
                let selector =
                    unsafe { bytecode::read_int32_operand(current_bcp) }
                        as usize;
                -(Selector::decode_arity(selector) as isize)
            }
            Opcode::InvokeStatic | Opcode::InvokeFactory => {
                // SAFETY: invoke instructions carry a 4-byte operand.
                let method =
                    unsafe { bytecode::read_int32_operand(current_bcp) }
                        as usize;
                let function = self.program().static_method_at(method);
                1 - function.arity() as isize
            }
            Opcode::InvokeStaticUnfold | Opcode::InvokeFactoryUnfold => {
                assert!(
                    self.program().flags().unfold_program,
                    "unfold invokes require an unfolded program"
                );
                let function = Function::from_value(
                    Function::constant_for_bytecode(current_bcp),
                );
                1 - function.arity() as isize
            }
            _ => opcode.stack_diff(),
        };

        let function = Function::from_bytecode_pointer(current_bcp);
        let frame_end = stack.top() as isize - stack_diff + 2;
        let stack_height = stack.length() as isize - frame_end;
        let bytecode_index = current_bcp as usize + opcode.size()
            - function.bytecode_address_for(0) as usize;
        let coroutine = self.coroutine;
        self.debug_info.as_mut().expect("attached").set_breakpoint(
            function,
            bytecode_index,
            true,
            coroutine,
            stack_height as usize,
        )
    }

    /// Prepare running until the current frame returns to its caller.
    pub fn prepare_step_out(&mut self) -> i32 {
        self.ensure_debugger_attached();

        let stack = self.stack();
        let mut frame = Frame::new(stack);
        let has_top_frame = frame.move_previous();
        debug_assert!(has_top_frame);
        let frame_bottom = frame.frame_pointer_index() + 1;
        let callee = frame.function_from_byte_code_pointer();
        let has_frame_below = frame.move_previous();
        debug_assert!(has_frame_below);
        let caller = frame.function_from_byte_code_pointer();
        let bytecode_index = frame.byte_code_pointer() as usize
            - caller.bytecode_address_for(0) as usize;

        // Where the stack pointer lands after the callee's arguments and
        // the return slot are popped.
        let expected_sp = frame_bottom + callee.arity();
        let stack_height = stack.length() - expected_sp;
        let coroutine = self.coroutine;
        self.debug_info.as_mut().expect("attached").set_breakpoint(
            caller,
            bytecode_index,
            true,
            coroutine,
            stack_height,
        )
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // Cleanup must have detached everything externally visible.
        debug_assert!(self.ports.is_null());
        debug_assert!(self.cooked_stack_deltas.is_empty());

        // SAFETY: the process owns one handle reference from birth.
        unsafe { ProcessHandle::decrement_ref(self.process_handle) };

        let signal = self.signal.load(Ordering::Acquire);
        if !signal.is_null() {
            // SAFETY: the pending signal slot owns one reference.
            unsafe { Signal::decrement_ref(signal) };
        }

        // The whole heap dies with the process; run every finalizer.
        self.heap.finalize_all_weak_pointers();
    }
}

#[cfg(target_os = "linux")]
fn errno_location() -> *mut i32 {
    // SAFETY: always valid for the calling thread.
    unsafe { libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testing::StackSimulator;
    use crate::mailbox::{process_queue_get_message, Message, MessagePayload};
    use crate::object::OneByteString;
    use crate::program::Program;

    fn spawn(program: &mut Program) -> &'static mut Process {
        let process = program.spawn_process(std::ptr::null_mut());
        // SAFETY: single-threaded tests delete the process before the
        // program goes away.
        unsafe { &mut *process }
    }

    fn delete(program: &mut Program, process: &mut Process) {
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn stack_overflow_grows_to_512_words_and_preserves_content() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        let function = program.create_function(
            0,
            &[Opcode::Return as u8; 16],
            &[],
        );
        let stack = process.stack();
        assert_eq!(stack.length(), 256);
        let mut simulator = StackSimulator::new(stack);
        simulator.enter_entry_frame(function);
        for n in 0..40 {
            simulator.push_value(Value::from_smi(n));
        }
        simulator.save_state();
        let height = stack.length() - stack.top();
        let old_words: Vec<Value> =
            (stack.top()..stack.length()).map(|i| stack.get(i)).collect();

        let result = process.handle_stack_overflow(4);
        assert_eq!(result, StackCheckResult::Continue);

        let grown = process.stack();
        assert_eq!(grown.length(), 512, "256 + max(256, pow2(4))");
        assert_eq!(grown.length() - grown.top(), height);
        // The live suffix is bitwise equal except for the rebased frame
        // pointer links; compare the tagged values.
        let mut frame = Frame::new(grown);
        assert!(frame.move_previous());
        assert_eq!(
            frame.byte_code_pointer() as usize,
            function.bytecode_address_for(0) as usize
        );
        let mut preserved = 0;
        for (offset, old) in old_words.iter().enumerate() {
            let new = grown.get(grown.top() + offset);
            if new == *old {
                preserved += 1;
            }
        }
        // Everything but the two frame-pointer slots is untouched.
        assert!(preserved >= old_words.len() - 2);
        assert_eq!(
            process.stack_limit(),
            grown.pointer(GUARANTEED_FRAME_SIZE + 2) as usize,
            "real limit points into the new stack"
        );
        delete(&mut program, process);
    }

    #[test]
    fn stack_growth_refuses_past_the_platform_maximum() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        let result = process
            .handle_stack_overflow(platform::max_stack_size_in_words());
        assert_eq!(result, StackCheckResult::Overflow);
        delete(&mut program, process);
    }

    #[test]
    fn interrupt_markers_are_served_in_order_and_idempotent() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        let real_limit = process.stack_limit();
        assert!(real_limit < MAX_STACK_MARKER);

        process.preempt();
        process.preempt();
        process.profile();
        assert!(process.stack_limit() >= MAX_STACK_MARKER);

        // Preempt is served first; the profile marker keeps the sentinel.
        assert_eq!(
            process.handle_stack_overflow(0),
            StackCheckResult::Interrupt
        );
        assert!(process.stack_limit() >= MAX_STACK_MARKER);

        // Profile acknowledges silently; now the real limit returns.
        assert_eq!(
            process.handle_stack_overflow(0),
            StackCheckResult::Continue
        );
        assert_eq!(process.stack_limit(), real_limit);
        delete(&mut program, process);
    }

    #[test]
    fn debug_interrupt_marker_reports_itself() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        process.debug_interrupt();
        assert_eq!(
            process.handle_stack_overflow(0),
            StackCheckResult::DebugInterrupt
        );
        assert!(process.stack_limit() < MAX_STACK_MARKER);
        delete(&mut program, process);
    }

    #[test]
    fn allocation_failure_is_recoverable_by_one_collection() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        // Drive the heap into its budget, keeping nothing alive.
        let mut failed = false;
        for _ in 0..1_000_000 {
            if process.new_array(256).is_failure() {
                failed = true;
                break;
            }
        }
        assert!(failed, "the budget must eventually run out");
        process.collect_mutable_garbage();
        let retried = process.new_array(256);
        assert!(
            !retried.is_failure(),
            "after one collection the factory must succeed"
        );
        delete(&mut program, process);
    }

    #[test]
    fn signal_race_installs_exactly_one_winner() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        let handle = ProcessHandle::new(std::ptr::null_mut());
        let a = Signal::new(handle, SignalKind::Terminated);
        let b = Signal::new(handle, SignalKind::KilledDueToLink);
        // Both signals reference the handle: 1 (birth) + 2.
        // SAFETY: handle outlives the signals.
        assert_eq!(unsafe { &*handle }.ref_count(), 3);

        let process_ref: &Process = &*process;
        // Raw pointers are not Send; smuggle the addresses.
        let a_address = a as usize;
        let b_address = b as usize;
        std::thread::scope(|scope| {
            let first = scope.spawn(move || {
                process_ref.send_signal(a_address as *mut Signal)
            });
            let second = scope.spawn(move || {
                process_ref.send_signal(b_address as *mut Signal)
            });
            first.join().expect("sender");
            second.join().expect("sender");
        });

        let installed = process.signal();
        assert!(installed == a || installed == b);
        // The loser was released: only the winner and birth remain.
        // SAFETY: handle outlives the signals.
        assert_eq!(unsafe { &*handle }.ref_count(), 2);

        delete(&mut program, process);
        // SAFETY: deletion dropped the installed signal too.
        assert_eq!(unsafe { &*handle }.ref_count(), 1);
        unsafe { ProcessHandle::decrement_ref(handle) };
    }

    #[test]
    fn lookup_miss_fills_primary_and_demotes_the_evicted_entry() {
        let mut program = Program::new(Default::default());
        let selector = Selector::encode(5, SelectorKind::Method, 1);
        let method = program.create_function(1, &[Opcode::Return as u8], &[]);
        let class_a = program.create_class(0);
        program.add_method(class_a, selector, method);
        let other = program.create_function(1, &[Opcode::Return as u8], &[]);
        let class_b = program.create_class(0);
        program.add_method(class_b, selector, other);

        let process = spawn(&mut program);
        let mut thread_state = ThreadState::new();
        process.set_thread_state(&mut thread_state);

        let primary_index = LookupCache::compute_primary_index(class_a, selector);
        let entry = process.lookup_entry_slow(primary_index, class_a, selector);
        assert_eq!(entry.target, method.to_value());
        assert_ne!(entry.tag, 0, "resolved entries carry a nonzero tag");

        // Fill the same primary slot with a different receiver class; the
        // old entry must move into its secondary position.
        let _ = process.lookup_entry_slow(primary_index, class_b, selector);
        let cache = thread_state.ensure_cache();
        let secondary = cache
            .secondary(LookupCache::compute_secondary_index(class_a, selector));
        assert!(secondary.matches(class_a, selector));
        assert_eq!(secondary.target, method.to_value());

        // A later miss on the old keys is answered from the secondary.
        let again = process.lookup_entry_slow(primary_index, class_a, selector);
        assert_eq!(again.target, method.to_value());

        process.set_thread_state(std::ptr::null_mut());
        delete(&mut program, process);
    }

    #[test]
    fn missing_method_resolves_to_the_trampoline() {
        let mut program = Program::new(Default::default());
        let trampoline_selector = Selector::encode(
            names::NO_SUCH_METHOD_TRAMPOLINE,
            SelectorKind::Method,
            0,
        );
        let trampoline =
            program.create_function(0, &[Opcode::Return as u8], &[]);
        let class = program.create_class(0);
        program.add_method(class, trampoline_selector, trampoline);

        let process = spawn(&mut program);
        let mut thread_state = ThreadState::new();
        process.set_thread_state(&mut thread_state);

        let missing = Selector::encode(77, SelectorKind::Method, 3);
        let primary_index = LookupCache::compute_primary_index(class, missing);
        let entry = process.lookup_entry_slow(primary_index, class, missing);
        assert_eq!(entry.target, trampoline.to_value());
        assert_ne!(entry.tag, 0);

        process.set_thread_state(std::ptr::null_mut());
        delete(&mut program, process);
    }

    #[test]
    fn step_over_an_invoke_installs_a_qualified_one_shot_breakpoint() {
        let mut program = Program::new(Default::default());
        let selector = Selector::encode(9, SelectorKind::Method, 2) as u32;
        let mut bytecode = vec![Opcode::InvokeMethod as u8];
        bytecode.extend_from_slice(&(selector as i32).to_le_bytes());
        bytecode.push(Opcode::Return as u8);
        let function = program.create_function(0, &bytecode, &[]);

        let process = spawn(&mut program);
        let stack = process.stack();
        let mut simulator = StackSimulator::new(stack);
        simulator.enter_entry_frame(function);
        simulator.push_value(Value::from_smi(1));
        simulator.push_value(Value::from_smi(2));
        simulator.push_value(Value::from_smi(3));
        simulator.save_state();

        let top = stack.top();
        let id = process.prepare_step_over();
        assert_ne!(id, NO_BREAKPOINT_ID);
        let info = process.debug_info().expect("attached");
        let breakpoint = info.breakpoint(id).expect("installed");
        assert!(breakpoint.is_one_shot());
        assert_eq!(breakpoint.function(), function);
        assert_eq!(
            breakpoint.bytecode_index(),
            Opcode::InvokeMethod.size(),
            "breakpoint sits at the following instruction"
        );
        assert_eq!(
            breakpoint.stack_height(),
            stack.length() - (top + 4),
            "arity 2 leaves the stack four slots shorter past the frame"
        );
        delete(&mut program, process);
    }

    #[test]
    fn step_over_a_plain_instruction_just_steps() {
        let mut program = Program::new(Default::default());
        let function = program.create_function(
            0,
            &[Opcode::LoadLiteral0 as u8, Opcode::Return as u8],
            &[],
        );
        let process = spawn(&mut program);
        let mut simulator = StackSimulator::new(process.stack());
        simulator.enter_entry_frame(function);
        simulator.save_state();
        let id = process.prepare_step_over();
        assert_eq!(id, NO_BREAKPOINT_ID);
        assert!(process.debug_info().expect("attached").is_stepping());
        delete(&mut program, process);
    }

    #[test]
    fn step_out_targets_the_caller_resume_point() {
        let mut program = Program::new(Default::default());
        let outer =
            program.create_function(0, &[Opcode::Return as u8; 8], &[]);
        let inner =
            program.create_function(2, &[Opcode::Return as u8; 8], &[]);
        let process = spawn(&mut program);
        let stack = process.stack();
        let mut simulator = StackSimulator::new(stack);
        simulator.enter_entry_frame(outer);
        simulator.advance(2);
        simulator.push_value(Value::from_smi(10));
        simulator.push_value(Value::from_smi(20));
        simulator.call(inner, 1);
        simulator.save_state();

        let id = process.prepare_step_out();
        let info = process.debug_info().expect("attached");
        let breakpoint = info.breakpoint(id).expect("installed");
        assert_eq!(breakpoint.function(), outer);
        assert_eq!(
            breakpoint.bytecode_index(),
            3,
            "the caller resumes where the call recorded it"
        );
        assert!(breakpoint.is_one_shot());
        delete(&mut program, process);
    }

    #[test]
    fn finalized_foreign_message_accounts_and_finalizes_once() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        // SAFETY: the finalizer frees the buffer through libc.
        let buffer = unsafe { libc::malloc(128) } as usize;
        assert_ne!(buffer, 0);
        process.mailbox().enqueue(Message::new(
            std::ptr::null_mut(),
            MessagePayload::Foreign {
                address: buffer,
                length: 128,
                finalized: true,
            },
        ));

        let result = process_queue_get_message(process);
        assert!(!result.is_failure());
        let foreign = Instance::from_value(result);
        assert_eq!(foreign.get_consecutive_smis(0), buffer);
        assert_eq!(foreign.get_instance_field(2).as_smi(), 128);
        assert_eq!(process.heap().foreign_memory(), 128);

        // Termination runs the finalizer exactly once; the counter drains
        // before the heap goes away.
        delete(&mut program, process);
    }

    #[test]
    fn string_factory_fills_shared_heap_characters() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        let value = process.new_string_from_ascii("scavenge");
        assert!(!value.is_failure());
        let string = OneByteString::from_value(value);
        assert_eq!(string.length(), 8);
        assert_eq!(string.char_code(0), b's');
        assert_eq!(string.char_code(7), b'e');
        assert!(
            program.shared_heap().heap().space().includes(string.address()),
            "strings are immutable and live in the shared heap"
        );
        delete(&mut program, process);
    }

    #[test]
    fn smi_sized_integers_are_never_boxed() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        assert!(process.to_integer(42).is_smi());
        let huge = i64::MAX;
        let boxed = process.to_integer(huge);
        if Value::smi_is_valid(huge) {
            assert!(boxed.is_smi());
        } else {
            assert!(boxed.is_heap_object());
            assert_eq!(LargeInteger::from_value(boxed).value(), huge);
        }
        delete(&mut program, process);
    }

    #[test]
    fn errno_cache_survives_other_native_work() {
        let mut program = Program::new(Default::default());
        let process = spawn(&mut program);
        // SAFETY: errno is thread local.
        unsafe { *super::errno_location() = 42 };
        process.store_errno();
        unsafe { *super::errno_location() = 0 };
        process.restore_errno();
        // SAFETY: errno is thread local.
        assert_eq!(unsafe { *super::errno_location() }, 42);
        delete(&mut program, process);
    }

    #[test]
    fn cleanup_detaches_ports_and_notifies_links() {
        let mut program = Program::new(Default::default());
        let watcher = spawn(&mut program);
        let dying = spawn(&mut program);

        let channel = dying.new_array(1);
        let port = dying.allocate_port(channel);
        // SAFETY: both processes are alive in this test.
        unsafe { (*port).increment_ref() };
        dying.links().insert(watcher.process_handle());

        let dying_handle = dying.process_handle();
        // SAFETY: the handle outlives the deletion below.
        unsafe { (*dying_handle).increment_ref() };
        delete(&mut program, dying);

        assert_eq!(program.event_handler().ports_died_count(), 1);
        // SAFETY: we kept a reference, so the port outlived its owner.
        unsafe { Port::decrement_ref(port) };

        // The watcher got a death signal it can drain.
        let notification = crate::mailbox::process_queue_get_message(watcher);
        assert!(!notification.is_failure());
        let death = Instance::from_value(notification);
        assert_eq!(
            death.get_instance_field(1).as_smi(),
            SignalKind::Terminated as isize
        );
        // SAFETY: reference kept above.
        unsafe { ProcessHandle::decrement_ref(dying_handle) };
        delete(&mut program, watcher);
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn errno_location() -> *mut i32 {
    // SAFETY: always valid for the calling thread.
    unsafe { libc::__error() }
}
