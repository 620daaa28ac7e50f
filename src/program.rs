//! The program: the shared immutable root set (canonical objects and
//! classes, dispatch table), the list of its processes, the shared-heap
//! collection and the moving program-heap collection.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::bytecode::IntrinsicsTable;
use crate::flags::Flags;
use crate::gc::{GcStrategy, HeapPointerValidator, ScavengeVisitor};
use crate::heap::{Heap, SharedHeap};
use crate::links::{Port, SignalKind};
use crate::object::{
    Array, Class, Function, HeapObject, InstanceKind, WORD_SIZE,
};
use crate::platform;
use crate::process::Process;
use crate::scheduler::Scheduler;
use crate::space::{NoAllocationFailureScope, Space};
use crate::tagged::Value;
use crate::visitor::{
    HeapObjectPointerVisitor, HeapObjectVisitor, PointerVisitor,
};

/// Liveness notifications for ports whose receiver died; the embedder's
/// event loop observes these.
#[derive(Default)]
pub struct EventHandler {
    ports_died: std::sync::atomic::AtomicUsize,
}

impl EventHandler {
    pub fn receiver_for_ports_died(&self, ports: *mut Port) {
        let mut count = 0;
        let mut current = ports;
        while !current.is_null() {
            count += 1;
            // SAFETY: the dying process still owns the list.
            current = unsafe { &*current }.next();
        }
        if count > 0 {
            self.ports_died
                .fetch_add(count, std::sync::atomic::Ordering::Relaxed);
            tracing::debug!(count, "receiver died for ports");
        }
    }

    pub fn ports_died_count(&self) -> usize {
        self.ports_died.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Pause bookkeeping shared with the scheduler; guarded by the
/// scheduler's pause monitor.
#[derive(Default)]
pub struct ProgramState {
    paused_processes: Vec<*mut Process>,
    is_paused: bool,
}

impl ProgramState {
    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn set_is_paused(&mut self, value: bool) {
        self.is_paused = value;
    }

    pub fn has_paused_processes(&self) -> bool {
        !self.paused_processes.is_empty()
    }

    pub fn add_paused_process(&mut self, process: *mut Process) {
        self.paused_processes.push(process);
    }

    pub fn take_paused_processes(&mut self) -> Vec<*mut Process> {
        std::mem::take(&mut self.paused_processes)
    }
}

/// The roots of the program heap, laid out contiguously so collections
/// visit them as one block.
#[repr(C)]
struct Roots {
    null_object: Value,
    false_object: Value,
    true_object: Value,
    empty_array: Value,
    empty_string: Value,
    meta_class: Value,
    smi_class: Value,
    boxed_class: Value,
    large_integer_class: Value,
    object_class: Value,
    bool_class: Value,
    array_class: Value,
    byte_array_class: Value,
    one_byte_string_class: Value,
    two_byte_string_class: Value,
    double_class: Value,
    function_class: Value,
    stack_class: Value,
    coroutine_class: Value,
    process_class: Value,
    process_death_class: Value,
    port_class: Value,
    foreign_memory_class: Value,
    classes: Value,
    constants: Value,
    static_methods: Value,
    static_fields: Value,
    dispatch_table: Value,
}

impl Roots {
    fn zeroed() -> Roots {
        // SAFETY: a Roots full of smi zeros is a valid value.
        unsafe { std::mem::zeroed() }
    }

    fn first_slot(&mut self) -> *mut Value {
        &mut self.null_object
    }

    fn last_slot(&mut self) -> *mut Value {
        &mut self.dispatch_table
    }
}

pub struct Program {
    roots: Roots,
    heap: Heap,
    shared_heap: SharedHeap,
    process_list_mutex: Mutex<()>,
    process_list_head: *mut Process,
    random: SmallRng,
    scheduler: *mut Scheduler,
    program_state: ProgramState,
    event_handler: EventHandler,
    entry: Value,
    main_arity: usize,
    is_compact: bool,
    exit_kind: SignalKind,
    dispatch_table_intrinsics: Vec<usize>,
    flags: Flags,
    gc: GcStrategy,
}

unsafe impl Send for Program {}
unsafe impl Sync for Program {}

impl Program {
    pub fn new(flags: Flags) -> Box<Program> {
        let gc = if flags.mark_sweep {
            GcStrategy::MarkSweep
        } else {
            GcStrategy::Scavenge
        };
        let mut program = Box::new(Program {
            roots: Roots::zeroed(),
            heap: Heap::new(0),
            shared_heap: SharedHeap::new(),
            process_list_mutex: Mutex::new(()),
            process_list_head: std::ptr::null_mut(),
            random: SmallRng::seed_from_u64(platform::get_microseconds() | 1),
            scheduler: std::ptr::null_mut(),
            program_state: ProgramState::default(),
            event_handler: EventHandler::default(),
            entry: Value::zero(),
            main_arity: 0,
            is_compact: false,
            exit_kind: SignalKind::Terminated,
            dispatch_table_intrinsics: Vec::new(),
            flags,
            gc,
        });
        program.initialize();
        program
    }

    /// Build the canonical root set in the program heap.
    fn initialize(&mut self) {
        let _scope = NoAllocationFailureScope::new(self.heap.space_mut());

        // The meta class is its own class; allocate it by hand.
        let address = self.heap.allocate(Class::SIZE_WORDS * WORD_SIZE);
        debug_assert_ne!(address, 0);
        // SAFETY: freshly allocated, initialized right here.
        let meta_object = unsafe { HeapObject::from_address(address) };
        meta_object.set_value_at(0, Value::from_address(address));
        meta_object.set_value_at(
            Class::KIND_INDEX,
            Value::from_smi(InstanceKind::Class as isize),
        );
        meta_object
            .set_value_at(Class::FIELDS_INDEX, Value::from_smi(0));
        meta_object.set_value_at(Class::METHODS_INDEX, Value::zero());
        meta_object.set_value_at(Class::SUPER_INDEX, Value::zero());
        let meta_class = Class::cast(meta_object);
        self.roots.meta_class = meta_class.to_value();

        let class = |heap: &mut Heap, kind, fields| {
            let value = heap.create_class(meta_class, kind, fields);
            debug_assert!(!value.is_failure());
            Class::from_value(value)
        };
        let object_class =
            class(&mut self.heap, InstanceKind::Instance, 0);
        self.roots.object_class = object_class.to_value();
        self.roots.smi_class =
            class(&mut self.heap, InstanceKind::Instance, 0).to_value();
        self.roots.bool_class =
            class(&mut self.heap, InstanceKind::Instance, 0).to_value();
        self.roots.boxed_class =
            class(&mut self.heap, InstanceKind::Boxed, 0).to_value();
        self.roots.large_integer_class =
            class(&mut self.heap, InstanceKind::LargeInteger, 0).to_value();
        self.roots.array_class =
            class(&mut self.heap, InstanceKind::Array, 0).to_value();
        self.roots.byte_array_class =
            class(&mut self.heap, InstanceKind::ByteArray, 0).to_value();
        self.roots.one_byte_string_class =
            class(&mut self.heap, InstanceKind::OneByteString, 0).to_value();
        self.roots.two_byte_string_class =
            class(&mut self.heap, InstanceKind::TwoByteString, 0).to_value();
        self.roots.double_class =
            class(&mut self.heap, InstanceKind::Double, 0).to_value();
        self.roots.function_class =
            class(&mut self.heap, InstanceKind::Function, 0).to_value();
        self.roots.stack_class =
            class(&mut self.heap, InstanceKind::Stack, 0).to_value();
        self.roots.coroutine_class =
            class(&mut self.heap, InstanceKind::Coroutine, 2).to_value();
        self.roots.process_class =
            class(&mut self.heap, InstanceKind::Instance, 2).to_value();
        self.roots.process_death_class =
            class(&mut self.heap, InstanceKind::Instance, 2).to_value();
        self.roots.port_class =
            class(&mut self.heap, InstanceKind::Instance, 2).to_value();
        self.roots.foreign_memory_class =
            class(&mut self.heap, InstanceKind::Instance, 4).to_value();

        let null = self.heap.create_instance(object_class, Value::zero());
        debug_assert!(!null.is_failure());
        self.roots.null_object = null;
        let bool_class = Class::from_value(self.roots.bool_class);
        self.roots.false_object =
            self.heap.create_instance(bool_class, null);
        self.roots.true_object =
            self.heap.create_instance(bool_class, null);

        let array_class = Class::from_value(self.roots.array_class);
        let empty_array = self.heap.create_array(array_class, 0, null);
        debug_assert!(!empty_array.is_failure());
        self.roots.empty_array = empty_array;
        let string_class =
            Class::from_value(self.roots.one_byte_string_class);
        self.roots.empty_string =
            self.heap.create_one_byte_string_uninitialized(string_class, 0);

        self.roots.classes = empty_array;
        self.roots.constants = empty_array;
        self.roots.static_methods = empty_array;
        self.roots.static_fields = empty_array;
        self.roots.dispatch_table = empty_array;
    }

    // Root accessors.

    pub fn null_object(&self) -> Value {
        self.roots.null_object
    }

    pub fn true_object(&self) -> Value {
        self.roots.true_object
    }

    pub fn false_object(&self) -> Value {
        self.roots.false_object
    }

    pub fn empty_array(&self) -> Array {
        Array::from_value(self.roots.empty_array)
    }

    pub fn meta_class(&self) -> Class {
        Class::from_value(self.roots.meta_class)
    }

    pub fn object_class(&self) -> Class {
        Class::from_value(self.roots.object_class)
    }

    pub fn boxed_class(&self) -> Class {
        Class::from_value(self.roots.boxed_class)
    }

    pub fn large_integer_class(&self) -> Class {
        Class::from_value(self.roots.large_integer_class)
    }

    pub fn array_class(&self) -> Class {
        Class::from_value(self.roots.array_class)
    }

    pub fn byte_array_class(&self) -> Class {
        Class::from_value(self.roots.byte_array_class)
    }

    pub fn one_byte_string_class(&self) -> Class {
        Class::from_value(self.roots.one_byte_string_class)
    }

    pub fn two_byte_string_class(&self) -> Class {
        Class::from_value(self.roots.two_byte_string_class)
    }

    pub fn double_class(&self) -> Class {
        Class::from_value(self.roots.double_class)
    }

    pub fn function_class(&self) -> Class {
        Class::from_value(self.roots.function_class)
    }

    pub fn stack_class(&self) -> Class {
        Class::from_value(self.roots.stack_class)
    }

    pub fn coroutine_class(&self) -> Class {
        Class::from_value(self.roots.coroutine_class)
    }

    pub fn process_class(&self) -> Class {
        Class::from_value(self.roots.process_class)
    }

    pub fn process_death_class(&self) -> Class {
        Class::from_value(self.roots.process_death_class)
    }

    pub fn port_class(&self) -> Class {
        Class::from_value(self.roots.port_class)
    }

    pub fn foreign_memory_class(&self) -> Class {
        Class::from_value(self.roots.foreign_memory_class)
    }

    pub fn static_fields(&self) -> Array {
        Array::from_value(self.roots.static_fields)
    }

    pub fn set_static_fields(&mut self, static_fields: Array) {
        self.roots.static_fields = static_fields.to_value();
    }

    pub fn static_method_at(&self, index: usize) -> Function {
        Function::from_value(
            Array::from_value(self.roots.static_methods).get(index),
        )
    }

    pub fn set_static_methods(&mut self, static_methods: Array) {
        self.roots.static_methods = static_methods.to_value();
    }

    pub fn class_at(&self, index: usize) -> Class {
        Class::from_value(Array::from_value(self.roots.classes).get(index))
    }

    pub fn constant_at(&self, index: usize) -> Value {
        Array::from_value(self.roots.constants).get(index)
    }

    pub fn set_dispatch_table(&mut self, dispatch_table: Array) {
        self.roots.dispatch_table = dispatch_table.to_value();
        self.dispatch_table_intrinsics.clear();
    }

    // Plumbing.

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn shared_heap(&self) -> &SharedHeap {
        &self.shared_heap
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn gc_strategy(&self) -> GcStrategy {
        self.gc
    }

    pub fn event_handler(&self) -> &EventHandler {
        &self.event_handler
    }

    pub fn program_state(&mut self) -> &mut ProgramState {
        &mut self.program_state
    }

    pub fn random_u32(&mut self) -> u32 {
        self.random.next_u32()
    }

    pub fn is_compact(&self) -> bool {
        self.is_compact
    }

    pub fn set_is_compact(&mut self, value: bool) {
        self.is_compact = value;
    }

    pub fn entry(&self) -> Value {
        self.entry
    }

    pub fn set_entry(&mut self, entry: Function) {
        self.entry = entry.to_value();
    }

    pub fn main_arity(&self) -> usize {
        self.main_arity
    }

    pub fn set_main_arity(&mut self, main_arity: usize) {
        self.main_arity = main_arity;
    }

    pub fn exit_kind(&self) -> SignalKind {
        self.exit_kind
    }

    pub fn set_exit_kind(&mut self, exit_kind: SignalKind) {
        self.exit_kind = exit_kind;
    }

    pub fn scheduler(&self) -> *mut Scheduler {
        self.scheduler
    }

    pub fn set_scheduler(&mut self, scheduler: *mut Scheduler) {
        debug_assert!(
            self.scheduler.is_null() != scheduler.is_null(),
            "scheduler is attached and detached exactly once"
        );
        debug_assert!(!self.program_state.has_paused_processes());
        debug_assert!(!self.program_state.is_paused());
        self.scheduler = scheduler;
    }

    // Program-heap factories, used when building a program in a session.
    // They grow the heap rather than fail: program construction happens
    // before any mutator could collect.

    pub fn create_class(&mut self, fields: usize) -> Class {
        let meta_class = self.meta_class();
        let _scope = NoAllocationFailureScope::new(self.heap.space_mut());
        Class::from_value(self.heap.create_class(
            meta_class,
            InstanceKind::Instance,
            fields,
        ))
    }

    pub fn create_array(&mut self, values: &[Value]) -> Array {
        let class = self.array_class();
        let null = self.null_object();
        let _scope = NoAllocationFailureScope::new(self.heap.space_mut());
        let array =
            Array::from_value(self.heap.create_array(class, values.len(), null));
        for (index, value) in values.iter().enumerate() {
            array.set(index, *value);
        }
        array
    }

    pub fn create_function(
        &mut self,
        arity: usize,
        bytecode: &[u8],
        literals: &[Value],
    ) -> Function {
        let literals_value = if literals.is_empty() {
            Value::zero()
        } else {
            self.create_array(literals).to_value()
        };
        let class = self.function_class();
        let _scope = NoAllocationFailureScope::new(self.heap.space_mut());
        Function::from_value(self.heap.create_function(
            class,
            arity,
            bytecode,
            literals_value,
        ))
    }

    /// Append a `(selector, function)` pair to a class's method table.
    pub fn add_method(
        &mut self,
        class: Class,
        selector: usize,
        function: Function,
    ) {
        let old_length = class.methods().map_or(0, |methods| methods.length());
        let array_class = self.array_class();
        let null = self.null_object();
        let _scope = NoAllocationFailureScope::new(self.heap.space_mut());
        let methods = Array::from_value(self.heap.create_array(
            array_class,
            old_length + 2,
            null,
        ));
        if let Some(old) = class.methods() {
            for index in 0..old_length {
                methods.set(index, old.get(index));
            }
        }
        methods.set(old_length, Value::from_smi(selector as isize));
        methods.set(old_length + 1, function.to_value());
        class.set_methods(methods);
    }

    /// Precompute the intrinsic tag of every dispatch-table target.
    pub fn setup_dispatch_table_intrinsics(&mut self) {
        let table = Array::from_value(self.roots.dispatch_table);
        let intrinsics = IntrinsicsTable::get_default();
        self.dispatch_table_intrinsics.clear();
        for index in 0..table.length() {
            let entry = table.get(index);
            let tag = if entry.is_heap_object() {
                Function::from_value(entry)
                    .compute_intrinsic(intrinsics)
                    .unwrap_or(1)
            } else {
                0
            };
            self.dispatch_table_intrinsics.push(tag);
        }
        tracing::debug!(
            entries = self.dispatch_table_intrinsics.len(),
            "dispatch table intrinsics"
        );
    }

    pub fn clear_dispatch_table_intrinsics(&mut self) {
        self.dispatch_table_intrinsics.clear();
    }

    pub fn dispatch_table_intrinsic_at(&self, index: usize) -> usize {
        self.dispatch_table_intrinsics[index]
    }

    // Process management.

    pub fn spawn_process(&mut self, parent: *mut Process) -> *mut Process {
        let process = Process::new(self, parent);
        // SAFETY: freshly created, not shared yet.
        unsafe { (*process).setup_execution_stack() };
        self.add_to_process_list(process);
        process
    }

    /// Detach, notify and delete a process. Returns true when it was the
    /// last one.
    pub fn schedule_process_for_deletion(
        &mut self,
        process: *mut Process,
        kind: SignalKind,
    ) -> bool {
        // SAFETY: the process is alive and owned by this program.
        unsafe { (*process).cleanup(kind) };
        self.remove_from_process_list(process);
        let last = self.process_list_head.is_null();
        // SAFETY: removed from the list; nothing references it anymore.
        drop(unsafe { Box::from_raw(process) });
        last
    }

    fn add_to_process_list(&mut self, process: *mut Process) {
        let _guard = self.process_list_mutex.lock();
        // SAFETY: the process is alive and not yet listed.
        unsafe {
            debug_assert!((*process).process_list_next().is_null());
            debug_assert!((*process).process_list_prev().is_null());
            (*process).set_process_list_next(self.process_list_head);
            if !self.process_list_head.is_null() {
                (*self.process_list_head).set_process_list_prev(process);
            }
        }
        self.process_list_head = process;
    }

    fn remove_from_process_list(&mut self, process: *mut Process) {
        let _guard = self.process_list_mutex.lock();
        // SAFETY: the process is listed exactly once.
        unsafe {
            let next = (*process).process_list_next();
            let prev = (*process).process_list_prev();
            if !next.is_null() {
                (*next).set_process_list_prev(prev);
            }
            if !prev.is_null() {
                (*prev).set_process_list_next(next);
            } else {
                self.process_list_head = next;
            }
            (*process).set_process_list_next(std::ptr::null_mut());
            (*process).set_process_list_prev(std::ptr::null_mut());
        }
    }

    /// Walk all processes. Only sound while the program is stopped.
    pub fn visit_processes(&mut self, visit: &mut dyn FnMut(&mut Process)) {
        let mut current = self.process_list_head;
        while !current.is_null() {
            // SAFETY: the list is stable while the program is stopped.
            let process = unsafe { &mut *current };
            current = process.process_list_next();
            visit(process);
        }
    }

    // Root iteration.

    pub fn iterate_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        let start = self.roots.first_slot();
        // SAFETY: the roots struct is a contiguous block of values.
        let end = unsafe { self.roots.last_slot().add(1) };
        visitor.visit_block(start, end);
        visitor.visit(&mut self.entry as *mut Value);
    }

    // Shared-heap collection: stop the world, then scavenge the shared
    // heap using every process's roots and store buffer.

    pub fn collect_shared_garbage(&mut self, program_is_stopped: bool) {
        let scheduler = self.scheduler;
        if !program_is_stopped && !scheduler.is_null() {
            // SAFETY: the scheduler outlives the program.
            unsafe { (*scheduler).stop_program(self) };
        }

        if self.flags.validate_heaps {
            self.validate_heaps_are_consistent();
        }

        let print = self.flags.print_heap_statistics;
        let before = print.then(|| {
            (self.shared_heap.estimated_used(), self.shared_heap.estimated_size())
        });

        self.perform_shared_garbage_collection();

        if let Some((used_before, size_before)) = before {
            tracing::debug!(
                used_before,
                size_before,
                used_after = self.shared_heap.estimated_used(),
                size_after = self.shared_heap.estimated_size(),
                "shared gc"
            );
        }

        if self.flags.validate_heaps {
            self.validate_heaps_are_consistent();
        }

        if !program_is_stopped && !scheduler.is_null() {
            // SAFETY: the scheduler outlives the program.
            unsafe { (*scheduler).resume_program(self) };
        }
    }

    pub fn perform_shared_garbage_collection(&mut self) {
        // Squeeze the store buffers first so the scavenge pass below
        // visits as few duplicates as possible.
        self.compact_store_buffers();

        let mut shared = self.shared_heap.heap();
        let mut to = Space::new(shared.space().used() / 10);
        let mut process_heap_sizes = 0;
        {
            let _scope = NoAllocationFailureScope::new(&mut to);
            let from: *const Space = shared.space();
            let mut scavenger = ScavengeVisitor::new(from, &mut to);

            let mut current = self.process_list_head;
            while !current.is_null() {
                // SAFETY: the program is stopped; the list is stable.
                let process = unsafe { &mut *current };
                process.take_child_heaps();
                process.iterate_roots(&mut scavenger);
                process
                    .store_buffer()
                    .iterate_pointers_to_immutable_space(&mut scavenger);
                process_heap_sizes += process.heap().space().used();
                current = process.process_list_next();
            }

            to.complete_scavenge(&mut scavenger);
        }
        let old_space = shared.take_space();
        shared.process_weak_pointers(&old_space);
        shared.replace_space(to);
        drop(old_space);
        drop(shared);

        self.shared_heap.update_limit_after_gc(process_heap_sizes);
    }

    pub fn compact_store_buffers(&mut self) {
        self.visit_processes(&mut |process| {
            process.store_buffer_mut().compact();
        });
    }

    // Program-heap collection: a moving scavenge over the code and
    // canonical objects. Every process first collects its own heap while
    // chaining its stacks, then cooks them so bytecode pointers survive
    // the move.

    pub fn collect_garbage(&mut self) {
        let scheduler = self.scheduler;
        if !scheduler.is_null() {
            // SAFETY: the scheduler outlives the program.
            unsafe { (*scheduler).stop_program(self) };
        }

        self.prepare_program_gc();
        let to = Space::new(self.heap.space().used() / 10);
        self.perform_program_gc(to);
        self.finish_program_gc();

        if !scheduler.is_null() {
            // SAFETY: the scheduler outlives the program.
            unsafe { (*scheduler).resume_program(self) };
        }
    }

    pub fn prepare_program_gc(&mut self) {
        let validate = self.flags.validate_heaps;
        self.visit_processes(&mut |process| {
            if validate {
                process.validate_heaps();
            }
            let number_of_stacks = process.collect_garbage_and_chain_stacks();
            process.cook_stacks(number_of_stacks);
        });
    }

    fn perform_program_gc(&mut self, mut to: Space) {
        {
            let _scope = NoAllocationFailureScope::new(&mut to);
            let from: *const Space = self.heap.space();
            let mut scavenger = ScavengeVisitor::new(from, &mut to);

            self.iterate_roots(&mut scavenger);

            // All shared-heap objects may point into the program heap.
            {
                let mut shared = self.shared_heap.heap();
                let mut object_visitor =
                    HeapObjectPointerVisitor::new(&mut scavenger);
                shared.space_mut().iterate_objects(&mut object_visitor);
            }

            let mut current = self.process_list_head;
            while !current.is_null() {
                // SAFETY: the program is stopped; the list is stable.
                let process = unsafe { &mut *current };
                process.iterate_program_pointers(&mut scavenger);
                current = process.process_list_next();
            }

            debug_assert!(!to.is_empty());
            to.complete_scavenge(&mut scavenger);
        }
        let old_space = self.heap.take_space();
        self.heap.replace_space(to);
        drop(old_space);
    }

    pub fn finish_program_gc(&mut self) {
        let validate = self.flags.validate_heaps;
        self.visit_processes(&mut |process| {
            process.uncook_and_unchain_stacks();
            process.update_breakpoints();
            if validate {
                process.validate_heaps();
            }
        });
        if validate {
            self.validate_heaps_are_consistent();
        }
    }

    // Validation, driven by -Xvalidate_heaps.

    pub fn validate_heaps_are_consistent(&mut self) {
        let shared = self.shared_heap.heap();
        let spaces: Vec<*const Space> =
            vec![self.heap.space(), shared.space()];
        drop(shared);
        let mut validator = HeapPointerValidator::new(spaces.clone());
        self.iterate_roots(&mut validator);
        {
            let mut object_visitor =
                HeapObjectPointerVisitor::new(&mut validator);
            self.heap.space_mut().iterate_objects(&mut object_visitor);
        }
        let mut shared = self.shared_heap.heap();
        let mut validator = HeapPointerValidator::new(spaces);
        let mut object_visitor = HeapObjectPointerVisitor::new(&mut validator);
        shared.space_mut().iterate_objects(&mut object_visitor);
    }

    /// Walk the program heap and log object statistics.
    pub fn print_statistics(&mut self) {
        let mut statistics = StatisticsVisitor::default();
        self.heap.space_mut().iterate_objects(&mut statistics);
        tracing::info!(
            objects = statistics.object_count,
            classes = statistics.class_count,
            arrays = statistics.array_count,
            array_bytes = statistics.array_size,
            strings = statistics.string_count,
            functions = statistics.function_count,
            bytecode_bytes = statistics.bytecode_size,
            "program heap statistics"
        );
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        // Any process still alive goes down with its program.
        while !self.process_list_head.is_null() {
            let process = self.process_list_head;
            self.schedule_process_for_deletion(process, self.exit_kind);
        }
        // The shared heap dies with the program; settle its finalizers.
        self.shared_heap.heap().finalize_all_weak_pointers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
    use crate::frame::testing::StackSimulator;
    use crate::frame::Frame;
    use crate::object::{OneByteString, Stack};

    fn spawn(program: &mut Program) -> &'static mut Process {
        let process = program.spawn_process(std::ptr::null_mut());
        // SAFETY: single-threaded tests delete the process before the
        // program goes away.
        unsafe { &mut *process }
    }

    #[test]
    fn spawned_processes_are_listed_and_the_last_deletion_reports_it() {
        let mut program = Program::new(Flags::default());
        let first = program.spawn_process(std::ptr::null_mut());
        let second = program.spawn_process(std::ptr::null_mut());
        let mut seen = 0;
        program.visit_processes(&mut |_| seen += 1);
        assert_eq!(seen, 2);
        assert!(!program
            .schedule_process_for_deletion(first, SignalKind::Terminated));
        assert!(program
            .schedule_process_for_deletion(second, SignalKind::Terminated));
    }

    #[test]
    fn mutable_collection_keeps_shared_references_and_remembers_them() {
        let mut program = Program::new(Flags::default());
        let process = spawn(&mut program);

        let array = process.new_array(1024);
        assert!(!array.is_failure());
        let string = process.new_string_from_ascii("shared payload");
        assert!(!string.is_failure());
        Array::from_value(array).set(7, string);
        // The mutator wrote a shared-heap pointer into a mutable object;
        // its side of the contract is one store-buffer insert.
        process.store_buffer_mut().insert(HeapObject::from_value(array));
        process.set_exception(array);

        process.collect_mutable_garbage();

        let moved = process.exception();
        assert_ne!(moved, array, "the array was evacuated");
        let moved_array = Array::from_value(moved);
        assert_eq!(
            moved_array.get(7),
            string,
            "the shared string did not move in a mutable collection"
        );
        assert!(
            process.store_buffer().contains(HeapObject::from_value(moved)),
            "the rebuilt store buffer tracks the evacuated array"
        );
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn no_reachable_slot_references_from_space_after_a_scavenge() {
        let mut program = Program::new(Flags::default());
        let process = spawn(&mut program);
        // A small object graph with sharing.
        let inner = process.new_array(4);
        let outer = process.new_array(2);
        Array::from_value(outer).set(0, inner);
        Array::from_value(outer).set(1, inner);
        process.set_exception(outer);

        process.collect_mutable_garbage();

        let outer = Array::from_value(process.exception());
        let space = process.heap().space();
        assert!(space.includes(outer.address()));
        let first = outer.get(0);
        assert!(space.includes(first.address()));
        assert_eq!(
            first,
            outer.get(1),
            "a shared object is evacuated exactly once"
        );
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn shared_collection_rewrites_store_buffer_pointers() {
        let mut program = Program::new(Flags::default());
        let process = spawn(&mut program);

        let array = process.new_array(8);
        let string = process.new_string_from_ascii("immutable");
        Array::from_value(array).set(3, string);
        process.store_buffer_mut().insert(HeapObject::from_value(array));
        process.set_exception(array);

        program.collect_shared_garbage(true);

        let array = Array::from_value(process.exception());
        let moved = array.get(3);
        assert_ne!(moved, string, "the shared string was evacuated");
        let moved_string = OneByteString::from_value(moved);
        assert_eq!(moved_string.length(), "immutable".len());
        assert_eq!(moved_string.char_code(0), b'i');
        assert!(program
            .shared_heap()
            .heap()
            .space()
            .includes(moved_string.address()));
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn cook_and_uncook_restore_every_bcp_and_unchain() {
        let mut program = Program::new(Flags::default());
        let process = spawn(&mut program);
        let outer =
            program.create_function(0, &[Opcode::Return as u8; 8], &[]);
        let inner =
            program.create_function(1, &[Opcode::Return as u8; 8], &[]);

        let mut simulator = StackSimulator::new(process.stack());
        simulator.enter_entry_frame(outer);
        simulator.advance(2);
        simulator.push_value(Value::from_smi(1));
        simulator.call(inner, 1);
        simulator.advance(4);
        simulator.save_state();

        let original: Vec<usize> = {
            let mut bcps = Vec::new();
            let mut frame = Frame::new(process.stack());
            while frame.move_previous() {
                bcps.push(frame.byte_code_pointer() as usize);
            }
            bcps
        };

        let number_of_stacks = process.collect_garbage_and_chain_stacks();
        assert_eq!(number_of_stacks, 1);
        process.cook_stacks(number_of_stacks);
        assert!(process.stacks_are_cooked());
        {
            let mut frame = Frame::new(process.stack());
            assert!(frame.move_previous());
            assert_eq!(
                frame.cooked_function(),
                inner,
                "a cooked bcp slot holds the owning function"
            );
        }
        process.uncook_and_unchain_stacks();
        assert!(!process.stacks_are_cooked());

        let restored: Vec<usize> = {
            let mut bcps = Vec::new();
            let mut frame = Frame::new(process.stack());
            while frame.move_previous() {
                bcps.push(frame.byte_code_pointer() as usize);
            }
            bcps
        };
        assert_eq!(original, restored, "uncook is the inverse of cook");
        assert_eq!(
            process.stack().next(),
            Value::zero(),
            "the chain link resets to the smi zero"
        );
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn program_collection_relocates_functions_under_live_frames() {
        let mut program = Program::new(Flags::default());
        let process = spawn(&mut program);
        let function =
            program.create_function(0, &[Opcode::Return as u8; 16], &[]);
        let methods = program.create_array(&[function.to_value()]);
        program.set_static_methods(methods);

        let mut simulator = StackSimulator::new(process.stack());
        simulator.enter_entry_frame(function);
        simulator.advance(5);
        simulator.save_state();
        let delta = 5;

        program.collect_garbage();

        let relocated = program.static_method_at(0);
        assert_ne!(
            relocated, function,
            "the program heap moved, and the function with it"
        );
        let mut frame = Frame::new(process.stack());
        assert!(frame.move_previous());
        assert_eq!(
            frame.byte_code_pointer() as usize,
            relocated.bytecode_address_for(0) as usize + delta,
            "the uncooked bcp is the relocated start plus the old delta"
        );
        assert_eq!(frame.function_from_byte_code_pointer(), relocated);
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn mark_sweep_collection_reclaims_unreachable_objects() {
        let mut flags = Flags::default();
        flags.mark_sweep = true;
        let mut program = Program::new(flags);
        let process = spawn(&mut program);

        let kept = process.new_array(8);
        process.set_exception(kept);
        for _ in 0..64 {
            let _ = process.new_array(32);
        }
        let used_before = process.heap().space().used();

        process.collect_mutable_garbage();

        let used_after = process.heap().space().used();
        assert!(
            used_after < used_before,
            "sweeping must reclaim the garbage arrays"
        );
        assert_eq!(
            process.exception(),
            kept,
            "mark-sweep does not move survivors"
        );
        assert_eq!(Array::from_value(kept).length(), 8);
        // The freed space is reusable without growing the heap.
        let array_bytes = (2 + 32) * WORD_SIZE;
        let refill = ((used_before - used_after) / array_bytes).min(8);
        assert!(refill > 0, "at least one garbage array must have died");
        let size_before = process.heap().space().size();
        for _ in 0..refill {
            assert!(!process.new_array(32).is_failure());
        }
        assert_eq!(process.heap().space().size(), size_before);
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn stacks_survive_a_mutable_collection_with_live_frames() {
        let mut program = Program::new(Flags::default());
        let process = spawn(&mut program);
        let function =
            program.create_function(0, &[Opcode::Return as u8; 8], &[]);
        let mut simulator = StackSimulator::new(process.stack());
        simulator.enter_entry_frame(function);
        simulator.push_value(Value::from_smi(99));
        simulator.save_state();

        let old_stack = process.stack();
        process.collect_mutable_garbage();
        let new_stack = process.stack();
        assert_ne!(new_stack, old_stack, "the stack was evacuated");

        let mut frame = Frame::new(new_stack);
        assert!(frame.move_previous());
        assert_eq!(
            frame.byte_code_pointer() as usize,
            function.bytecode_address_for(0) as usize,
            "bytecode pointers into the program heap are untouched"
        );
        assert!(
            frame.frame_pointer() >= new_stack.pointer(0) as usize
                && frame.frame_pointer()
                    < new_stack.pointer(new_stack.length()) as usize,
            "frame pointers were rebased into the evacuated stack"
        );
        assert!(
            process
                .store_buffer()
                .contains(new_stack.object()),
            "the evacuated stack stays tracked"
        );
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn dispatch_table_intrinsics_are_precomputed() {
        let mut program = Program::new(Flags::default());
        let get_field = program.create_function(
            1,
            &[Opcode::LoadField as u8, 0, Opcode::Return as u8],
            &[],
        );
        let plain =
            program.create_function(0, &[Opcode::Return as u8], &[]);
        let table = program
            .create_array(&[get_field.to_value(), plain.to_value()]);
        program.set_dispatch_table(table);
        program.setup_dispatch_table_intrinsics();
        assert_eq!(
            program.dispatch_table_intrinsic_at(0),
            IntrinsicsTable::get_default().get_field.unwrap()
        );
        assert_eq!(
            program.dispatch_table_intrinsic_at(1),
            1,
            "no intrinsic means the literal 1"
        );
    }

    #[test]
    fn statistics_walk_does_not_disturb_the_heap() {
        let mut program = Program::new(Flags::default());
        let _ = program.create_function(0, &[Opcode::Return as u8; 32], &[]);
        let used = program.heap().space().used();
        program.print_statistics();
        assert_eq!(program.heap().space().used(), used);
    }

    #[test]
    fn validation_passes_on_a_consistent_program() {
        let mut flags = Flags::default();
        flags.validate_heaps = true;
        let mut program = Program::new(flags);
        let process = spawn(&mut program);
        let array = process.new_array(3);
        process.set_exception(array);
        program.collect_garbage();
        program.validate_heaps_are_consistent();
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }
}

#[derive(Default)]
struct StatisticsVisitor {
    object_count: usize,
    class_count: usize,
    array_count: usize,
    array_size: usize,
    string_count: usize,
    function_count: usize,
    bytecode_size: usize,
}

impl HeapObjectVisitor for StatisticsVisitor {
    fn visit(&mut self, object: HeapObject) {
        self.object_count += 1;
        match object.kind() {
            InstanceKind::Class => self.class_count += 1,
            InstanceKind::Array => {
                self.array_count += 1;
                self.array_size += object.size_in_bytes();
            }
            InstanceKind::OneByteString | InstanceKind::TwoByteString => {
                self.string_count += 1
            }
            InstanceKind::Function => {
                self.function_count += 1;
                self.bytecode_size +=
                    Function::cast(object).bytecode_size();
            }
            _ => {}
        }
    }
}
