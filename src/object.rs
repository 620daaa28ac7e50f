//! Heap object layouts and accessors.
//!
//! Every heap object starts with a class word: a tagged reference to its
//! class. During a copying collection the class word of a from-space object
//! is overwritten with a forwarding word (low bits `011`); during marking
//! the mark bit (bit 2) is set on it. The remaining layout is determined by
//! the instance kind recorded in the class.

use crate::bytecode::{IntrinsicsTable, Opcode};
use crate::frame;
use crate::space::{round_up_to_word, Space};
use crate::tagged::Value;
use crate::visitor::PointerVisitor;

pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

const MARK_BIT: usize = 0b100;
const FORWARD_TAG: usize = 0b011;
const LOW_BITS: usize = 0b111;

/// What the instances of a class look like.
#[repr(isize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstanceKind {
    Instance = 0,
    Class = 1,
    Array = 2,
    ByteArray = 3,
    OneByteString = 4,
    TwoByteString = 5,
    Double = 6,
    LargeInteger = 7,
    Boxed = 8,
    Function = 9,
    Stack = 10,
    Coroutine = 11,
}

impl InstanceKind {
    pub fn from_smi(value: isize) -> InstanceKind {
        match value {
            0 => InstanceKind::Instance,
            1 => InstanceKind::Class,
            2 => InstanceKind::Array,
            3 => InstanceKind::ByteArray,
            4 => InstanceKind::OneByteString,
            5 => InstanceKind::TwoByteString,
            6 => InstanceKind::Double,
            7 => InstanceKind::LargeInteger,
            8 => InstanceKind::Boxed,
            9 => InstanceKind::Function,
            10 => InstanceKind::Stack,
            11 => InstanceKind::Coroutine,
            other => panic!("not an instance kind: {other}"),
        }
    }
}

/// An untyped reference to a heap object: just its untagged address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct HeapObject {
    address: usize,
}

impl HeapObject {
    /// # Safety
    /// `address` must be the word-aligned start of a live heap object.
    #[inline]
    pub unsafe fn from_address(address: usize) -> HeapObject {
        debug_assert_eq!(address % WORD_SIZE, 0);
        HeapObject { address }
    }

    #[inline]
    pub fn from_value(value: Value) -> HeapObject {
        HeapObject { address: value.address() }
    }

    #[inline]
    pub fn to_value(self) -> Value {
        Value::from_address(self.address)
    }

    #[inline]
    pub fn address(self) -> usize {
        self.address
    }

    #[inline]
    fn word(self, index: usize) -> usize {
        // SAFETY: index is within the object by layout construction.
        unsafe { *((self.address + index * WORD_SIZE) as *const usize) }
    }

    #[inline]
    fn set_word(self, index: usize, word: usize) {
        // SAFETY: index is within the object by layout construction.
        unsafe { *((self.address + index * WORD_SIZE) as *mut usize) = word };
    }

    #[inline]
    pub fn value_at(self, index: usize) -> Value {
        Value::from_raw(self.word(index))
    }

    #[inline]
    pub fn set_value_at(self, index: usize, value: Value) {
        self.set_word(index, value.raw());
    }

    /// Raw pointer to a value slot, for visitors.
    #[inline]
    pub fn slot(self, index: usize) -> *mut Value {
        (self.address + index * WORD_SIZE) as *mut Value
    }

    pub fn class_of(self) -> Class {
        let word = self.word(0);
        debug_assert_ne!(word & LOW_BITS, FORWARD_TAG, "read through forwarding");
        // SAFETY: the class word always holds a class address.
        Class(unsafe { HeapObject::from_address(word & !LOW_BITS) })
    }

    pub fn set_class(self, class: Class) {
        self.set_value_at(0, class.to_value());
    }

    pub fn class_slot(self) -> *mut Value {
        self.slot(0)
    }

    pub fn kind(self) -> InstanceKind {
        self.class_of().instance_kind()
    }

    pub fn is_stack(self) -> bool {
        self.kind() == InstanceKind::Stack
    }

    // Mark bit, used by the mark-sweep collector. Lives in the class word.

    pub fn is_marked(self) -> bool {
        self.word(0) & MARK_BIT != 0
    }

    pub fn set_mark(self) {
        self.set_word(0, self.word(0) | MARK_BIT);
    }

    pub fn clear_mark(self) {
        self.set_word(0, self.word(0) & !MARK_BIT);
    }

    // Forwarding, used by the copying collectors. Valid only while a
    // collection is in progress.

    pub fn forwarding_address(self) -> Option<HeapObject> {
        let word = self.word(0);
        if word & LOW_BITS == FORWARD_TAG {
            // SAFETY: forwarding words hold to-space object addresses.
            Some(unsafe { HeapObject::from_address(word & !LOW_BITS) })
        } else {
            None
        }
    }

    pub fn set_forwarding_address(self, target: HeapObject) {
        self.set_word(0, target.address | FORWARD_TAG);
    }

    /// Copy this object into `to` and leave a forwarding address behind.
    /// Idempotent: an already forwarded object returns its copy. Moved
    /// stacks get their frame-pointer links rebased to the new location.
    pub fn clone_in_to_space(self, to: &mut Space) -> HeapObject {
        if let Some(target) = self.forwarding_address() {
            return target;
        }
        let size = self.size_in_bytes();
        let address = to.allocate(size);
        debug_assert_ne!(address, 0, "to-space allocation must not fail");
        // SAFETY: source and destination are live, non-overlapping regions
        // of `size` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.address as *const u8,
                address as *mut u8,
                size,
            );
        }
        // SAFETY: freshly initialized copy.
        let target = unsafe { HeapObject::from_address(address) };
        if target.kind() == InstanceKind::Stack {
            let delta = address as isize - self.address as isize;
            frame::rebase_frame_pointers(Stack::cast(target), delta);
        }
        self.set_forwarding_address(target);
        target
    }

    pub fn size_in_bytes(self) -> usize {
        let class = self.class_of();
        match class.instance_kind() {
            InstanceKind::Instance | InstanceKind::Coroutine => {
                (1 + class.number_of_instance_fields()) * WORD_SIZE
            }
            InstanceKind::Class => Class::SIZE_WORDS * WORD_SIZE,
            InstanceKind::Array => {
                let length = self.value_at(Array::LENGTH_INDEX).as_smi();
                (Array::HEADER_WORDS + length as usize) * WORD_SIZE
            }
            InstanceKind::ByteArray | InstanceKind::OneByteString => {
                let length = self.value_at(ByteArray::LENGTH_INDEX).as_smi();
                ByteArray::HEADER_WORDS * WORD_SIZE
                    + round_up_to_word(length as usize)
            }
            InstanceKind::TwoByteString => {
                let length = self.value_at(ByteArray::LENGTH_INDEX).as_smi();
                TwoByteString::HEADER_WORDS * WORD_SIZE
                    + round_up_to_word(length as usize * 2)
            }
            InstanceKind::Double | InstanceKind::LargeInteger
            | InstanceKind::Boxed => 2 * WORD_SIZE,
            InstanceKind::Function => {
                let size = self.value_at(Function::BYTECODE_SIZE_INDEX).as_smi();
                Function::HEADER_WORDS * WORD_SIZE
                    + round_up_to_word(size as usize)
            }
            InstanceKind::Stack => {
                let length = self.value_at(Stack::LENGTH_INDEX).as_smi();
                (Stack::HEADER_WORDS + length as usize) * WORD_SIZE
            }
        }
    }

    /// Visit every pointer slot of this object, class word included.
    pub fn iterate_pointers(self, visitor: &mut dyn PointerVisitor) {
        let class = self.class_of();
        visitor.visit_class(self.class_slot());
        match class.instance_kind() {
            InstanceKind::Instance | InstanceKind::Coroutine => {
                let fields = class.number_of_instance_fields();
                visitor.visit_block(self.slot(1), self.slot(1 + fields));
            }
            InstanceKind::Array => {
                let length = Array::cast(self).length();
                visitor.visit_block(
                    self.slot(Array::HEADER_WORDS),
                    self.slot(Array::HEADER_WORDS + length),
                );
            }
            InstanceKind::Boxed => visitor.visit(self.slot(1)),
            InstanceKind::Class => {
                // Methods and super class are adjacent.
                visitor.visit_block(
                    self.slot(Class::METHODS_INDEX),
                    self.slot(Class::SUPER_INDEX + 1),
                );
            }
            InstanceKind::Function => {
                visitor.visit(self.slot(Function::LITERALS_INDEX))
            }
            InstanceKind::Stack => {
                // The live slots are visited as one block. Frame-pointer
                // links are word aligned and therefore read as smis; raw
                // bytecode pointers never land in a collected space while
                // uncooked, and cooked ones are real function references
                // that must be relocated like any other slot.
                let stack = Stack::cast(self);
                visitor.visit(self.slot(Stack::NEXT_INDEX));
                visitor.visit_block(
                    stack.pointer(stack.top()),
                    stack.pointer(stack.length()),
                );
            }
            InstanceKind::ByteArray
            | InstanceKind::OneByteString
            | InstanceKind::TwoByteString
            | InstanceKind::Double
            | InstanceKind::LargeInteger => {}
        }
    }
}

macro_rules! typed_object {
    ($name:ident, $kind:ident) => {
        #[derive(Copy, Clone, PartialEq, Eq, Debug)]
        pub struct $name(HeapObject);

        impl $name {
            pub fn cast(object: HeapObject) -> $name {
                debug_assert_eq!(object.kind(), InstanceKind::$kind);
                $name(object)
            }

            pub fn from_value(value: Value) -> $name {
                $name::cast(HeapObject::from_value(value))
            }

            pub fn object(self) -> HeapObject {
                self.0
            }

            pub fn to_value(self) -> Value {
                self.0.to_value()
            }

            pub fn address(self) -> usize {
                self.0.address()
            }
        }

        impl std::ops::Deref for $name {
            type Target = HeapObject;
            fn deref(&self) -> &HeapObject {
                &self.0
            }
        }
    };
}

typed_object!(Class, Class);
typed_object!(Array, Array);
typed_object!(ByteArray, ByteArray);
typed_object!(OneByteString, OneByteString);
typed_object!(TwoByteString, TwoByteString);
typed_object!(Double, Double);
typed_object!(LargeInteger, LargeInteger);
typed_object!(Boxed, Boxed);
typed_object!(Instance, Instance);
typed_object!(Function, Function);
typed_object!(Stack, Stack);
typed_object!(Coroutine, Coroutine);

impl Class {
    pub const KIND_INDEX: usize = 1;
    pub const FIELDS_INDEX: usize = 2;
    pub const METHODS_INDEX: usize = 3;
    pub const SUPER_INDEX: usize = 4;
    pub const SIZE_WORDS: usize = 5;

    pub fn instance_kind(self) -> InstanceKind {
        InstanceKind::from_smi(self.value_at(Self::KIND_INDEX).as_smi())
    }

    pub fn number_of_instance_fields(self) -> usize {
        self.value_at(Self::FIELDS_INDEX).as_smi() as usize
    }

    pub fn methods(self) -> Option<Array> {
        let value = self.value_at(Self::METHODS_INDEX);
        value.is_heap_object().then(|| Array::from_value(value))
    }

    pub fn set_methods(self, methods: Array) {
        self.set_value_at(Self::METHODS_INDEX, methods.to_value());
    }

    pub fn super_class(self) -> Option<Class> {
        let value = self.value_at(Self::SUPER_INDEX);
        value.is_heap_object().then(|| Class::from_value(value))
    }

    pub fn set_super_class(self, super_class: Class) {
        self.set_value_at(Self::SUPER_INDEX, super_class.to_value());
    }

    /// Resolve a selector against the method table, walking up the super
    /// chain. The table holds `(selector, function)` pairs.
    pub fn lookup_method(self, selector: usize) -> Option<Function> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(methods) = class.methods() {
                let mut index = 0;
                while index + 1 < methods.length() {
                    if methods.get(index).as_smi() as usize == selector {
                        return Some(Function::from_value(
                            methods.get(index + 1),
                        ));
                    }
                    index += 2;
                }
            }
            current = class.super_class();
        }
        None
    }
}

impl Array {
    pub const LENGTH_INDEX: usize = 1;
    pub const HEADER_WORDS: usize = 2;

    pub fn length(self) -> usize {
        self.value_at(Self::LENGTH_INDEX).as_smi() as usize
    }

    pub fn get(self, index: usize) -> Value {
        debug_assert!(index < self.length());
        self.value_at(Self::HEADER_WORDS + index)
    }

    pub fn set(self, index: usize, value: Value) {
        debug_assert!(index < self.length());
        self.set_value_at(Self::HEADER_WORDS + index, value);
    }
}

impl ByteArray {
    pub const LENGTH_INDEX: usize = 1;
    pub const HEADER_WORDS: usize = 2;

    pub fn length(self) -> usize {
        self.value_at(Self::LENGTH_INDEX).as_smi() as usize
    }

    fn data(self) -> *mut u8 {
        (self.address() + Self::HEADER_WORDS * WORD_SIZE) as *mut u8
    }

    pub fn get(self, index: usize) -> u8 {
        debug_assert!(index < self.length());
        // SAFETY: bounds asserted against the stored length.
        unsafe { *self.data().add(index) }
    }

    pub fn set(self, index: usize, byte: u8) {
        debug_assert!(index < self.length());
        // SAFETY: bounds asserted against the stored length.
        unsafe { *self.data().add(index) = byte };
    }
}

impl OneByteString {
    pub fn length(self) -> usize {
        self.value_at(ByteArray::LENGTH_INDEX).as_smi() as usize
    }

    pub fn set_char_code(self, index: usize, code: u8) {
        debug_assert!(index < self.length());
        // SAFETY: bounds asserted against the stored length.
        unsafe {
            *((self.address() + ByteArray::HEADER_WORDS * WORD_SIZE)
                as *mut u8)
                .add(index) = code
        };
    }

    pub fn char_code(self, index: usize) -> u8 {
        debug_assert!(index < self.length());
        // SAFETY: bounds asserted against the stored length.
        unsafe {
            *((self.address() + ByteArray::HEADER_WORDS * WORD_SIZE)
                as *const u8)
                .add(index)
        }
    }
}

impl TwoByteString {
    pub const HEADER_WORDS: usize = 2;

    pub fn length(self) -> usize {
        self.value_at(ByteArray::LENGTH_INDEX).as_smi() as usize
    }

    pub fn set_code_unit(self, index: usize, unit: u16) {
        debug_assert!(index < self.length());
        // SAFETY: bounds asserted against the stored length.
        unsafe {
            *((self.address() + Self::HEADER_WORDS * WORD_SIZE) as *mut u16)
                .add(index) = unit
        };
    }

    pub fn code_unit(self, index: usize) -> u16 {
        debug_assert!(index < self.length());
        // SAFETY: bounds asserted against the stored length.
        unsafe {
            *((self.address() + Self::HEADER_WORDS * WORD_SIZE) as *const u16)
                .add(index)
        }
    }
}

impl Double {
    pub fn value(self) -> f64 {
        f64::from_bits(self.word(1) as u64)
    }

    pub fn set_value(self, value: f64) {
        self.set_word(1, value.to_bits() as usize);
    }
}

impl LargeInteger {
    pub fn value(self) -> i64 {
        self.word(1) as i64
    }

    pub fn set_value(self, value: i64) {
        self.set_word(1, value as usize);
    }
}

impl Boxed {
    pub fn value(self) -> Value {
        self.value_at(1)
    }

    pub fn set_value(self, value: Value) {
        self.set_value_at(1, value);
    }
}

impl Instance {
    pub fn get_instance_field(self, index: usize) -> Value {
        debug_assert!(index < self.class_of().number_of_instance_fields());
        self.value_at(1 + index)
    }

    pub fn set_instance_field(self, index: usize, value: Value) {
        debug_assert!(index < self.class_of().number_of_instance_fields());
        self.set_value_at(1 + index, value);
    }

    /// Store a machine word as two consecutive smi fields, low half first.
    pub fn set_consecutive_smis(self, index: usize, word: usize) {
        self.set_instance_field(index, Value::from_smi((word & 0xFFFF_FFFF) as isize));
        self.set_instance_field(index + 1, Value::from_smi((word >> 32) as isize));
    }

    pub fn get_consecutive_smis(self, index: usize) -> usize {
        let low = self.get_instance_field(index).as_smi() as usize;
        let high = self.get_instance_field(index + 1).as_smi() as usize;
        (high << 32) | low
    }
}

impl Function {
    pub const ARITY_INDEX: usize = 1;
    pub const BYTECODE_SIZE_INDEX: usize = 2;
    pub const LITERALS_INDEX: usize = 3;
    pub const HEADER_WORDS: usize = 4;

    pub fn arity(self) -> usize {
        self.value_at(Self::ARITY_INDEX).as_smi() as usize
    }

    pub fn bytecode_size(self) -> usize {
        self.value_at(Self::BYTECODE_SIZE_INDEX).as_smi() as usize
    }

    pub fn literals(self) -> Option<Array> {
        let value = self.value_at(Self::LITERALS_INDEX);
        value.is_heap_object().then(|| Array::from_value(value))
    }

    pub fn bytecode_address_for(self, index: usize) -> *mut u8 {
        debug_assert!(index <= self.bytecode_size());
        (self.address() + Self::HEADER_WORDS * WORD_SIZE + index) as *mut u8
    }

    /// Recover the owning function from a raw bytecode pointer by scanning
    /// backward for the function header. The header is recognized by its
    /// reference-tagged class word naming a function class, cross-checked
    /// by the recorded bytecode size bracketing `bcp`.
    pub fn from_bytecode_pointer(bcp: *const u8) -> Function {
        let bcp = bcp as usize;
        let mut scan = bcp & !(WORD_SIZE - 1);
        loop {
            // SAFETY: the pointer lies inside a function's bytecode, so
            // the scan stays within the function's chunk until it finds
            // the header.
            let word = unsafe { *(scan as *const usize) };
            if word & LOW_BITS == 0b001 {
                // SAFETY: candidate class word; validated below.
                let candidate = unsafe { HeapObject::from_address(scan) };
                let class =
                    unsafe { HeapObject::from_address(word & !LOW_BITS) };
                let kind_word = class.value_at(Class::KIND_INDEX);
                if kind_word.is_smi()
                    && kind_word.as_smi() == InstanceKind::Function as isize
                {
                    let function = Function(candidate);
                    let start =
                        function.bytecode_address_for(0) as usize;
                    if bcp >= start && bcp < start + function.bytecode_size() {
                        return function;
                    }
                }
            }
            scan -= WORD_SIZE;
        }
    }

    /// The literal referenced by an unfold-variant invoke at `bcp`:
    /// a pc-relative offset follows the opcode.
    pub fn constant_for_bytecode(bcp: *const u8) -> Value {
        // SAFETY: unfold variants carry a 4-byte offset after the opcode.
        let offset = unsafe {
            i32::from_le_bytes(*(bcp.add(1) as *const [u8; 4]))
        };
        // SAFETY: the offset points at a word-aligned literal slot inside
        // the function.
        unsafe { *(bcp.offset(offset as isize) as *const Value) }
    }

    /// The intrinsic implementing this function, determined from its
    /// bytecode prologue.
    pub fn compute_intrinsic(self, table: &IntrinsicsTable) -> Option<usize> {
        if self.bytecode_size() == 0 {
            return None;
        }
        // SAFETY: functions always have at least one bytecode when nonzero.
        let opcode = unsafe { *self.bytecode_address_for(0) };
        match Opcode::from_byte(opcode) {
            Some(Opcode::LoadField) => table.get_field,
            Some(Opcode::StoreField) => table.set_field,
            Some(Opcode::IdenticalNonNumeric) => table.object_equals,
            _ => None,
        }
    }
}

impl Stack {
    pub const LENGTH_INDEX: usize = 1;
    pub const TOP_INDEX: usize = 2;
    pub const NEXT_INDEX: usize = 3;
    pub const HEADER_WORDS: usize = 4;

    pub fn length(self) -> usize {
        self.value_at(Self::LENGTH_INDEX).as_smi() as usize
    }

    pub fn top(self) -> usize {
        self.value_at(Self::TOP_INDEX).as_smi() as usize
    }

    pub fn set_top(self, top: usize) {
        debug_assert!(top <= self.length());
        self.set_value_at(Self::TOP_INDEX, Value::from_smi(top as isize));
    }

    /// Next stack in the chain built during collections; the smi zero
    /// outside them.
    pub fn next(self) -> Value {
        self.value_at(Self::NEXT_INDEX)
    }

    pub fn set_next(self, next: Value) {
        self.set_value_at(Self::NEXT_INDEX, next);
    }

    pub fn get(self, index: usize) -> Value {
        debug_assert!(index < self.length());
        self.value_at(Self::HEADER_WORDS + index)
    }

    pub fn set(self, index: usize, value: Value) {
        debug_assert!(index < self.length());
        self.set_value_at(Self::HEADER_WORDS + index, value);
    }

    /// Address of slot `index`, the word the interpreter's sp/fp registers
    /// point at.
    pub fn pointer(self, index: usize) -> *mut Value {
        debug_assert!(index <= self.length());
        self.slot(Self::HEADER_WORDS + index)
    }

    pub fn index_of_pointer(self, pointer: usize) -> usize {
        let base = self.pointer(0) as usize;
        debug_assert!(pointer >= base && pointer % WORD_SIZE == 0);
        (pointer - base) / WORD_SIZE
    }

    pub fn set_top_from_pointer(self, pointer: *mut Value) {
        self.set_top(self.index_of_pointer(pointer as usize));
    }

    /// Raw slot read, for frame pointers and bytecode pointers that are
    /// not tagged values.
    pub fn word_at(self, index: usize) -> usize {
        debug_assert!(index < self.length());
        self.word(Self::HEADER_WORDS + index)
    }

    pub fn set_word_at(self, index: usize, word: usize) {
        debug_assert!(index < self.length());
        self.set_word(Self::HEADER_WORDS + index, word);
    }
}

impl Coroutine {
    pub const STACK_FIELD: usize = 0;
    pub const CALLER_FIELD: usize = 1;
    pub const NUMBER_OF_FIELDS: usize = 2;

    fn as_instance(self) -> Instance {
        // A coroutine is laid out exactly like a two-field instance.
        Instance(self.0)
    }

    pub fn has_stack(self) -> bool {
        self.as_instance()
            .get_instance_field(Self::STACK_FIELD)
            .is_heap_object()
    }

    pub fn stack(self) -> Stack {
        Stack::from_value(
            self.as_instance().get_instance_field(Self::STACK_FIELD),
        )
    }

    pub fn set_stack(self, stack: Stack) {
        self.as_instance()
            .set_instance_field(Self::STACK_FIELD, stack.to_value());
    }

    /// The slot holding the stack, visited first during chaining
    /// collections.
    pub fn stack_slot(self) -> *mut Value {
        self.slot(1 + Self::STACK_FIELD)
    }

    pub fn caller(self) -> Value {
        self.as_instance().get_instance_field(Self::CALLER_FIELD)
    }

    pub fn set_caller(self, caller: Value) {
        self.as_instance().set_instance_field(Self::CALLER_FIELD, caller);
    }
}
