//! The opcode classifier the runtime core consumes: enough shape
//! information about the instruction set to size frames, step in the
//! debugger and classify invokes, without prescribing the interpreter.

use std::sync::OnceLock;

/// Slots every bytecode may use beyond the operand stack; the stack limit
/// reserves this many words plus a return address and a scratch slot.
pub const GUARANTEED_FRAME_SIZE: usize = 32;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    LoadLocal0 = 0,
    LoadLocal1,
    LoadLocal2,
    LoadLocal,
    LoadBoxed,
    LoadStatic,
    LoadField,
    StoreLocal,
    StoreBoxed,
    StoreStatic,
    StoreField,
    LoadLiteralNull,
    LoadLiteralTrue,
    LoadLiteralFalse,
    LoadLiteral0,
    LoadLiteral1,
    LoadLiteral,
    LoadLiteralWide,
    InvokeMethod,
    InvokeMethodUnfold,
    InvokeStatic,
    InvokeStaticUnfold,
    InvokeFactory,
    InvokeFactoryUnfold,
    InvokeNoSuchMethod,
    IdenticalNonNumeric,
    Pop,
    Drop,
    Return,
    BranchWide,
    Throw,
    ProcessYield,
}

const NUMBER_OF_OPCODES: u8 = Opcode::ProcessYield as u8 + 1;

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        // SAFETY: the enum is a dense repr(u8) range checked just above.
        (byte < NUMBER_OF_OPCODES)
            .then(|| unsafe { std::mem::transmute::<u8, Opcode>(byte) })
    }

    /// Encoded size of the instruction in bytes, opcode included.
    pub fn size(self) -> usize {
        match self {
            Opcode::LoadLocal
            | Opcode::StoreLocal
            | Opcode::LoadBoxed
            | Opcode::StoreBoxed
            | Opcode::LoadField
            | Opcode::StoreField
            | Opcode::Drop => 2,
            Opcode::LoadStatic
            | Opcode::StoreStatic
            | Opcode::LoadLiteral
            | Opcode::LoadLiteralWide
            | Opcode::InvokeMethod
            | Opcode::InvokeMethodUnfold
            | Opcode::InvokeStatic
            | Opcode::InvokeStaticUnfold
            | Opcode::InvokeFactory
            | Opcode::InvokeFactoryUnfold
            | Opcode::InvokeNoSuchMethod
            | Opcode::BranchWide => 5,
            _ => 1,
        }
    }

    /// Net operand-stack effect for instructions where it is static.
    /// Invoke variants report the effect of the pushed result; the
    /// argument pop depends on the callee and is computed by callers that
    /// care (debug stepping).
    pub fn stack_diff(self) -> isize {
        match self {
            Opcode::LoadLocal0
            | Opcode::LoadLocal1
            | Opcode::LoadLocal2
            | Opcode::LoadLocal
            | Opcode::LoadBoxed
            | Opcode::LoadStatic
            | Opcode::LoadLiteralNull
            | Opcode::LoadLiteralTrue
            | Opcode::LoadLiteralFalse
            | Opcode::LoadLiteral0
            | Opcode::LoadLiteral1
            | Opcode::LoadLiteral
            | Opcode::LoadLiteralWide => 1,
            Opcode::LoadField | Opcode::StoreField => 0,
            Opcode::StoreLocal | Opcode::StoreBoxed | Opcode::StoreStatic => 0,
            Opcode::InvokeMethod
            | Opcode::InvokeMethodUnfold
            | Opcode::InvokeStatic
            | Opcode::InvokeStaticUnfold
            | Opcode::InvokeFactory
            | Opcode::InvokeFactoryUnfold
            | Opcode::InvokeNoSuchMethod => 1,
            Opcode::IdenticalNonNumeric => -1,
            Opcode::Pop | Opcode::Throw => -1,
            Opcode::Drop => 0,
            Opcode::Return | Opcode::BranchWide | Opcode::ProcessYield => 0,
        }
    }

    pub fn is_invoke_variant(self) -> bool {
        matches!(
            self,
            Opcode::InvokeMethod
                | Opcode::InvokeMethodUnfold
                | Opcode::InvokeStatic
                | Opcode::InvokeStaticUnfold
                | Opcode::InvokeFactory
                | Opcode::InvokeFactoryUnfold
                | Opcode::InvokeNoSuchMethod
        )
    }

    pub fn is_unfold_variant(self) -> bool {
        matches!(
            self,
            Opcode::InvokeMethodUnfold
                | Opcode::InvokeStaticUnfold
                | Opcode::InvokeFactoryUnfold
        )
    }
}

/// Read the 32-bit operand following an opcode.
///
/// # Safety
/// `bcp` must point at an instruction with a 4-byte operand.
pub unsafe fn read_int32_operand(bcp: *const u8) -> i32 {
    // SAFETY: by contract four operand bytes follow the opcode.
    unsafe { i32::from_le_bytes(*(bcp.add(1) as *const [u8; 4])) }
}

/// Method selectors pack the argument count so dispatch can check arity
/// without loading the target.
#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SelectorKind {
    Method = 0,
    Getter = 1,
    Setter = 2,
}

pub struct Selector;

impl Selector {
    const ARITY_BITS: usize = 8;
    const KIND_BITS: usize = 2;
    const KIND_SHIFT: usize = Self::ARITY_BITS;
    const ID_SHIFT: usize = Self::ARITY_BITS + Self::KIND_BITS;

    pub fn encode(id: usize, kind: SelectorKind, arity: usize) -> usize {
        debug_assert!(arity < 1 << Self::ARITY_BITS);
        id << Self::ID_SHIFT | (kind as usize) << Self::KIND_SHIFT | arity
    }

    pub fn decode_arity(selector: usize) -> usize {
        selector & ((1 << Self::ARITY_BITS) - 1)
    }

    pub fn decode_id(selector: usize) -> usize {
        selector >> Self::ID_SHIFT
    }
}

/// Well-known selector ids.
pub mod names {
    pub const NO_SUCH_METHOD_TRAMPOLINE: usize = 0;
    pub const CALL: usize = 1;
}

/// Addresses of the intrinsic implementations; all nonzero, since a zero
/// tag marks an empty lookup-cache slot.
pub struct IntrinsicsTable {
    pub get_field: Option<usize>,
    pub set_field: Option<usize>,
    pub object_equals: Option<usize>,
}

fn intrinsic_get_field() {}
fn intrinsic_set_field() {}
fn intrinsic_object_equals() {}

impl IntrinsicsTable {
    pub fn get_default() -> &'static IntrinsicsTable {
        static TABLE: OnceLock<IntrinsicsTable> = OnceLock::new();
        TABLE.get_or_init(|| IntrinsicsTable {
            get_field: Some(intrinsic_get_field as usize),
            set_field: Some(intrinsic_set_field as usize),
            object_equals: Some(intrinsic_object_equals as usize),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_byte_roundtrip() {
        for byte in 0..NUMBER_OF_OPCODES {
            let opcode = Opcode::from_byte(byte).expect("valid opcode");
            assert_eq!(opcode as u8, byte);
        }
        assert_eq!(Opcode::from_byte(NUMBER_OF_OPCODES), None);
        assert_eq!(Opcode::from_byte(0xFF), None);
    }

    #[test]
    fn invoke_variants_are_classified() {
        assert!(Opcode::InvokeMethod.is_invoke_variant());
        assert!(Opcode::InvokeStaticUnfold.is_invoke_variant());
        assert!(!Opcode::LoadLocal.is_invoke_variant());
        assert!(Opcode::InvokeFactoryUnfold.is_unfold_variant());
        assert!(!Opcode::InvokeFactory.is_unfold_variant());
    }

    #[test]
    fn invoke_instructions_carry_a_wide_operand() {
        assert_eq!(Opcode::InvokeMethod.size(), 5);
        assert_eq!(Opcode::LoadLocal.size(), 2);
        assert_eq!(Opcode::Return.size(), 1);
    }

    #[test]
    fn selector_encoding_packs_arity_in_the_low_bits() {
        let selector = Selector::encode(99, SelectorKind::Method, 2);
        assert_eq!(Selector::decode_arity(selector), 2);
        assert_eq!(Selector::decode_id(selector), 99);
        let nullary = Selector::encode(99, SelectorKind::Method, 0);
        assert_ne!(selector, nullary);
        assert_eq!(Selector::decode_arity(nullary), 0);
    }

    #[test]
    fn default_intrinsics_are_nonzero() {
        let table = IntrinsicsTable::get_default();
        assert_ne!(table.get_field, Some(0));
        assert_ne!(table.set_field, Some(0));
        assert_ne!(table.object_equals, Some(0));
        assert!(table.get_field.is_some());
    }
}
