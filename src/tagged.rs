//! Value: one machine word, tagged.
//!
//! Smis (small integers) carry their payload in-line with a zero low bit.
//! Heap references carry a word-aligned address with the low bits `01`.
//! Failure sentinels are immediates with the low bits `11`; they are what
//! allocators return instead of an object and are never stored in the heap.

use std::fmt;

#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueTag {
    Smi = 0b00,
    Reference = 0b01,
    Failure = 0b11,
}

pub const TAG_MASK: usize = 0b11;
pub const REFERENCE_MASK: usize = 0b111;

/// A tagged machine word. The only representation of a managed value the
/// runtime ever passes around.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(usize);

impl Value {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// The smi zero, also used as the null link in chained stacks.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    pub fn from_smi(value: isize) -> Self {
        debug_assert!(Self::smi_is_valid(value as i64));
        Self((value << 1) as usize)
    }

    #[inline]
    pub fn as_smi(self) -> isize {
        debug_assert!(self.is_smi());
        (self.0 as isize) >> 1
    }

    /// A value fits in a smi if it survives the one-bit tag shift.
    #[inline]
    pub fn smi_is_valid(value: i64) -> bool {
        let word = value as isize;
        ((word << 1) >> 1) == word && word as i64 == value
    }

    #[inline]
    pub fn is_smi(self) -> bool {
        self.0 & 0b1 == ValueTag::Smi as usize
    }

    #[inline]
    pub fn is_heap_object(self) -> bool {
        self.0 & TAG_MASK == ValueTag::Reference as usize
    }

    #[inline]
    pub fn is_failure(self) -> bool {
        self.0 & TAG_MASK == ValueTag::Failure as usize
    }

    #[inline]
    pub fn from_address(address: usize) -> Self {
        debug_assert_eq!(
            address & TAG_MASK,
            0,
            "heap objects must be word aligned so the low bits are free"
        );
        Self(address | ValueTag::Reference as usize)
    }

    /// The untagged address of a heap reference.
    #[inline]
    pub fn address(self) -> usize {
        debug_assert!(self.is_heap_object());
        self.0 & !REFERENCE_MASK
    }
}

/// Allocator failure sentinels. Distinct from language-level exceptions:
/// a failure propagates no further than the first mutator action that can
/// retry it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
pub enum FailureKind {
    RetryAfterGc = 0,
    WrongArgumentType = 1,
    IndexOutOfBounds = 2,
    IllegalState = 3,
}

pub struct Failure;

impl Failure {
    const KIND_SHIFT: usize = 2;

    #[inline]
    const fn create(kind: FailureKind) -> Value {
        Value::from_raw((kind as usize) << Self::KIND_SHIFT | ValueTag::Failure as usize)
    }

    #[inline]
    pub const fn retry_after_gc() -> Value {
        Self::create(FailureKind::RetryAfterGc)
    }

    #[inline]
    pub const fn wrong_argument_type() -> Value {
        Self::create(FailureKind::WrongArgumentType)
    }

    #[inline]
    pub const fn index_out_of_bounds() -> Value {
        Self::create(FailureKind::IndexOutOfBounds)
    }

    #[inline]
    pub const fn illegal_state() -> Value {
        Self::create(FailureKind::IllegalState)
    }

    pub fn kind(value: Value) -> FailureKind {
        assert!(value.is_failure());
        match value.raw() >> Self::KIND_SHIFT {
            0 => FailureKind::RetryAfterGc,
            1 => FailureKind::WrongArgumentType,
            2 => FailureKind::IndexOutOfBounds,
            3 => FailureKind::IllegalState,
            other => panic!("not a failure payload: {other}"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_smi() {
            write!(f, "Smi({})", self.as_smi())
        } else if self.is_heap_object() {
            write!(f, "HeapObject({:#x})", self.address())
        } else {
            write!(f, "Failure({:?})", Failure::kind(*self))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smi_roundtrip_preserves_value_and_tag() {
        for value in [0isize, 1, -1, 42, -42, 1 << 40, -(1 << 40)] {
            let v = Value::from_smi(value);
            assert!(v.is_smi(), "expected smi for {value}");
            assert!(!v.is_heap_object());
            assert!(!v.is_failure());
            assert_eq!(v.as_smi(), value);
        }
    }

    #[test]
    fn smi_validity_rejects_values_that_lose_the_top_bit() {
        assert!(Value::smi_is_valid(0));
        assert!(Value::smi_is_valid(isize::MAX as i64 >> 1));
        assert!(Value::smi_is_valid(isize::MIN as i64 >> 1));
        assert!(!Value::smi_is_valid(isize::MAX as i64));
        assert!(!Value::smi_is_valid(isize::MIN as i64));
    }

    #[test]
    fn reference_tagging_recovers_the_address() {
        let buffer = Box::new([0usize; 4]);
        let address = Box::as_ref(&buffer) as *const _ as usize;
        let v = Value::from_address(address);
        assert!(v.is_heap_object());
        assert!(!v.is_smi());
        assert_eq!(v.address(), address);
    }

    #[test]
    fn failure_sentinels_are_distinct_immediates() {
        let all = [
            Failure::retry_after_gc(),
            Failure::wrong_argument_type(),
            Failure::index_out_of_bounds(),
            Failure::illegal_state(),
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.is_failure());
            assert!(!a.is_smi());
            assert!(!a.is_heap_object());
            for (j, b) in all.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
        assert_eq!(
            Failure::kind(Failure::retry_after_gc()),
            FailureKind::RetryAfterGc
        );
        assert_eq!(
            Failure::kind(Failure::illegal_state()),
            FailureKind::IllegalState
        );
    }

    #[test]
    fn zero_is_the_smi_zero() {
        assert!(Value::zero().is_smi());
        assert_eq!(Value::zero().as_smi(), 0);
    }
}
