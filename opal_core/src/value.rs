//! Tagged one-word value representation.

use std::fmt;

/// A tagged machine word: either an immediate integer or a block pointer.
///
/// Immediates carry their payload shifted left by one with the low bit
/// set. Block pointers are word-aligned addresses of a block payload
/// (the word immediately after its [`crate::Header`]), so their low bit
/// is always clear.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(usize);

impl Value {
    /// The unit value (immediate zero).
    pub const UNIT: Value = Value::int(0);

    /// Create an immediate integer value.
    #[inline]
    pub const fn int(i: isize) -> Self {
        Value(((i as usize) << 1) | 1)
    }

    /// Extract the integer payload of an immediate.
    #[inline]
    pub const fn as_int(self) -> isize {
        (self.0 as isize) >> 1
    }

    /// Create a value from a block payload pointer.
    ///
    /// The pointer must be word-aligned; an unaligned pointer would be
    /// indistinguishable from an immediate.
    #[inline]
    pub fn from_ptr(ptr: *const ()) -> Self {
        debug_assert!(ptr as usize & 1 == 0, "block pointers must be aligned");
        Value(ptr as usize)
    }

    /// Interpret this value as a block payload pointer.
    #[inline]
    pub const fn as_ptr(self) -> *mut () {
        self.0 as *mut ()
    }

    /// Check whether this value is a block pointer (non-null, low bit clear).
    #[inline]
    pub const fn is_block(self) -> bool {
        self.0 != 0 && self.0 & 1 == 0
    }

    /// Check whether this value is an immediate integer.
    #[inline]
    pub const fn is_immediate(self) -> bool {
        self.0 & 1 == 1
    }

    /// Get the raw word.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Reconstruct a value from a raw word.
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Value(raw)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_immediate() {
            write!(f, "Value::int({})", self.as_int())
        } else {
            write!(f, "Value::ptr({:#x})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_round_trip() {
        assert_eq!(Value::int(42).as_int(), 42);
        assert_eq!(Value::int(-7).as_int(), -7);
        assert!(Value::int(0).is_immediate());
        assert!(!Value::int(0).is_block());
    }

    #[test]
    fn test_unit_is_immediate() {
        assert!(Value::UNIT.is_immediate());
        assert_eq!(Value::UNIT.as_int(), 0);
    }

    #[test]
    fn test_block_pointer() {
        let word: usize = 0;
        let v = Value::from_ptr(&word as *const usize as *const ());
        assert!(v.is_block());
        assert!(!v.is_immediate());
        assert_eq!(v.as_ptr() as usize, &word as *const usize as usize);
    }

    #[test]
    fn test_null_is_not_a_block() {
        assert!(!Value::from_raw(0).is_block());
    }
}
