//! Tagged value representation.
//!
//! Every script value is a single immutable machine word. Numbers are stored
//! as the IEEE-754 float itself; every other type is packed into the payload
//! bits of a signalling-NaN pattern, with a 4-bit type tag and an offset or
//! small-integer payload. This keeps every value the same width without a
//! separate tagged union: the float encoding round-trips exactly, so
//! arithmetic on `Number` values never touches the tagging logic at all.
//!
//! The word width is chosen at build time: 64-bit by default, or 32-bit with
//! the `word32` feature. Both layouts mirror each other; only the constants
//! (payload width, `CodeRef` field widths) differ.

use std::fmt;

/// Arena offset. Always 32 bits regardless of value word width — buffers
/// target microcontroller-class RAM, never more than 4 GiB.
pub type Offset = u32;

#[cfg(not(feature = "word32"))]
mod word {
    pub type Word = u64;
    pub type Float = f64;

    /// Bits above the 48-bit payload mark the NaN pattern plus the 4-bit tag.
    const NAN_PREFIX: Word = 0x7ff0 << 48;
    const TAG_SHIFT: u32 = 48;
    const TAG_MASK: Word = 0xf << TAG_SHIFT;
    const PAYLOAD_MASK: Word = !(0x7fffu64 << 48);

    pub const CODEREF_OFFSET_BITS: u32 = 24;
    pub const CODEREF_LEN_BITS: u32 = 24;

    #[inline]
    pub fn to_float(v: Word) -> Float {
        Float::from_bits(v)
    }

    #[inline]
    pub fn from_float(f: Float) -> Word {
        f.to_bits()
    }

    #[inline]
    pub fn mkval(tag: u8, payload: Word) -> Word {
        NAN_PREFIX | ((tag as Word) << TAG_SHIFT) | (payload & PAYLOAD_MASK)
    }

    #[inline]
    pub fn is_nan_boxed(v: Word) -> bool {
        (v >> 52) == 0x7ff
    }

    #[inline]
    pub fn tag(v: Word) -> u8 {
        ((v & TAG_MASK) >> TAG_SHIFT) as u8
    }

    #[inline]
    pub fn payload(v: Word) -> Word {
        v & PAYLOAD_MASK
    }
}

#[cfg(feature = "word32")]
mod word {
    pub type Word = u32;
    pub type Float = f32;

    const NAN_PREFIX: Word = 0xff80_0000;
    const TAG_SHIFT: u32 = 19;
    const TAG_MASK: Word = 0xf << TAG_SHIFT;
    const PAYLOAD_MASK: Word = !0xfff8_0000u32;

    pub const CODEREF_OFFSET_BITS: u32 = 12;
    pub const CODEREF_LEN_BITS: u32 = 7;

    #[inline]
    pub fn to_float(v: Word) -> Float {
        Float::from_bits(v)
    }

    #[inline]
    pub fn from_float(f: Float) -> Word {
        f.to_bits()
    }

    #[inline]
    pub fn mkval(tag: u8, payload: Word) -> Word {
        NAN_PREFIX | ((tag as Word) << TAG_SHIFT) | (payload & PAYLOAD_MASK)
    }

    #[inline]
    pub fn is_nan_boxed(v: Word) -> bool {
        (v >> 23) == 0x1ff
    }

    #[inline]
    pub fn tag(v: Word) -> u8 {
        ((v & TAG_MASK) >> TAG_SHIFT) as u8
    }

    #[inline]
    pub fn payload(v: Word) -> Word {
        v & PAYLOAD_MASK
    }
}

pub use word::{Float, Word};

/// Type discriminant. Numeric values of `Object`, `Property`, and `String`
/// are load-bearing: they must equal the 2-bit entity tag used in the arena
/// (see [`crate::arena`]), so the GC can recover an entity's kind from a
/// value word alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Type {
    Object = 0,
    Property = 1,
    Str = 2,
    Undefined = 3,
    Null = 4,
    Number = 5,
    Boolean = 6,
    Function = 7,
    CodeRef = 8,
    Error = 9,
}

impl Type {
    const fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::Object,
            1 => Self::Property,
            2 => Self::Str,
            3 => Self::Undefined,
            4 => Self::Null,
            6 => Self::Boolean,
            7 => Self::Function,
            8 => Self::CodeRef,
            9 => Self::Error,
            _ => Self::Undefined,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Object => "object",
            Self::Str => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Function => "function",
            Self::Property => "prop",
            Self::CodeRef => "coderef",
            Self::Error => "nan",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single script value: one immutable machine word.
///
/// Cheap to copy, cheap to compare bit-for-bit. Offset-bearing variants
/// (`Object`, `Str`, `Function`, `Property`) carry an [`Offset`] into the
/// arena; the GC rewrites that offset in place during compaction, so a
/// `Value` must never be held across a call that can trigger collection
/// without re-reading it from its root (scope, property, or pinned
/// descriptor).
#[derive(Clone, Copy, PartialEq)]
pub struct Value(pub(crate) Word);

impl Value {
    #[inline]
    #[must_use]
    pub fn value_type(self) -> Type {
        if word::is_nan_boxed(self.0) {
            Type::from_tag(word::tag(self.0))
        } else {
            Type::Number
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn raw(self) -> Word {
        self.0
    }

    #[inline]
    pub(crate) fn from_raw(raw: Word) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) fn mk(tag: Type, payload: Word) -> Self {
        Self(word::mkval(tag as u8, payload))
    }

    #[inline]
    pub(crate) fn payload(self) -> Word {
        word::payload(self.0)
    }

    #[must_use]
    pub fn undefined() -> Self {
        Self::mk(Type::Undefined, 0)
    }

    #[must_use]
    pub fn null() -> Self {
        Self::mk(Type::Null, 0)
    }

    #[must_use]
    pub fn boolean(b: bool) -> Self {
        Self::mk(Type::Boolean, b as Word)
    }

    #[must_use]
    pub fn number(f: Float) -> Self {
        Self(word::from_float(f))
    }

    /// # Panics
    /// Never for a well-formed `Number` value; callers must check
    /// [`Value::value_type`] first.
    #[must_use]
    pub fn as_number(self) -> Float {
        debug_assert!(self.value_type() == Type::Number);
        word::to_float(self.0)
    }

    #[must_use]
    pub fn as_bool(self) -> bool {
        debug_assert!(self.value_type() == Type::Boolean);
        self.payload() != 0
    }

    pub(crate) fn offset_entity(tag: Type, offset: Offset) -> Self {
        Self::mk(tag, offset as Word)
    }

    pub(crate) fn offset(self) -> Offset {
        self.payload() as Offset
    }

    /// Offset/length slice into the engine's currently-parsed source buffer.
    /// Used to defer evaluation of call arguments until they're bound inside
    /// the callee's scope.
    pub(crate) fn coderef(offset: Offset, len: Offset) -> Self {
        let offset_bits = word::CODEREF_OFFSET_BITS;
        let len_bits = word::CODEREF_LEN_BITS;
        let offset_mask = (1u64 << offset_bits) - 1;
        let len_mask = (1u64 << len_bits) - 1;
        let packed = (offset as Word as u64 & offset_mask) | ((len as Word as u64 & len_mask) << offset_bits);
        Self::mk(Type::CodeRef, packed as Word)
    }

    pub(crate) fn coderef_offset(self) -> Offset {
        let offset_mask = (1u64 << word::CODEREF_OFFSET_BITS) - 1;
        (self.payload() as u64 & offset_mask) as Offset
    }

    pub(crate) fn coderef_len(self) -> Offset {
        let len_mask = (1u64 << word::CODEREF_LEN_BITS) - 1;
        ((self.payload() as u64 >> word::CODEREF_OFFSET_BITS) & len_mask) as Offset
    }

    /// Maximum source length (or buffer size) a `CodeRef` can address without
    /// the field silently wrapping. Exceeding this must surface an error
    /// rather than truncate.
    #[must_use]
    pub fn max_coderef_len() -> u32 {
        (1u64 << word::CODEREF_LEN_BITS) as u32 - 1
    }

    pub(crate) fn error() -> Self {
        Self::mk(Type::Error, 0)
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self.value_type() == Type::Error
    }

    #[must_use]
    pub fn is_undefined(self) -> bool {
        self.value_type() == Type::Undefined
    }

    /// Truthiness rules: booleans by value, numbers non-zero, strings
    /// non-empty, objects and functions always true, null/undefined false.
    /// String emptiness needs arena access, so it's resolved by the caller.
    #[must_use]
    pub fn truthy_immediate(self) -> Option<bool> {
        match self.value_type() {
            Type::Boolean => Some(self.as_bool()),
            Type::Number => Some(self.as_number() != 0.0),
            Type::Object | Type::Function => Some(true),
            Type::Null | Type::Undefined => Some(false),
            Type::Str => None,
            _ => Some(false),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value_type() {
            Type::Number => write!(f, "Number({})", self.as_number()),
            Type::Boolean => write!(f, "Boolean({})", self.as_bool()),
            Type::Undefined => f.write_str("Undefined"),
            Type::Null => f.write_str("Null"),
            t @ (Type::Object | Type::Str | Type::Function | Type::Property) => {
                write!(f, "{t:?}(@{})", self.offset())
            }
            Type::CodeRef => write!(f, "CodeRef({}, {})", self.coderef_offset(), self.coderef_len()),
            Type::Error => f.write_str("Error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_round_trips_bit_exact() {
        for f in [0.0, -0.0, 1.0, -1.0, 3.125, f64::INFINITY, f64::NEG_INFINITY, 1e300, -1e-300] {
            #[cfg(not(feature = "word32"))]
            let v = Value::number(f);
            #[cfg(feature = "word32")]
            let v = Value::number(f as f32);
            assert_eq!(v.value_type(), Type::Number);
            #[cfg(not(feature = "word32"))]
            assert_eq!(v.as_number().to_bits(), f.to_bits());
        }
    }

    #[test]
    fn type_discrimination_is_distinct() {
        assert_eq!(Value::undefined().value_type(), Type::Undefined);
        assert_eq!(Value::null().value_type(), Type::Null);
        assert_eq!(Value::boolean(true).value_type(), Type::Boolean);
        assert_eq!(Value::number(1.0).value_type(), Type::Number);
        assert_eq!(Value::offset_entity(Type::Object, 4).value_type(), Type::Object);
        assert_eq!(Value::offset_entity(Type::Str, 4).value_type(), Type::Str);
    }

    #[test]
    fn coderef_offset_len_round_trip() {
        let v = Value::coderef(123, 45);
        assert_eq!(v.value_type(), Type::CodeRef);
        assert_eq!(v.coderef_offset(), 123);
        assert_eq!(v.coderef_len(), 45);
    }

    #[test]
    fn entity_tags_match_arena_tag_values() {
        assert_eq!(Type::Object as u8, 0);
        assert_eq!(Type::Property as u8, 1);
        assert_eq!(Type::Str as u8, 2);
    }
}
