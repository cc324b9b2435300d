use crate::types::BasicType;
use std::fmt::{self, Debug, Formatter};

pub mod object;
pub mod reference;
pub mod storage;

pub use reference::*;

/// Reference-type tag kept in a byte array parallel to every slot array.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Tag {
    #[default]
    None = 0,
    /// Return address pushed by `jsr`.
    ReturnAddress = 1,
    Object = 2,
}

/// One untyped storage cell of an operand stack or locals array.
///
/// Ints and floats live in the low 32 bits. References are stored in the
/// encoding chosen by the process [`AddressingMode`], which needs the full
/// width only when references are uncompressed. Which interpretation is valid
/// is tracked by the slot's [`Tag`] and, for primitives, by the bytecode.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Slot(u64);

impl Slot {
    pub const ZERO: Slot = Slot(0);

    #[inline]
    pub const fn from_int(value: i32) -> Self {
        Self(value as u32 as u64)
    }

    #[inline]
    pub const fn from_half(word: u32) -> Self {
        Self(word as u64)
    }

    #[inline]
    pub fn from_float(value: f32) -> Self {
        Self(value.to_bits() as u64)
    }

    #[inline]
    pub const fn from_raw_ref(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn from_return_address(pc: usize) -> Self {
        Self(pc as u64)
    }

    #[inline]
    pub const fn as_int(self) -> i32 {
        self.0 as u32 as i32
    }

    #[inline]
    pub const fn half(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn as_float(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    #[inline]
    pub const fn raw_ref(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_return_address(self) -> usize {
        self.0 as usize
    }
}

impl Debug for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({:#x})", self.0)
    }
}

#[inline]
pub const fn split_wide(bits: u64) -> (u32, u32) {
    ((bits >> 32) as u32, bits as u32)
}

#[inline]
pub const fn join_wide(high: u32, low: u32) -> u64 {
    ((high as u64) << 32) | low as u64
}

/// A typed value crossing the interpreter boundary: entry arguments, return
/// values, fields, array elements and native call arguments.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(ObjectRef),
}

impl Value {
    pub const NULL: Value = Value::Ref(ObjectRef::NULL);

    /// The zero value a field or array element of `ty` starts out with.
    pub fn default_for(ty: BasicType) -> Self {
        match ty {
            BasicType::Long => Value::Long(0),
            BasicType::Float => Value::Float(0.0),
            BasicType::Double => Value::Double(0.0),
            BasicType::Reference => Value::NULL,
            _ => Value::Int(0),
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, Value::Long(_) | Value::Double(_))
    }

    pub fn slot_count(&self) -> usize {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    pub fn as_int(&self) -> i32 {
        match self {
            Value::Int(i) => *i,
            v => panic!("expected int value, found {v:?}"),
        }
    }

    pub fn as_long(&self) -> i64 {
        match self {
            Value::Long(l) => *l,
            v => panic!("expected long value, found {v:?}"),
        }
    }

    pub fn as_float(&self) -> f32 {
        match self {
            Value::Float(f) => *f,
            v => panic!("expected float value, found {v:?}"),
        }
    }

    pub fn as_double(&self) -> f64 {
        match self {
            Value::Double(d) => *d,
            v => panic!("expected double value, found {v:?}"),
        }
    }

    pub fn as_object(&self) -> ObjectRef {
        match self {
            Value::Ref(r) => *r,
            v => panic!("expected reference value, found {v:?}"),
        }
    }

    /// Sub-int values travel as ints; this applies the truncation implied by
    /// the declared type.
    pub fn narrow_to(self, ty: BasicType) -> Self {
        match (self, ty) {
            (Value::Int(i), BasicType::Boolean) => Value::Int(i & 1),
            (Value::Int(i), BasicType::Byte) => Value::Int(i as i8 as i32),
            (Value::Int(i), BasicType::Char) => Value::Int(i as u16 as i32),
            (Value::Int(i), BasicType::Short) => Value::Int(i as i16 as i32),
            (v, _) => v,
        }
    }
}
