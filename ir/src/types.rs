//! Value types and constants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A type in the IR's type system. Deliberately small: just enough to model the arithmetic,
/// memory, and control-flow operations the obfuscation passes need to reason about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F64,
    /// Opaque generic pointer. The IR does not model pointee types; callers track that
    /// out of band the way an untyped-pointer backend would.
    Ptr,
    /// A fixed-length array of bytes, used for string globals. Obfuscation passes that encrypt
    /// a string global must preserve this length exactly (spec invariant: ciphertext length ==
    /// plaintext length).
    ByteArray(usize),
}

impl Type {
    /// Natural zero value for this type, used when flattening synthesizes a spill slot
    /// initializer (spec §4.9 step 2).
    pub fn zero_constant(&self) -> Constant {
        match self {
            Type::Void => Constant::Undef(self.clone()),
            Type::I1 => Constant::Int(Type::I1, 0),
            Type::I8 => Constant::Int(Type::I8, 0),
            Type::I16 => Constant::Int(Type::I16, 0),
            Type::I32 => Constant::Int(Type::I32, 0),
            Type::I64 => Constant::Int(Type::I64, 0),
            Type::F64 => Constant::Float(0.0),
            Type::Ptr => Constant::Null,
            Type::ByteArray(_) => Constant::Undef(self.clone()),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Type::I1 | Type::I8 | Type::I16 | Type::I32 | Type::I64
        )
    }

    /// Bit width of an integer type, used by the instruction substituter to decide whether a
    /// constant operand is a power of two worth rewriting as a shift.
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            Type::I1 => Some(1),
            Type::I8 => Some(8),
            Type::I16 => Some(16),
            Type::I32 => Some(32),
            Type::I64 => Some(64),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::I1 => write!(f, "i1"),
            Type::I8 => write!(f, "i8"),
            Type::I16 => write!(f, "i16"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::F64 => write!(f, "f64"),
            Type::Ptr => write!(f, "ptr"),
            Type::ByteArray(n) => write!(f, "[{} x i8]", n),
        }
    }
}

/// A compile-time constant value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(Type, i64),
    Float(f64),
    Null,
    /// Poison/undef value of the given type, used as a filler incoming value for PHIs that
    /// gain a new predecessor with no natural incoming value (spec §4.7, fake-loop PHI fix-up).
    Undef(Type),
}

impl Constant {
    pub fn ty(&self) -> Type {
        match self {
            Constant::Int(ty, _) => ty.clone(),
            Constant::Float(_) => Type::F64,
            Constant::Null => Type::Ptr,
            Constant::Undef(ty) => ty.clone(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Constant::Int(_, v) => Some(*v),
            _ => None,
        }
    }
}
