//! IR Type System
//!
//! Value types carried by instructions, plus the small closed enums the
//! optimizer matches on: comparison condition codes and deoptimization kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of the value produced by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// No value (stores, guards, save states)
    Void,

    /// Boolean (compare results, `IsInstance`)
    Bool,

    /// Signed integer types
    Int32,
    Int64,

    /// Unsigned 32-bit integer
    UInt32,

    /// Managed reference (objects, arrays, strings)
    Reference,
}

impl DataType {
    pub fn is_integer(self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64 | DataType::UInt32)
    }

    pub fn is_reference(self) -> bool {
        self == DataType::Reference
    }

    /// Smallest value representable by an integral type.
    ///
    /// Booleans are treated as `[0, 1]`; references and void use the full
    /// 64-bit domain since ranges over them carry no arithmetic meaning.
    pub fn min_value(self) -> i64 {
        match self {
            DataType::Bool | DataType::UInt32 => 0,
            DataType::Int32 => i32::MIN as i64,
            DataType::Int64 | DataType::Reference | DataType::Void => i64::MIN,
        }
    }

    /// Largest value representable by an integral type.
    pub fn max_value(self) -> i64 {
        match self {
            DataType::Bool => 1,
            DataType::Int32 => i32::MAX as i64,
            DataType::UInt32 => u32::MAX as i64,
            DataType::Int64 | DataType::Reference | DataType::Void => i64::MAX,
        }
    }

    /// Width in bits, used to mask shift amounts.
    pub fn bit_width(self) -> u32 {
        match self {
            DataType::Bool => 1,
            DataType::Int32 | DataType::UInt32 => 32,
            DataType::Int64 | DataType::Reference | DataType::Void => 64,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Void => "void",
            DataType::Bool => "b",
            DataType::Int32 => "i32",
            DataType::Int64 => "i64",
            DataType::UInt32 => "u32",
            DataType::Reference => "ref",
        };
        f.write_str(name)
    }
}

/// Condition code of a `Compare` or `IfImm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionCode {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ConditionCode {
    /// Condition that holds exactly when `self` does not.
    pub fn inverse(self) -> Self {
        match self {
            ConditionCode::Eq => ConditionCode::Ne,
            ConditionCode::Ne => ConditionCode::Eq,
            ConditionCode::Lt => ConditionCode::Ge,
            ConditionCode::Le => ConditionCode::Gt,
            ConditionCode::Gt => ConditionCode::Le,
            ConditionCode::Ge => ConditionCode::Lt,
        }
    }

    /// Condition with the operands exchanged: `a cc b` iff `b cc.swap() a`.
    pub fn swap(self) -> Self {
        match self {
            ConditionCode::Eq => ConditionCode::Eq,
            ConditionCode::Ne => ConditionCode::Ne,
            ConditionCode::Lt => ConditionCode::Gt,
            ConditionCode::Le => ConditionCode::Ge,
            ConditionCode::Gt => ConditionCode::Lt,
            ConditionCode::Ge => ConditionCode::Le,
        }
    }

    /// Evaluate on two known values.
    pub fn evaluate(self, a: i64, b: i64) -> bool {
        match self {
            ConditionCode::Eq => a == b,
            ConditionCode::Ne => a != b,
            ConditionCode::Lt => a < b,
            ConditionCode::Le => a <= b,
            ConditionCode::Gt => a > b,
            ConditionCode::Ge => a >= b,
        }
    }
}

impl fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionCode::Eq => "eq",
            ConditionCode::Ne => "ne",
            ConditionCode::Lt => "lt",
            ConditionCode::Le => "le",
            ConditionCode::Gt => "gt",
            ConditionCode::Ge => "ge",
        };
        f.write_str(name)
    }
}

/// Reason attached to a deoptimization, reported to the runtime when the
/// optimized frame is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeoptimizeType {
    NullCheck,
    BoundsCheck,
    ZeroCheck,
    NegativeCheck,
    Overflow,
    CheckCast,
    AnyTypeCheck,
    Hclass,
    RefTypeCheck,
}

impl fmt::Display for DeoptimizeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeoptimizeType::NullCheck => "NULL_CHECK",
            DeoptimizeType::BoundsCheck => "BOUNDS_CHECK",
            DeoptimizeType::ZeroCheck => "ZERO_CHECK",
            DeoptimizeType::NegativeCheck => "NEGATIVE_CHECK",
            DeoptimizeType::Overflow => "OVERFLOW",
            DeoptimizeType::CheckCast => "CHECK_CAST",
            DeoptimizeType::AnyTypeCheck => "ANY_TYPE_CHECK",
            DeoptimizeType::Hclass => "HCLASS",
            DeoptimizeType::RefTypeCheck => "REF_TYPE_CHECK",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_code_inverse_and_swap() {
        for cc in [
            ConditionCode::Eq,
            ConditionCode::Ne,
            ConditionCode::Lt,
            ConditionCode::Le,
            ConditionCode::Gt,
            ConditionCode::Ge,
        ] {
            assert_eq!(cc.inverse().inverse(), cc);
            assert_eq!(cc.swap().swap(), cc);
            for (a, b) in [(1, 2), (2, 2), (3, 2)] {
                assert_eq!(cc.evaluate(a, b), !cc.inverse().evaluate(a, b));
                assert_eq!(cc.evaluate(a, b), cc.swap().evaluate(b, a));
            }
        }
    }

    #[test]
    fn test_type_limits() {
        assert_eq!(DataType::Int32.max_value(), 0x7fff_ffff);
        assert_eq!(DataType::Int32.min_value(), -0x8000_0000);
        assert_eq!(DataType::UInt32.min_value(), 0);
        assert_eq!(DataType::Int64.bit_width(), 64);
    }
}
