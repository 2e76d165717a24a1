//! IR Instructions
//!
//! Instructions live in the function's arena and are addressed by [`IrId`].
//! The opcode is a closed enum; per-opcode payloads (constants, field ids,
//! class ids, condition codes) ride on the variant, operands live in
//! `inputs`.
//!
//! ## Operand conventions
//!
//! ```text
//! NullCheck(ref, ss)              -> ref
//! ZeroCheck / NegativeCheck /
//! NotPositiveCheck(value, ss)     -> value
//! BoundsCheck(len, index, ss)     -> index
//! AddOverflowCheck(a, b, ss)      -> a + b
//! RefTypeCheck(array, value, ss)  -> value
//! CheckCast(obj, ss)              -> void
//! IsInstance(obj, ss)             -> bool
//! DeoptimizeIf(cond, ss)          -> void
//! ```
//!
//! A check that produces a value forwards one of its operands, so removing
//! the check means rewiring its users to that operand.

use super::{DataType, DeoptimizeType, IrBlockId, IrId};
use super::types::ConditionCode;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Class identity used by allocation and type-check opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Field identity used by object and static field accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Dynamic type tag tested by `AnyTypeCheck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnyType {
    Integer,
    Boolean,
    Object,
    Null,
}

bitflags! {
    /// Per-instruction optimization flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct InstFlags: u32 {
        /// Must not be moved out of its block by code motion
        const NO_HOIST = 1 << 0;
        /// May leave the optimized frame through deoptimization
        const CAN_DEOPTIMIZE = 1 << 1;
        /// The implicit null check of a type check is already covered
        const OMIT_NULL_CHECK = 1 << 2;
        /// Memory access that must not be reordered or merged
        const VOLATILE = 1 << 3;
    }
}

/// Instruction opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // === Values ===
    Constant(i64),
    NullPtr,
    Parameter(u32),

    // === Integer arithmetic ===
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Abs,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    AShr,
    Not,
    Compare(ConditionCode),
    Cast,
    Phi,

    // === Deoptimization state ===
    SaveState,
    SaveStateDeoptimize,

    // === Checks ===
    NullCheck,
    ZeroCheck,
    NegativeCheck,
    NotPositiveCheck,
    BoundsCheck,
    AddOverflowCheck,
    SubOverflowCheck,
    NegOverflowAndZeroCheck,
    RefTypeCheck,
    AnyTypeCheck(AnyType),
    HclassCheck,
    CheckCast(TypeId),
    IsInstance(TypeId),

    // === Memory ===
    NewObject(TypeId),
    NewArray(TypeId),
    LoadObject(FieldId),
    StoreObject(FieldId),
    LoadArray,
    StoreArray,
    LoadArrayI(i64),
    StoreArrayI(i64),
    LenArray,
    LoadStatic(FieldId),
    StoreStatic(FieldId),
    LoadString(TypeId),
    LoadObjectDynamic,
    StoreObjectDynamic,
    /// Native memory at `base + offset` bytes.
    LoadRaw,
    StoreRaw,

    // === Calls and guards ===
    CallStatic(u32),
    DeoptimizeIf(DeoptimizeType),
}

impl Opcode {
    /// Deoptimization kind of a check opcode, `None` for everything else.
    pub fn check_kind(&self) -> Option<DeoptimizeType> {
        let kind = match self {
            Opcode::NullCheck => DeoptimizeType::NullCheck,
            Opcode::ZeroCheck => DeoptimizeType::ZeroCheck,
            Opcode::NegativeCheck | Opcode::NotPositiveCheck => DeoptimizeType::NegativeCheck,
            Opcode::BoundsCheck => DeoptimizeType::BoundsCheck,
            Opcode::AddOverflowCheck
            | Opcode::SubOverflowCheck
            | Opcode::NegOverflowAndZeroCheck => DeoptimizeType::Overflow,
            Opcode::RefTypeCheck => DeoptimizeType::RefTypeCheck,
            Opcode::AnyTypeCheck(_) => DeoptimizeType::AnyTypeCheck,
            Opcode::HclassCheck => DeoptimizeType::Hclass,
            Opcode::CheckCast(_) => DeoptimizeType::CheckCast,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_check(&self) -> bool {
        self.check_kind().is_some()
    }

    /// Index of the operand a check forwards as its result.
    pub fn forwarded_input(&self) -> Option<usize> {
        match self {
            Opcode::NullCheck
            | Opcode::ZeroCheck
            | Opcode::NegativeCheck
            | Opcode::NotPositiveCheck
            | Opcode::NegOverflowAndZeroCheck
            | Opcode::AnyTypeCheck(_) => Some(0),
            Opcode::BoundsCheck | Opcode::RefTypeCheck => Some(1),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Opcode::Constant(_) | Opcode::NullPtr)
    }

    /// Arithmetic with no side effects and no trap.
    pub fn is_pure_arithmetic(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Neg
                | Opcode::Abs
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::AShr
                | Opcode::Not
                | Opcode::Compare(_)
                | Opcode::Cast
        )
    }

    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Mul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::AddOverflowCheck
        )
    }

    pub fn is_allocation(&self) -> bool {
        matches!(self, Opcode::NewObject(_) | Opcode::NewArray(_))
    }

    pub fn is_load(&self) -> bool {
        matches!(
            self,
            Opcode::LoadObject(_)
                | Opcode::LoadArray
                | Opcode::LoadArrayI(_)
                | Opcode::LoadStatic(_)
                | Opcode::LoadString(_)
                | Opcode::LoadObjectDynamic
                | Opcode::LoadRaw
        )
    }

    pub fn is_store(&self) -> bool {
        matches!(
            self,
            Opcode::StoreObject(_)
                | Opcode::StoreArray
                | Opcode::StoreArrayI(_)
                | Opcode::StoreStatic(_)
                | Opcode::StoreObjectDynamic
                | Opcode::StoreRaw
        )
    }

    /// Instruction reads or writes a memory location alias analysis can name.
    pub fn is_memory_access(&self) -> bool {
        self.is_load() || self.is_store()
    }

    /// Observable effect beyond producing a value.
    pub fn has_side_effects(&self) -> bool {
        self.is_store()
            || self.is_check()
            || matches!(
                self,
                Opcode::CallStatic(_)
                    | Opcode::DeoptimizeIf(_)
                    | Opcode::SaveState
                    | Opcode::SaveStateDeoptimize
                    | Opcode::NewObject(_)
                    | Opcode::NewArray(_)
                    | Opcode::Div
                    | Opcode::Mod
            )
    }

    pub fn is_save_state(&self) -> bool {
        matches!(self, Opcode::SaveState | Opcode::SaveStateDeoptimize)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Constant(v) => write!(f, "Constant {}", v),
            Opcode::Parameter(i) => write!(f, "Parameter {}", i),
            Opcode::Compare(cc) => write!(f, "Compare {}", cc),
            Opcode::AnyTypeCheck(t) => write!(f, "AnyTypeCheck {:?}", t),
            Opcode::CheckCast(t) => write!(f, "CheckCast {}", t),
            Opcode::IsInstance(t) => write!(f, "IsInstance {}", t),
            Opcode::NewObject(t) => write!(f, "NewObject {}", t),
            Opcode::NewArray(t) => write!(f, "NewArray {}", t),
            Opcode::LoadObject(field) => write!(f, "LoadObject {}", field),
            Opcode::StoreObject(field) => write!(f, "StoreObject {}", field),
            Opcode::LoadArrayI(imm) => write!(f, "LoadArrayI +{}", imm),
            Opcode::StoreArrayI(imm) => write!(f, "StoreArrayI +{}", imm),
            Opcode::LoadStatic(field) => write!(f, "LoadStatic {}", field),
            Opcode::StoreStatic(field) => write!(f, "StoreStatic {}", field),
            Opcode::LoadString(t) => write!(f, "LoadString {}", t),
            Opcode::CallStatic(m) => write!(f, "CallStatic m{}", m),
            Opcode::DeoptimizeIf(kind) => write!(f, "DeoptimizeIf {}", kind),
            other => write!(f, "{:?}", other),
        }
    }
}

/// An instruction slot in the function arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrInstruction {
    /// Arena index of this instruction
    pub id: IrId,

    pub opcode: Opcode,

    /// Type of the produced value (`Void` if none)
    pub ty: DataType,

    /// Operands, in opcode-specific order
    pub inputs: SmallVec<[IrId; 3]>,

    /// Owning block; `None` once retired
    pub block: Option<IrBlockId>,

    pub flags: InstFlags,

    /// Bytecode offset the instruction was built from
    #[serde(default)]
    pub pc: u32,

    /// Retired slot; the id is never reused
    #[serde(default)]
    pub removed: bool,
}

impl IrInstruction {
    pub fn new(id: IrId, opcode: Opcode, ty: DataType, inputs: &[IrId]) -> Self {
        Self {
            id,
            opcode,
            ty,
            inputs: SmallVec::from_slice(inputs),
            block: None,
            flags: InstFlags::empty(),
            pc: 0,
            removed: false,
        }
    }

    pub fn input(&self, index: usize) -> IrId {
        self.inputs[index]
    }

    /// Save state a check or guard deoptimizes with.
    pub fn save_state(&self) -> Option<IrId> {
        if self.opcode.is_check() || matches!(self.opcode, Opcode::DeoptimizeIf(_)) {
            self.inputs.last().copied()
        } else {
            None
        }
    }

    /// Operand a check forwards as its result.
    pub fn forwarded(&self) -> Option<IrId> {
        self.opcode.forwarded_input().map(|i| self.inputs[i])
    }

    pub fn constant_value(&self) -> Option<i64> {
        match self.opcode {
            Opcode::Constant(v) => Some(v),
            Opcode::NullPtr => Some(0),
            _ => None,
        }
    }

    pub fn is_volatile(&self) -> bool {
        self.flags.contains(InstFlags::VOLATILE)
    }
}
