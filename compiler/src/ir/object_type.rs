//! Object Type Propagation
//!
//! Tracks the exact class of reference values where the graph makes it
//! obvious: allocations and string loads name their class, checks forward
//! it, and a phi keeps it when every operand agrees. Type-check elimination
//! consumes the result.

use super::instructions::{Opcode, TypeId};
use super::{IrFunction, IrId};
use fxhash::FxHashMap;

/// What is known about the dynamic class of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// Always exactly this class (never null)
    Exact(TypeId),
    /// Always the null constant
    Null,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectTypeInfo {
    types: FxHashMap<IrId, ObjectType>,
}

impl ObjectTypeInfo {
    pub fn compute(function: &IrFunction) -> Self {
        let mut info = Self::default();
        for block_id in function.reverse_postorder() {
            let block = function.block(block_id);
            for &id in block.phis.iter().chain(block.instructions.iter()) {
                if let Some(ty) = info.derive(function, id) {
                    info.types.insert(id, ty);
                }
            }
        }
        info
    }

    fn derive(&self, function: &IrFunction, id: IrId) -> Option<ObjectType> {
        let inst = function.inst(id);
        match inst.opcode {
            Opcode::NewObject(class) | Opcode::NewArray(class) | Opcode::LoadString(class) => {
                Some(ObjectType::Exact(class))
            }
            Opcode::NullPtr => Some(ObjectType::Null),
            Opcode::Phi => {
                // Back-edge operands are not numbered yet on the first visit,
                // so loop phis stay unknown.
                let mut operands = inst.inputs.iter().map(|i| self.types.get(i).copied());
                let first = operands.next().flatten()?;
                operands.all(|o| o == Some(first)).then_some(first)
            }
            _ => inst.forwarded().and_then(|f| self.types.get(&f).copied()),
        }
    }

    pub fn get(&self, id: IrId) -> Option<ObjectType> {
        self.types.get(&id).copied()
    }

    /// Exact class of `id`, if known.
    pub fn exact_class(&self, id: IrId) -> Option<TypeId> {
        match self.get(id) {
            Some(ObjectType::Exact(class)) => Some(class),
            _ => None,
        }
    }

    pub fn is_null(&self, id: IrId) -> bool {
        self.get(id) == Some(ObjectType::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::{ConditionCode, DataType};

    #[test]
    fn test_class_flows_through_checks_and_agreeing_phis() {
        //      bb0
        //      / \
        //    bb1 bb2   (both allocate class 3)
        //      \ /
        //      bb3 phi
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Int32);
        let zero = b.constant_typed(0, DataType::Int32);
        let bb1 = b.create_block();
        let bb2 = b.create_block();
        let bb3 = b.create_block();
        let cmp = b.compare(ConditionCode::Lt, p, zero);
        b.if_imm(cmp, ConditionCode::Ne, 0, bb1, bb2);
        b.switch_to_block(bb1);
        let ss1 = b.save_state(&[]);
        let o1 = b.new_object(TypeId(3), ss1);
        b.goto(bb3);
        b.switch_to_block(bb2);
        let ss2 = b.save_state(&[]);
        let o2 = b.new_object(TypeId(3), ss2);
        b.goto(bb3);
        b.switch_to_block(bb3);
        let phi = b.phi(DataType::Reference, &[o1, o2]);
        let ss3 = b.save_state(&[phi]);
        let nc = b.null_check(phi, ss3);
        let param = b.parameter(1, DataType::Reference);
        b.ret(Some(nc));
        let func = b.finish();

        let info = ObjectTypeInfo::compute(&func);
        assert_eq!(info.exact_class(phi), Some(TypeId(3)));
        assert_eq!(info.exact_class(nc), Some(TypeId(3)));
        assert_eq!(info.get(param), None);
    }

    #[test]
    fn test_null_constant() {
        let mut b = IrBuilder::new("f");
        let null = b.null_ptr();
        b.ret(Some(null));
        let func = b.finish();
        assert!(ObjectTypeInfo::compute(&func).is_null(null));
    }
}
