//! Value Numbering
//!
//! Assigns each live instruction a number such that two instructions with
//! the same number compute the same value. Pure arithmetic is keyed on
//! opcode, type and operand numbers (sorted for commutative opcodes);
//! constants on value and type; checks take the number of the operand they
//! forward. Everything else gets a number of its own.
//!
//! Alias analysis uses this to compare array indices symbolically.

use super::instructions::Opcode;
use super::{DataType, IrFunction, IrId};
use fxhash::FxHashMap;
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VnKey {
    Constant(i64, DataType),
    Expr(Opcode, DataType, SmallVec<[u32; 3]>),
    LenArray(u32),
}

/// Value numbers of one function.
#[derive(Debug, Clone)]
pub struct ValueNumbering {
    numbers: FxHashMap<IrId, u32>,
    next: u32,
}

impl ValueNumbering {
    pub fn compute(function: &IrFunction) -> Self {
        let mut vn = Self {
            numbers: FxHashMap::default(),
            next: 0,
        };
        let mut table: FxHashMap<VnKey, u32> = FxHashMap::default();

        for block_id in function.reverse_postorder() {
            let block = function.block(block_id);
            for &id in block.phis.iter().chain(block.instructions.iter()) {
                let number = vn.number_for(function, id, &mut table);
                vn.numbers.insert(id, number);
            }
        }
        vn
    }

    fn fresh(&mut self) -> u32 {
        let n = self.next;
        self.next += 1;
        n
    }

    fn number_for(&mut self, function: &IrFunction, id: IrId, table: &mut FxHashMap<VnKey, u32>) -> u32 {
        let inst = function.inst(id);

        if let Some(forwarded) = inst.forwarded() {
            if let Some(&n) = self.numbers.get(&forwarded) {
                return n;
            }
        }

        let key = match inst.opcode {
            Opcode::Constant(v) => VnKey::Constant(v, inst.ty),
            Opcode::NullPtr => VnKey::Constant(0, DataType::Reference),
            Opcode::LenArray => match self.numbers.get(&inst.input(0)) {
                Some(&n) => VnKey::LenArray(n),
                None => return self.fresh(),
            },
            Opcode::Phi => {
                // A phi whose operands all agree is that operand.
                let mut operands = inst.inputs.iter().map(|i| self.numbers.get(i).copied());
                let first = operands.next().flatten();
                return match first {
                    Some(n) if operands.all(|o| o == Some(n)) => n,
                    _ => self.fresh(),
                };
            }
            op if op.is_pure_arithmetic() => {
                let mut operands: SmallVec<[u32; 3]> = SmallVec::new();
                for input in &inst.inputs {
                    match self.numbers.get(input) {
                        Some(&n) => operands.push(n),
                        None => return self.fresh(),
                    }
                }
                if op.is_commutative() {
                    operands.sort_unstable();
                }
                VnKey::Expr(op, inst.ty, operands)
            }
            _ => return self.fresh(),
        };

        if let Some(&n) = table.get(&key) {
            return n;
        }
        let n = self.fresh();
        table.insert(key, n);
        n
    }

    /// Number of `id`, if it was live when numbering ran.
    pub fn get(&self, id: IrId) -> Option<u32> {
        self.numbers.get(&id).copied()
    }

    /// Both values are known to be equal.
    pub fn same(&self, a: IrId, b: IrId) -> bool {
        if a == b {
            return true;
        }
        matches!((self.get(a), self.get(b)), (Some(x), Some(y)) if x == y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;

    #[test]
    fn test_commutative_and_forwarded_values_match() {
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Int32);
        let q = b.parameter(1, DataType::Int32);
        let len = b.parameter(2, DataType::Int32);
        let ss = b.save_state(&[p, q, len]);
        let a1 = b.binary(Opcode::Add, DataType::Int32, p, q);
        let a2 = b.binary(Opcode::Add, DataType::Int32, q, p);
        let s1 = b.binary(Opcode::Sub, DataType::Int32, p, q);
        let s2 = b.binary(Opcode::Sub, DataType::Int32, q, p);
        let bc = b.bounds_check(len, p, ss);
        let via_check = b.binary(Opcode::Add, DataType::Int32, bc, q);
        b.ret(None);
        let func = b.finish();

        let vn = ValueNumbering::compute(&func);
        assert!(vn.same(a1, a2));
        assert!(!vn.same(s1, s2));
        assert!(vn.same(bc, p));
        assert!(vn.same(via_check, a1));
        assert!(!vn.same(p, q));
    }

    #[test]
    fn test_constants_key_on_type() {
        let mut b = IrBuilder::new("f");
        let c32 = b.constant_typed(4, DataType::Int32);
        let c64 = b.constant_typed(4, DataType::Int64);
        b.ret(None);
        let func = b.finish();

        let vn = ValueNumbering::compute(&func);
        assert!(!vn.same(c32, c64));
    }
}
