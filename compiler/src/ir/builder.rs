//! IR Builder
//!
//! Convenience interface for constructing functions instruction by
//! instruction. Tests, benches and the CLI all build graphs through it.
//!
//! ```text
//! let mut b = IrBuilder::new("sum");
//! let arr = b.parameter(0, DataType::Reference);
//! let ss = b.save_state(&[arr]);
//! let nc = b.null_check(arr, ss);
//! let len = b.len_array(nc);
//! b.ret(Some(len));
//! let func = b.finish();
//! ```

use super::blocks::{IrBlockId, IrTerminator};
use super::instructions::{AnyType, FieldId, InstFlags, Opcode, TypeId};
use super::types::{ConditionCode, DataType, DeoptimizeType};
use super::{IrFunction, IrId};
use std::collections::HashMap;

/// Builder for a single function
pub struct IrBuilder {
    /// The function being built
    pub function: IrFunction,

    /// Current basic block being built
    current_block: IrBlockId,

    /// Interned integer constants
    constants: HashMap<(i64, DataType), IrId>,

    null_ptr: Option<IrId>,
}

impl IrBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let function = IrFunction::new(name);
        let current_block = function.entry_block();
        Self {
            function,
            current_block,
            constants: HashMap::new(),
            null_ptr: None,
        }
    }

    /// Finish building and hand out the function.
    pub fn finish(self) -> IrFunction {
        self.function
    }

    // === Block Building ===

    pub fn create_block(&mut self) -> IrBlockId {
        self.function.cfg.create_block()
    }

    pub fn create_block_with_label(&mut self, label: &str) -> IrBlockId {
        let block = self.create_block();
        self.function.cfg.block_mut(block).label = Some(label.to_string());
        block
    }

    pub fn switch_to_block(&mut self, block: IrBlockId) {
        self.current_block = block;
    }

    pub fn current_block(&self) -> IrBlockId {
        self.current_block
    }

    /// Mark a block as part of a try/catch region.
    pub fn mark_try_catch(&mut self, block: IrBlockId) {
        self.function.cfg.block_mut(block).metadata.in_exception_handler = true;
    }

    pub fn set_osr(&mut self, osr: bool) {
        self.function.is_osr = osr;
    }

    // === Values in the entry block ===

    fn leading_value(&mut self, opcode: Opcode, ty: DataType) -> IrId {
        let entry = self.function.entry_block();
        let id = self.function.append_inst(entry, opcode, ty, &[]);
        // Keep constants and parameters ahead of ordinary entry code.
        self.function.cfg.block_mut(entry).instructions.pop();
        let at = self.function.leading_values_len(entry);
        self.function.cfg.block_mut(entry).instructions.insert(at, id);
        id
    }

    pub fn parameter(&mut self, index: u32, ty: DataType) -> IrId {
        self.leading_value(Opcode::Parameter(index), ty)
    }

    /// 64-bit integer constant, interned.
    pub fn constant(&mut self, value: i64) -> IrId {
        self.constant_typed(value, DataType::Int64)
    }

    pub fn constant_typed(&mut self, value: i64, ty: DataType) -> IrId {
        if let Some(&id) = self.constants.get(&(value, ty)) {
            return id;
        }
        let id = self.leading_value(Opcode::Constant(value), ty);
        self.constants.insert((value, ty), id);
        id
    }

    pub fn null_ptr(&mut self) -> IrId {
        if let Some(id) = self.null_ptr {
            return id;
        }
        let id = self.leading_value(Opcode::NullPtr, DataType::Reference);
        self.null_ptr = Some(id);
        id
    }

    // === Generic construction ===

    /// Append any instruction to the current block.
    pub fn inst(&mut self, opcode: Opcode, ty: DataType, inputs: &[IrId]) -> IrId {
        self.function.append_inst(self.current_block, opcode, ty, inputs)
    }

    pub fn binary(&mut self, op: Opcode, ty: DataType, lhs: IrId, rhs: IrId) -> IrId {
        self.inst(op, ty, &[lhs, rhs])
    }

    pub fn unary(&mut self, op: Opcode, ty: DataType, operand: IrId) -> IrId {
        self.inst(op, ty, &[operand])
    }

    pub fn compare(&mut self, cc: ConditionCode, lhs: IrId, rhs: IrId) -> IrId {
        self.inst(Opcode::Compare(cc), DataType::Bool, &[lhs, rhs])
    }

    /// Phi in the current block; operands follow the predecessor order.
    pub fn phi(&mut self, ty: DataType, inputs: &[IrId]) -> IrId {
        self.inst(Opcode::Phi, ty, inputs)
    }

    /// Append a phi operand once the matching predecessor edge exists.
    pub fn add_phi_input(&mut self, phi: IrId, value: IrId) {
        self.function.inst_mut(phi).inputs.push(value);
    }

    pub fn set_flags(&mut self, id: IrId, flags: InstFlags) {
        self.function.inst_mut(id).flags |= flags;
    }

    pub fn set_pc(&mut self, id: IrId, pc: u32) {
        self.function.inst_mut(id).pc = pc;
    }

    // === Save states and checks ===

    pub fn save_state(&mut self, live: &[IrId]) -> IrId {
        self.inst(Opcode::SaveState, DataType::Void, live)
    }

    pub fn save_state_deoptimize(&mut self, live: &[IrId]) -> IrId {
        self.inst(Opcode::SaveStateDeoptimize, DataType::Void, live)
    }

    pub fn null_check(&mut self, value: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::NullCheck, DataType::Reference, &[value, ss])
    }

    pub fn zero_check(&mut self, value: IrId, ty: DataType, ss: IrId) -> IrId {
        self.inst(Opcode::ZeroCheck, ty, &[value, ss])
    }

    pub fn negative_check(&mut self, value: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::NegativeCheck, DataType::Int32, &[value, ss])
    }

    pub fn not_positive_check(&mut self, value: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::NotPositiveCheck, DataType::Int32, &[value, ss])
    }

    pub fn bounds_check(&mut self, len: IrId, index: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::BoundsCheck, DataType::Int32, &[len, index, ss])
    }

    pub fn add_overflow_check(&mut self, lhs: IrId, rhs: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::AddOverflowCheck, DataType::Int32, &[lhs, rhs, ss])
    }

    pub fn sub_overflow_check(&mut self, lhs: IrId, rhs: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::SubOverflowCheck, DataType::Int32, &[lhs, rhs, ss])
    }

    pub fn neg_overflow_and_zero_check(&mut self, value: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::NegOverflowAndZeroCheck, DataType::Int32, &[value, ss])
    }

    pub fn ref_type_check(&mut self, array: IrId, value: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::RefTypeCheck, DataType::Reference, &[array, value, ss])
    }

    pub fn any_type_check(&mut self, value: IrId, any: AnyType, ss: IrId) -> IrId {
        self.inst(Opcode::AnyTypeCheck(any), DataType::Int64, &[value, ss])
    }

    pub fn hclass_check(&mut self, object: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::HclassCheck, DataType::Void, &[object, ss])
    }

    pub fn check_cast(&mut self, object: IrId, class: TypeId, ss: IrId) -> IrId {
        self.inst(Opcode::CheckCast(class), DataType::Void, &[object, ss])
    }

    pub fn is_instance(&mut self, object: IrId, class: TypeId, ss: IrId) -> IrId {
        self.inst(Opcode::IsInstance(class), DataType::Bool, &[object, ss])
    }

    pub fn deoptimize_if(&mut self, cond: IrId, kind: DeoptimizeType, ss: IrId) -> IrId {
        let id = self.inst(Opcode::DeoptimizeIf(kind), DataType::Void, &[cond, ss]);
        self.set_flags(id, InstFlags::CAN_DEOPTIMIZE);
        id
    }

    // === Memory ===

    pub fn new_object(&mut self, class: TypeId, ss: IrId) -> IrId {
        self.inst(Opcode::NewObject(class), DataType::Reference, &[ss])
    }

    pub fn new_array(&mut self, class: TypeId, size: IrId, ss: IrId) -> IrId {
        self.inst(Opcode::NewArray(class), DataType::Reference, &[size, ss])
    }

    pub fn len_array(&mut self, array: IrId) -> IrId {
        self.inst(Opcode::LenArray, DataType::Int32, &[array])
    }

    pub fn load_array(&mut self, array: IrId, index: IrId, ty: DataType) -> IrId {
        self.inst(Opcode::LoadArray, ty, &[array, index])
    }

    pub fn store_array(&mut self, array: IrId, index: IrId, value: IrId) -> IrId {
        self.inst(Opcode::StoreArray, DataType::Void, &[array, index, value])
    }

    pub fn load_array_imm(&mut self, array: IrId, imm: i64, ty: DataType) -> IrId {
        self.inst(Opcode::LoadArrayI(imm), ty, &[array])
    }

    pub fn store_array_imm(&mut self, array: IrId, imm: i64, value: IrId) -> IrId {
        self.inst(Opcode::StoreArrayI(imm), DataType::Void, &[array, value])
    }

    pub fn load_object(&mut self, object: IrId, field: FieldId, ty: DataType) -> IrId {
        self.inst(Opcode::LoadObject(field), ty, &[object])
    }

    pub fn store_object(&mut self, object: IrId, field: FieldId, value: IrId) -> IrId {
        self.inst(Opcode::StoreObject(field), DataType::Void, &[object, value])
    }

    pub fn load_static(&mut self, field: FieldId, ty: DataType) -> IrId {
        self.inst(Opcode::LoadStatic(field), ty, &[])
    }

    pub fn store_static(&mut self, field: FieldId, value: IrId) -> IrId {
        self.inst(Opcode::StoreStatic(field), DataType::Void, &[value])
    }

    pub fn load_string(&mut self, string: TypeId) -> IrId {
        self.inst(Opcode::LoadString(string), DataType::Reference, &[])
    }

    pub fn load_object_dynamic(&mut self, object: IrId, key: IrId, ty: DataType) -> IrId {
        self.inst(Opcode::LoadObjectDynamic, ty, &[object, key])
    }

    pub fn store_object_dynamic(&mut self, object: IrId, key: IrId, value: IrId) -> IrId {
        self.inst(Opcode::StoreObjectDynamic, DataType::Void, &[object, key, value])
    }

    pub fn load_raw(&mut self, base: IrId, offset: IrId, ty: DataType) -> IrId {
        self.inst(Opcode::LoadRaw, ty, &[base, offset])
    }

    pub fn store_raw(&mut self, base: IrId, offset: IrId, value: IrId) -> IrId {
        self.inst(Opcode::StoreRaw, DataType::Void, &[base, offset, value])
    }

    pub fn call_static(&mut self, method: u32, ty: DataType, args: &[IrId]) -> IrId {
        self.inst(Opcode::CallStatic(method), ty, args)
    }

    // === Terminators ===

    pub fn goto(&mut self, target: IrBlockId) {
        self.function
            .set_terminator(self.current_block, IrTerminator::Goto { target });
    }

    pub fn if_imm(
        &mut self,
        cond: IrId,
        cc: ConditionCode,
        imm: i64,
        true_target: IrBlockId,
        false_target: IrBlockId,
    ) {
        self.function.set_terminator(
            self.current_block,
            IrTerminator::IfImm {
                cond,
                cc,
                imm,
                true_target,
                false_target,
            },
        );
    }

    pub fn ret(&mut self, value: Option<IrId>) {
        self.function
            .set_terminator(self.current_block, IrTerminator::Return { value });
    }

    pub fn deoptimize(&mut self, kind: DeoptimizeType, save_state: Option<IrId>) {
        self.function
            .set_terminator(self.current_block, IrTerminator::Deoptimize { kind, save_state });
    }

    // === Counted loops ===

    /// Open `for (i = init; i cc test; i += step)` and leave the builder in
    /// the loop body. The preheader carries a `SaveStateDeoptimize` so
    /// checks can be hoisted into it.
    pub fn begin_counted_loop(&mut self, init: IrId, test: IrId, cc: ConditionCode, step: i64) -> CountedLoop {
        let ty = self.function.inst(init).ty;
        let preheader = self.create_block_with_label("preheader");
        let header = self.create_block_with_label("header");
        let body = self.create_block_with_label("body");
        let exit = self.create_block_with_label("exit");
        self.goto(preheader);

        self.switch_to_block(preheader);
        let save_state = self.save_state_deoptimize(&[init, test]);
        self.goto(header);

        self.switch_to_block(header);
        let index = self.phi(ty, &[init]);
        let cmp = self.compare(cc, index, test);
        self.if_imm(cmp, ConditionCode::Ne, 0, body, exit);

        self.switch_to_block(body);
        CountedLoop {
            preheader,
            header,
            body,
            exit,
            index,
            save_state,
            step,
        }
    }

    /// Close the loop from the current block: emit the update, jump back
    /// to the header and continue in the exit block. Returns the update.
    pub fn end_counted_loop(&mut self, counted: &CountedLoop) -> IrId {
        let ty = self.function.inst(counted.index).ty;
        let magnitude = self.constant_typed(counted.step.unsigned_abs() as i64, ty);
        let op = if counted.step >= 0 { Opcode::Add } else { Opcode::Sub };
        let update = self.binary(op, ty, counted.index, magnitude);
        self.goto(counted.header);
        self.add_phi_input(counted.index, update);
        self.switch_to_block(counted.exit);
        update
    }
}

/// Blocks and values of a loop opened with
/// [`IrBuilder::begin_counted_loop`].
#[derive(Debug, Clone)]
pub struct CountedLoop {
    pub preheader: IrBlockId,
    pub header: IrBlockId,
    pub body: IrBlockId,
    pub exit: IrBlockId,
    pub index: IrId,
    /// `SaveStateDeoptimize` in the preheader
    pub save_state: IrId,
    pub step: i64,
}
