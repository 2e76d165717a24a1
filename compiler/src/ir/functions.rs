//! Functions
//!
//! An [`IrFunction`] owns the instruction arena and the CFG. Passes mutate
//! it in place through the methods here; an instruction that is removed is
//! retired (detached from its block, `removed` set) rather than freed, so
//! ids held by in-flight worklists never dangle.

use super::blocks::{IrBasicBlock, IrBlockId, IrControlFlowGraph, IrTerminator};
use super::instructions::{IrInstruction, Opcode};
use super::{DataType, IrId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Reader of a value: an instruction operand or a block terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrUser {
    Inst(IrId),
    Terminator(IrBlockId),
}

/// A function body in SSA form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrFunction {
    /// Function name
    pub name: String,

    /// Instruction arena, indexed by `IrId`
    pub insts: Vec<IrInstruction>,

    /// Control flow graph
    pub cfg: IrControlFlowGraph,

    /// Compiled for on-stack replacement; loop transforms stay away
    #[serde(default)]
    pub is_osr: bool,
}

impl IrFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
            cfg: IrControlFlowGraph::new(),
            is_osr: false,
        }
    }

    pub fn entry_block(&self) -> IrBlockId {
        self.cfg.entry_block
    }

    pub fn inst(&self, id: IrId) -> &IrInstruction {
        &self.insts[id.as_usize()]
    }

    pub fn inst_mut(&mut self, id: IrId) -> &mut IrInstruction {
        &mut self.insts[id.as_usize()]
    }

    pub fn opcode(&self, id: IrId) -> Opcode {
        self.inst(id).opcode
    }

    pub fn input(&self, id: IrId, index: usize) -> IrId {
        self.inst(id).inputs[index]
    }

    pub fn block_of(&self, id: IrId) -> IrBlockId {
        match self.inst(id).block {
            Some(block) => block,
            None => panic!("instruction {} is retired", id),
        }
    }

    pub fn is_live(&self, id: IrId) -> bool {
        self.insts
            .get(id.as_usize())
            .map(|inst| !inst.removed && inst.block.is_some())
            .unwrap_or(false)
    }

    pub fn constant_value(&self, id: IrId) -> Option<i64> {
        self.inst(id).constant_value()
    }

    /// Iterate live instructions of every block in block-id order.
    pub fn live_insts(&self) -> impl Iterator<Item = &IrInstruction> {
        self.cfg
            .blocks
            .values()
            .flat_map(|b| b.phis.iter().chain(b.instructions.iter()))
            .map(move |&id| self.inst(id))
    }

    pub fn reverse_postorder(&self) -> Vec<IrBlockId> {
        self.cfg.reverse_postorder()
    }

    /// Structural and SSA verification, see [`super::validation`].
    pub fn verify(&self) -> Result<(), crate::error::IrError> {
        super::validation::verify_function(self)
    }

    // === Creation ===

    fn alloc(&mut self, opcode: Opcode, ty: DataType, inputs: &[IrId]) -> IrId {
        let id = IrId::new(self.insts.len() as u32);
        self.insts.push(IrInstruction::new(id, opcode, ty, inputs));
        id
    }

    /// Append an instruction at the end of `block`'s body.
    pub fn append_inst(&mut self, block: IrBlockId, opcode: Opcode, ty: DataType, inputs: &[IrId]) -> IrId {
        let id = self.alloc(opcode, ty, inputs);
        self.insts[id.as_usize()].block = Some(block);
        if opcode == Opcode::Phi {
            self.cfg.block_mut(block).phis.push(id);
        } else {
            self.cfg.block_mut(block).instructions.push(id);
        }
        id
    }

    /// Insert a new instruction immediately before `anchor`.
    pub fn insert_before(&mut self, anchor: IrId, opcode: Opcode, ty: DataType, inputs: &[IrId]) -> IrId {
        let block = self.block_of(anchor);
        let id = self.alloc(opcode, ty, inputs);
        self.insts[id.as_usize()].block = Some(block);
        let body = &mut self.cfg.block_mut(block).instructions;
        let pos = body.iter().position(|&i| i == anchor).unwrap_or(body.len());
        body.insert(pos, id);
        id
    }

    /// Find a constant in the entry block or create one there.
    pub fn find_or_create_constant(&mut self, value: i64, ty: DataType) -> IrId {
        let entry = self.entry_block();
        let existing = self.cfg.block(entry).instructions.iter().copied().find(|&id| {
            let inst = self.inst(id);
            inst.opcode == Opcode::Constant(value) && inst.ty == ty
        });
        if let Some(id) = existing {
            return id;
        }
        let id = self.alloc(Opcode::Constant(value), ty, &[]);
        self.insts[id.as_usize()].block = Some(entry);
        let insert_at = self.leading_values_len(entry);
        self.cfg.block_mut(entry).instructions.insert(insert_at, id);
        id
    }

    /// Number of constants and parameters heading the entry block.
    pub(crate) fn leading_values_len(&self, entry: IrBlockId) -> usize {
        self.cfg
            .block(entry)
            .instructions
            .iter()
            .take_while(|&&id| {
                matches!(
                    self.inst(id).opcode,
                    Opcode::Constant(_) | Opcode::NullPtr | Opcode::Parameter(_)
                )
            })
            .count()
    }

    // === Def-use ===

    /// Every reader of `id`, scanning live instructions and terminators.
    pub fn users_of(&self, id: IrId) -> Vec<IrUser> {
        let mut users = Vec::new();
        for block in self.cfg.blocks.values() {
            for &inst in block.phis.iter().chain(block.instructions.iter()) {
                if self.inst(inst).inputs.contains(&id) {
                    users.push(IrUser::Inst(inst));
                }
            }
            if block.terminator.uses().contains(&id) {
                users.push(IrUser::Terminator(block.id));
            }
        }
        users
    }

    pub fn has_users(&self, id: IrId) -> bool {
        !self.users_of(id).is_empty()
    }

    /// Rewire every reader of `old` to read `new` instead.
    pub fn replace_all_uses(&mut self, old: IrId, new: IrId) {
        let ids: Vec<IrId> = self
            .cfg
            .blocks
            .values()
            .flat_map(|b| b.phis.iter().chain(b.instructions.iter()).copied())
            .collect();
        for id in ids {
            for input in self.insts[id.as_usize()].inputs.iter_mut() {
                if *input == old {
                    *input = new;
                }
            }
        }
        for block in self.cfg.blocks.values_mut() {
            block.terminator.replace_use(old, new);
        }
    }

    // === Removal and motion ===

    /// Detach `id` from its block and retire the slot.
    pub fn remove_inst(&mut self, id: IrId) {
        if let Some(block) = self.inst(id).block {
            if let Some(b) = self.cfg.get_block_mut(block) {
                b.instructions.retain(|&i| i != id);
                b.phis.retain(|&i| i != id);
            }
        }
        let inst = self.inst_mut(id);
        inst.block = None;
        inst.removed = true;
        inst.inputs.clear();
    }

    /// Move `id` to the end of `block`'s body.
    pub fn move_to_block_end(&mut self, id: IrId, block: IrBlockId) {
        if let Some(old) = self.inst(id).block {
            self.cfg.block_mut(old).instructions.retain(|&i| i != id);
        }
        self.cfg.block_mut(block).instructions.push(id);
        self.inst_mut(id).block = Some(block);
    }

    /// Position of `id` within its block; phis come first.
    pub fn position_in_block(&self, id: IrId) -> usize {
        let block = self.cfg.block(self.block_of(id));
        if let Some(pos) = block.phis.iter().position(|&i| i == id) {
            return pos;
        }
        let pos = block.instructions.iter().position(|&i| i == id).unwrap_or(usize::MAX - block.phis.len());
        block.phis.len() + pos
    }

    /// Retire every instruction after `id` in its block and return them.
    pub fn truncate_after(&mut self, id: IrId) -> Vec<IrId> {
        let block = self.block_of(id);
        let body = &self.cfg.block(block).instructions;
        let pos = body.iter().position(|&i| i == id).map(|p| p + 1).unwrap_or(body.len());
        let tail: Vec<IrId> = body[pos..].to_vec();
        for &inst in tail.iter().rev() {
            self.remove_inst(inst);
        }
        tail
    }

    // === Control flow ===

    /// Drop the edge `from -> to`, removing the matching phi operands.
    pub fn remove_edge(&mut self, from: IrBlockId, to: IrBlockId) {
        let Some(index) = self.cfg.get_block(to).and_then(|b| b.pred_index(from)) else {
            return;
        };
        let phis = self.cfg.block(to).phis.clone();
        for phi in phis {
            let inputs = &mut self.insts[phi.as_usize()].inputs;
            if index < inputs.len() {
                inputs.remove(index);
            }
        }
        self.cfg.block_mut(to).predecessors.remove(index);
    }

    /// Replace `block`'s terminator, dropping edges to successors it no
    /// longer reaches.
    pub fn set_terminator(&mut self, block: IrBlockId, terminator: IrTerminator) {
        let old_succs = self.cfg.block(block).successors();
        self.cfg.block_mut(block).terminator = terminator;
        let new_succs = self.cfg.block(block).successors();
        for succ in old_succs {
            if !new_succs.contains(&succ) {
                self.remove_edge(block, succ);
            }
        }
        for succ in new_succs {
            self.cfg.connect_blocks(block, succ);
        }
    }

    /// Split the edge `from -> to` with a fresh block that jumps to `to`.
    /// Phi operands keep their position since `to` sees the new block in
    /// place of `from`.
    pub fn split_edge(&mut self, from: IrBlockId, to: IrBlockId) -> IrBlockId {
        let middle = self.cfg.create_block();
        self.cfg.block_mut(from).terminator.replace_target(to, middle);
        self.cfg.block_mut(middle).terminator = IrTerminator::Goto { target: to };
        self.cfg.block_mut(middle).predecessors.push(from);
        for pred in self.cfg.block_mut(to).predecessors.iter_mut() {
            if *pred == from {
                *pred = middle;
            }
        }
        middle
    }

    /// Remove blocks no longer reachable from the entry, retiring their
    /// instructions. Returns the number of blocks removed.
    pub fn remove_unreachable_blocks(&mut self) -> usize {
        let reachable: HashSet<IrBlockId> = self.reverse_postorder().into_iter().collect();
        let dead: Vec<IrBlockId> = self
            .cfg
            .blocks
            .keys()
            .copied()
            .filter(|b| !reachable.contains(b))
            .collect();

        for &block in &dead {
            let succs = self.cfg.block(block).successors();
            for succ in succs {
                if reachable.contains(&succ) {
                    self.remove_edge(block, succ);
                }
            }
        }
        for &block in &dead {
            let b = self.cfg.block(block);
            let insts: Vec<IrId> = b.phis.iter().chain(b.instructions.iter()).copied().collect();
            for inst in insts {
                let slot = self.inst_mut(inst);
                slot.block = None;
                slot.removed = true;
                slot.inputs.clear();
            }
            self.cfg.blocks.remove(&block);
        }
        dead.len()
    }

    pub fn block(&self, id: IrBlockId) -> &IrBasicBlock {
        self.cfg.block(id)
    }
}
