//! Basic Blocks
//!
//! Blocks own ordered lists of instruction ids (phis first, then the body)
//! and end in an explicit terminator. Phi operands are positional: operand
//! `k` of every phi in a block flows in from `predecessors[k]`.

use super::types::{ConditionCode, DeoptimizeType};
use super::IrId;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeMap;

/// A basic block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrBasicBlock {
    /// Unique identifier for this block
    pub id: IrBlockId,

    /// Human-readable label (for debugging)
    #[serde(default)]
    pub label: Option<String>,

    /// Phi instructions at the head of this block
    #[serde(default)]
    pub phis: Vec<IrId>,

    /// Body instructions (executed sequentially)
    pub instructions: Vec<IrId>,

    /// Terminator (branch, return, deoptimize)
    pub terminator: IrTerminator,

    /// Predecessors in the CFG, aligned with phi operands
    #[serde(default)]
    pub predecessors: Vec<IrBlockId>,

    /// Metadata for optimization hints
    #[serde(default)]
    pub metadata: BlockMetadata,
}

/// Unique identifier for basic blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrBlockId(pub u32);

impl IrBlockId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn entry() -> Self {
        Self(0)
    }

    pub fn is_entry(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for IrBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Terminators that end a basic block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrTerminator {
    /// Unconditional branch to another block
    Goto { target: IrBlockId },

    /// Branch to `true_target` when `cond cc imm` holds
    IfImm {
        cond: IrId,
        cc: ConditionCode,
        imm: i64,
        true_target: IrBlockId,
        false_target: IrBlockId,
    },

    /// Return from function
    Return { value: Option<IrId> },

    /// Leave the optimized frame unconditionally
    Deoptimize {
        kind: DeoptimizeType,
        save_state: Option<IrId>,
    },

    /// Unreachable code (unterminated while under construction)
    Unreachable,
}

impl IrTerminator {
    /// Values read by the terminator.
    pub fn uses(&self) -> SmallVec<[IrId; 2]> {
        match self {
            IrTerminator::IfImm { cond, .. } => smallvec![*cond],
            IrTerminator::Return { value: Some(v) } => smallvec![*v],
            IrTerminator::Deoptimize {
                save_state: Some(ss),
                ..
            } => smallvec![*ss],
            _ => SmallVec::new(),
        }
    }

    /// Rewrite every read of `old` into `new`; returns whether anything changed.
    pub fn replace_use(&mut self, old: IrId, new: IrId) -> bool {
        let slot = match self {
            IrTerminator::IfImm { cond, .. } => Some(cond),
            IrTerminator::Return { value: Some(v) } => Some(v),
            IrTerminator::Deoptimize {
                save_state: Some(ss),
                ..
            } => Some(ss),
            _ => None,
        };
        match slot {
            Some(v) if *v == old => {
                *v = new;
                true
            }
            _ => false,
        }
    }

    /// Retarget edges that lead to `from` so they lead to `to`.
    pub fn replace_target(&mut self, from: IrBlockId, to: IrBlockId) {
        match self {
            IrTerminator::Goto { target } if *target == from => *target = to,
            IrTerminator::IfImm {
                true_target,
                false_target,
                ..
            } => {
                if *true_target == from {
                    *true_target = to;
                }
                if *false_target == from {
                    *false_target = to;
                }
            }
            _ => {}
        }
    }
}

/// Metadata for optimization and analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Whether this block is in a try/catch region
    #[serde(default)]
    pub in_exception_handler: bool,

    /// Block is the entry of an on-stack-replacement loop
    #[serde(default)]
    pub osr_entry: bool,
}

impl IrBasicBlock {
    /// Create a new basic block
    pub fn new(id: IrBlockId) -> Self {
        Self {
            id,
            label: None,
            phis: Vec::new(),
            instructions: Vec::new(),
            terminator: IrTerminator::Unreachable,
            predecessors: Vec::new(),
            metadata: BlockMetadata::default(),
        }
    }

    /// Get all successor blocks based on the terminator
    pub fn successors(&self) -> SmallVec<[IrBlockId; 2]> {
        match &self.terminator {
            IrTerminator::Goto { target } => smallvec![*target],
            IrTerminator::IfImm {
                true_target,
                false_target,
                ..
            } => smallvec![*true_target, *false_target],
            IrTerminator::Return { .. }
            | IrTerminator::Deoptimize { .. }
            | IrTerminator::Unreachable => SmallVec::new(),
        }
    }

    /// Check if this block is terminated properly
    pub fn is_terminated(&self) -> bool {
        !matches!(self.terminator, IrTerminator::Unreachable)
    }

    /// Position of `pred` in the predecessor list, i.e. its phi operand index.
    pub fn pred_index(&self, pred: IrBlockId) -> Option<usize> {
        self.predecessors.iter().position(|&p| p == pred)
    }
}

/// Control flow graph of one function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrControlFlowGraph {
    /// All live basic blocks, ordered by id
    pub blocks: BTreeMap<IrBlockId, IrBasicBlock>,

    /// Entry block ID
    pub entry_block: IrBlockId,

    /// Next available block ID; ids of removed blocks are never reused
    pub next_block_id: u32,
}

impl Default for IrControlFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl IrControlFlowGraph {
    /// Create a new CFG with an entry block
    pub fn new() -> Self {
        let mut blocks = BTreeMap::new();
        let entry_block = IrBlockId::entry();
        blocks.insert(entry_block, IrBasicBlock::new(entry_block));

        Self {
            blocks,
            entry_block,
            next_block_id: 1,
        }
    }

    /// Create a new basic block
    pub fn create_block(&mut self) -> IrBlockId {
        let id = IrBlockId::new(self.next_block_id);
        self.next_block_id += 1;
        self.blocks.insert(id, IrBasicBlock::new(id));
        id
    }

    /// Get a block by ID
    pub fn get_block(&self, id: IrBlockId) -> Option<&IrBasicBlock> {
        self.blocks.get(&id)
    }

    /// Get a mutable block by ID
    pub fn get_block_mut(&mut self, id: IrBlockId) -> Option<&mut IrBasicBlock> {
        self.blocks.get_mut(&id)
    }

    /// Block by id; panics on a stale id since that is a pass bug.
    pub fn block(&self, id: IrBlockId) -> &IrBasicBlock {
        match self.blocks.get(&id) {
            Some(block) => block,
            None => panic!("block {} is not part of the graph", id),
        }
    }

    pub fn block_mut(&mut self, id: IrBlockId) -> &mut IrBasicBlock {
        match self.blocks.get_mut(&id) {
            Some(block) => block,
            None => panic!("block {} is not part of the graph", id),
        }
    }

    /// Connect two blocks (update predecessors)
    pub fn connect_blocks(&mut self, from: IrBlockId, to: IrBlockId) {
        if let Some(to_block) = self.blocks.get_mut(&to) {
            if !to_block.predecessors.contains(&from) {
                to_block.predecessors.push(from);
            }
        }
    }

    /// Reverse postorder from the entry block.
    pub fn reverse_postorder(&self) -> Vec<IrBlockId> {
        let mut visited = std::collections::HashSet::new();
        let mut postorder = Vec::new();
        // Iterative DFS; the stack holds (block, next successor index).
        let mut stack: Vec<(IrBlockId, usize)> = vec![(self.entry_block, 0)];
        visited.insert(self.entry_block);

        while let Some((block, next)) = stack.pop() {
            let succs = self.block(block).successors();
            if next < succs.len() {
                stack.push((block, next + 1));
                let succ = succs[next];
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
            }
        }

        postorder.reverse();
        postorder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_block_creation() {
        let mut block = IrBasicBlock::new(IrBlockId::new(1));
        assert_eq!(block.id.0, 1);
        assert!(block.instructions.is_empty());
        assert!(!block.is_terminated());

        block.terminator = IrTerminator::Return { value: None };
        assert!(block.is_terminated());
        assert!(block.successors().is_empty());
    }

    #[test]
    fn test_reverse_postorder_diamond() {
        //      bb0
        //      / \
        //    bb1 bb2
        //      \ /
        //      bb3
        let mut cfg = IrControlFlowGraph::new();
        let bb1 = cfg.create_block();
        let bb2 = cfg.create_block();
        let bb3 = cfg.create_block();
        cfg.block_mut(IrBlockId::entry()).terminator = IrTerminator::IfImm {
            cond: IrId::new(0),
            cc: ConditionCode::Ne,
            imm: 0,
            true_target: bb1,
            false_target: bb2,
        };
        cfg.block_mut(bb1).terminator = IrTerminator::Goto { target: bb3 };
        cfg.block_mut(bb2).terminator = IrTerminator::Goto { target: bb3 };
        cfg.block_mut(bb3).terminator = IrTerminator::Return { value: None };

        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], IrBlockId::entry());
        assert_eq!(rpo[3], bb3);
    }

    #[test]
    fn test_terminator_rewrites() {
        let mut term = IrTerminator::IfImm {
            cond: IrId::new(4),
            cc: ConditionCode::Eq,
            imm: 0,
            true_target: IrBlockId::new(1),
            false_target: IrBlockId::new(2),
        };
        assert!(term.replace_use(IrId::new(4), IrId::new(9)));
        assert_eq!(term.uses().as_slice(), &[IrId::new(9)]);
        term.replace_target(IrBlockId::new(2), IrBlockId::new(5));
        match term {
            IrTerminator::IfImm { false_target, .. } => assert_eq!(false_target, IrBlockId::new(5)),
            _ => unreachable!(),
        }
    }
}
