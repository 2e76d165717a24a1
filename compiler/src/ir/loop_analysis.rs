//! Loop Analysis
//!
//! This module provides the loop infrastructure the optimizer passes consume:
//! - Dominator tree computation (iterative dataflow algorithm)
//! - Natural loop detection via back-edge identification
//! - Loop nesting info and the flags loop transforms must respect
//!   (irreducible, OSR, try/catch, infinite)

use super::{IrBlockId, IrControlFlowGraph, IrFunction, IrId};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Dominator tree for a function's control flow graph.
///
/// A block D dominates block B if every path from the entry to B goes through D.
/// The immediate dominator (idom) of B is the closest strict dominator.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// Immediate dominator for each block (entry block has no idom)
    idom: HashMap<IrBlockId, IrBlockId>,

    /// Children in the dominator tree
    children: HashMap<IrBlockId, Vec<IrBlockId>>,

    /// Dominator tree depth for each block (entry = 0)
    depth: HashMap<IrBlockId, usize>,

    /// Reachable blocks in reverse postorder
    rpo: Vec<IrBlockId>,

    /// Entry block of the function
    entry: IrBlockId,
}

impl DominatorTree {
    /// Compute the dominator tree for a function using iterative dataflow.
    ///
    /// This uses Cooper, Harvey, and Kennedy's simple iterative algorithm
    /// which is efficient for typical CFGs and easy to understand.
    pub fn compute(function: &IrFunction) -> Self {
        let cfg = &function.cfg;
        let entry = cfg.entry_block;

        let rpo = cfg.reverse_postorder();
        let rpo_index: HashMap<IrBlockId, usize> = rpo.iter()
            .enumerate()
            .map(|(i, &b)| (b, i))
            .collect();

        // Initialize idom: entry dominates itself, others undefined
        let mut idom: HashMap<IrBlockId, Option<IrBlockId>> = HashMap::new();
        for &block in &rpo {
            idom.insert(block, None);
        }
        idom.insert(entry, Some(entry));

        // Iterative dataflow until fixed point
        let mut changed = true;
        while changed {
            changed = false;

            for &block in &rpo {
                if block == entry {
                    continue;
                }

                let mut new_idom: Option<IrBlockId> = None;
                for &pred in &cfg.block(block).predecessors {
                    if idom.get(&pred).and_then(|x| *x).is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => Self::intersect(current, pred, &idom, &rpo_index),
                    });
                }

                if new_idom != idom[&block] {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }

        // Drop the entry's self-domination
        let mut final_idom: HashMap<IrBlockId, IrBlockId> = HashMap::new();
        for (&block, &dom) in &idom {
            if let Some(d) = dom {
                if block != entry {
                    final_idom.insert(block, d);
                }
            }
        }

        // Children in RPO order so walks are deterministic
        let mut children: HashMap<IrBlockId, Vec<IrBlockId>> = HashMap::new();
        for &block in &rpo {
            if let Some(&dom) = final_idom.get(&block) {
                children.entry(dom).or_default().push(block);
            }
        }

        // Compute depths via BFS from entry
        let mut depth: HashMap<IrBlockId, usize> = HashMap::new();
        depth.insert(entry, 0);
        let mut queue: VecDeque<IrBlockId> = VecDeque::new();
        queue.push_back(entry);

        while let Some(block) = queue.pop_front() {
            let d = depth[&block];
            for &child in children.get(&block).map(|v| v.as_slice()).unwrap_or(&[]) {
                depth.insert(child, d + 1);
                queue.push_back(child);
            }
        }

        Self {
            idom: final_idom,
            children,
            depth,
            rpo,
            entry,
        }
    }

    /// Find intersection of two dominators in the dominator tree.
    /// Uses the standard algorithm from Cooper, Harvey, and Kennedy.
    fn intersect(
        mut b1: IrBlockId,
        mut b2: IrBlockId,
        idom: &HashMap<IrBlockId, Option<IrBlockId>>,
        rpo_index: &HashMap<IrBlockId, usize>,
    ) -> IrBlockId {
        while b1 != b2 {
            let mut idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
            let mut idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);

            // Walk b1 up until it's at or before b2 in RPO
            while idx1 > idx2 {
                match idom.get(&b1) {
                    Some(Some(dom)) => {
                        b1 = *dom;
                        idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b1,
                }
            }

            // Walk b2 up until it's at or before b1 in RPO
            while idx2 > idx1 {
                match idom.get(&b2) {
                    Some(Some(dom)) => {
                        b2 = *dom;
                        idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b2,
                }
            }
        }
        b1
    }

    /// Get the immediate dominator of a block.
    pub fn idom(&self, block: IrBlockId) -> Option<IrBlockId> {
        self.idom.get(&block).copied()
    }

    /// Get children of a block in the dominator tree.
    pub fn children(&self, block: IrBlockId) -> &[IrBlockId] {
        self.children.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Get the depth of a block in the dominator tree.
    pub fn depth(&self, block: IrBlockId) -> usize {
        self.depth.get(&block).copied().unwrap_or(0)
    }

    /// Reachable blocks in reverse postorder.
    pub fn rpo(&self) -> &[IrBlockId] {
        &self.rpo
    }

    /// Check if block A dominates block B.
    pub fn dominates(&self, a: IrBlockId, b: IrBlockId) -> bool {
        if a == b {
            return true;
        }

        let mut current = b;
        while let Some(dom) = self.idom.get(&current) {
            if *dom == a {
                return true;
            }
            current = *dom;
        }

        // Entry block dominates everything
        a == self.entry
    }

    /// Check if block A strictly dominates block B (A dominates B and A != B).
    pub fn strictly_dominates(&self, a: IrBlockId, b: IrBlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Instruction-level dominance: `a` executes before `b` on every path.
    ///
    /// Within one block this is program order; phis precede the body.
    pub fn inst_dominates(&self, function: &IrFunction, a: IrId, b: IrId) -> bool {
        let block_a = function.block_of(a);
        let block_b = function.block_of(b);
        if block_a == block_b {
            return function.position_in_block(a) < function.position_in_block(b);
        }
        self.strictly_dominates(block_a, block_b)
    }
}

/// A natural loop in the control flow graph.
///
/// A natural loop is defined by back edges (edges from B to H where H dominates B).
/// The loop header is H, and the loop body contains all blocks from which a
/// back-edge source can be reached without going through H. Loops sharing a
/// header are merged, so a loop may carry several back edges.
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    /// Loop header block (entry point of the loop)
    pub header: IrBlockId,

    /// Back edge sources, in block-id order
    pub back_edges: Vec<IrBlockId>,

    /// All blocks in the loop body (including header and nested loops)
    pub blocks: BTreeSet<IrBlockId>,

    /// Exit blocks (blocks in the loop with edges outside the loop)
    pub exit_blocks: Vec<IrBlockId>,

    /// Unique predecessor of the header from outside the loop, if any
    pub preheader: Option<IrBlockId>,

    /// Nesting depth (0 = outermost)
    pub nesting_depth: usize,

    /// Parent loop header if this is a nested loop
    pub parent: Option<IrBlockId>,

    /// Child loop headers (directly nested loops)
    pub children: Vec<IrBlockId>,

    /// Loop body is entered other than through its header
    pub is_irreducible: bool,

    /// Header is an on-stack-replacement entry
    pub is_osr: bool,

    /// Some block of the loop lies in a try/catch region
    pub is_try_catch: bool,

    /// No edge leaves the loop
    pub is_infinite: bool,
}

impl NaturalLoop {
    pub fn contains(&self, block: IrBlockId) -> bool {
        self.blocks.contains(&block)
    }

    /// Only back edge, when there is exactly one.
    pub fn single_back_edge(&self) -> Option<IrBlockId> {
        match self.back_edges.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

/// Loop nest information for a function.
#[derive(Debug, Clone)]
pub struct LoopNestInfo {
    /// All natural loops indexed by header block
    pub loops: HashMap<IrBlockId, NaturalLoop>,

    /// Top-level loops (not nested in any other loop)
    pub top_level_loops: Vec<IrBlockId>,

    /// Map from block to its innermost containing loop header
    pub block_to_loop: HashMap<IrBlockId, IrBlockId>,

    /// Maximum nesting depth in the function
    pub max_depth: usize,

    /// Function contains control flow no natural loop describes
    pub has_irreducible: bool,
}

impl LoopNestInfo {
    /// Analyze loops in a function.
    pub fn analyze(function: &IrFunction, domtree: &DominatorTree) -> Self {
        let cfg = &function.cfg;
        let mut loops: HashMap<IrBlockId, NaturalLoop> = HashMap::new();

        // Find all back edges and create natural loops
        for (&block_id, block) in &cfg.blocks {
            for succ in block.successors() {
                // A back edge is an edge to a dominator
                if !domtree.dominates(succ, block_id) {
                    continue;
                }
                let loop_blocks = Self::find_loop_blocks(cfg, succ, block_id);
                match loops.get_mut(&succ) {
                    Some(existing) => {
                        existing.blocks.extend(loop_blocks);
                        if !existing.back_edges.contains(&block_id) {
                            existing.back_edges.push(block_id);
                        }
                    }
                    None => {
                        loops.insert(succ, NaturalLoop {
                            header: succ,
                            back_edges: vec![block_id],
                            blocks: loop_blocks,
                            exit_blocks: Vec::new(),
                            preheader: None,
                            nesting_depth: 0, // Computed after all loops found
                            parent: None,
                            children: Vec::new(),
                            is_irreducible: false,
                            is_osr: false,
                            is_try_catch: false,
                            is_infinite: false,
                        });
                    }
                }
            }
        }

        let irreducible_targets = Self::find_irreducible_entries(cfg, domtree);

        for natural_loop in loops.values_mut() {
            natural_loop.back_edges.sort();
            natural_loop.exit_blocks = Self::find_exit_blocks(cfg, &natural_loop.blocks);
            natural_loop.preheader = Self::find_preheader(cfg, natural_loop.header, &natural_loop.blocks);
            natural_loop.is_infinite = natural_loop.exit_blocks.is_empty();
            natural_loop.is_osr = cfg.block(natural_loop.header).metadata.osr_entry;
            natural_loop.is_try_catch = natural_loop
                .blocks
                .iter()
                .any(|&b| cfg.block(b).metadata.in_exception_handler);
            natural_loop.is_irreducible = natural_loop
                .blocks
                .iter()
                .any(|b| irreducible_targets.contains(b));
        }

        // Compute nesting relationships: the parent is the smallest
        // enclosing loop.
        let mut loop_headers: Vec<IrBlockId> = loops.keys().copied().collect();
        loop_headers.sort();
        for &header in &loop_headers {
            let mut parent: Option<IrBlockId> = None;
            for &other in &loop_headers {
                if other == header || !loops[&other].blocks.contains(&header) {
                    continue;
                }
                if loops[&header].blocks.contains(&other) {
                    continue;
                }
                let smaller = match parent {
                    None => true,
                    Some(p) => loops[&other].blocks.len() < loops[&p].blocks.len(),
                };
                if smaller {
                    parent = Some(other);
                }
            }
            if let Some(natural_loop) = loops.get_mut(&header) {
                natural_loop.parent = parent;
            }
        }

        // Build children lists
        for &header in &loop_headers {
            if let Some(parent) = loops[&header].parent {
                if let Some(parent_loop) = loops.get_mut(&parent) {
                    parent_loop.children.push(header);
                }
            }
        }

        // Compute nesting depths
        let top_level_loops: Vec<IrBlockId> = loop_headers.iter()
            .filter(|&&h| loops[&h].parent.is_none())
            .copied()
            .collect();

        fn set_depth(loops: &mut HashMap<IrBlockId, NaturalLoop>, header: IrBlockId, depth: usize) {
            let children = match loops.get_mut(&header) {
                Some(natural_loop) => {
                    natural_loop.nesting_depth = depth;
                    natural_loop.children.clone()
                }
                None => return,
            };
            for child in children {
                set_depth(loops, child, depth + 1);
            }
        }

        for &top_level in &top_level_loops {
            set_depth(&mut loops, top_level, 0);
        }

        let max_depth = loops.values().map(|l| l.nesting_depth).max().unwrap_or(0);

        // Build block-to-loop mapping (map each block to its innermost loop)
        let mut block_to_loop = HashMap::new();
        for (&header, loop_info) in &loops {
            for &block in &loop_info.blocks {
                match block_to_loop.get(&block) {
                    Some(&existing) if loops[&existing].nesting_depth >= loops[&header].nesting_depth => {}
                    _ => {
                        block_to_loop.insert(block, header);
                    }
                }
            }
        }

        Self {
            loops,
            top_level_loops,
            block_to_loop,
            max_depth,
            has_irreducible: !irreducible_targets.is_empty(),
        }
    }

    /// Find all blocks in a natural loop given header and back edge source.
    fn find_loop_blocks(
        cfg: &IrControlFlowGraph,
        header: IrBlockId,
        back_edge_source: IrBlockId,
    ) -> BTreeSet<IrBlockId> {
        let mut loop_blocks = BTreeSet::new();
        loop_blocks.insert(header);

        if header == back_edge_source {
            return loop_blocks;
        }

        // Work backwards from back_edge_source to find all blocks that can reach header
        let mut worklist = vec![back_edge_source];
        loop_blocks.insert(back_edge_source);

        while let Some(block) = worklist.pop() {
            if let Some(b) = cfg.get_block(block) {
                for &pred in &b.predecessors {
                    if loop_blocks.insert(pred) {
                        worklist.push(pred);
                    }
                }
            }
        }

        loop_blocks
    }

    /// Targets of retreating edges that are not back edges. Such a target is
    /// a second entry into a cycle.
    fn find_irreducible_entries(cfg: &IrControlFlowGraph, domtree: &DominatorTree) -> HashSet<IrBlockId> {
        let mut targets = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(IrBlockId, usize)> = vec![(cfg.entry_block, 0)];
        visited.insert(cfg.entry_block);
        on_stack.insert(cfg.entry_block);

        while let Some((block, next)) = stack.pop() {
            let succs = cfg.block(block).successors();
            if next >= succs.len() {
                on_stack.remove(&block);
                continue;
            }
            stack.push((block, next + 1));
            let succ = succs[next];
            if on_stack.contains(&succ) {
                if !domtree.dominates(succ, block) {
                    targets.insert(succ);
                }
            } else if visited.insert(succ) {
                on_stack.insert(succ);
                stack.push((succ, 0));
            }
        }

        targets
    }

    /// Find exit blocks (blocks in loop with successors outside loop).
    fn find_exit_blocks(cfg: &IrControlFlowGraph, loop_blocks: &BTreeSet<IrBlockId>) -> Vec<IrBlockId> {
        loop_blocks
            .iter()
            .copied()
            .filter(|&block| {
                cfg.get_block(block)
                    .map(|b| b.successors().iter().any(|s| !loop_blocks.contains(s)))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Find the preheader: the only predecessor of the header from outside
    /// the loop. It may branch elsewhere too, e.g. when it performs the
    /// loop-entry compare.
    fn find_preheader(
        cfg: &IrControlFlowGraph,
        header: IrBlockId,
        loop_blocks: &BTreeSet<IrBlockId>,
    ) -> Option<IrBlockId> {
        let header_block = cfg.get_block(header)?;

        let outside_preds: Vec<IrBlockId> = header_block.predecessors.iter()
            .filter(|p| !loop_blocks.contains(p))
            .copied()
            .collect();

        match outside_preds.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Get the innermost loop containing a block, if any.
    pub fn get_loop(&self, block: IrBlockId) -> Option<&NaturalLoop> {
        self.block_to_loop.get(&block).and_then(|h| self.loops.get(h))
    }

    /// Get loop depth for a block (0 if not in any loop).
    pub fn loop_depth(&self, block: IrBlockId) -> usize {
        self.get_loop(block).map(|l| l.nesting_depth + 1).unwrap_or(0)
    }

    /// Check if a block is a loop header.
    pub fn is_loop_header(&self, block: IrBlockId) -> bool {
        self.loops.contains_key(&block)
    }

    /// Iterate over all loops in order of nesting depth (outermost first).
    pub fn loops_by_depth(&self) -> Vec<&NaturalLoop> {
        let mut loops: Vec<&NaturalLoop> = self.loops.values().collect();
        loops.sort_by_key(|l| (l.nesting_depth, l.header));
        loops
    }

    /// Iterate over all loops in reverse nesting order (innermost first).
    pub fn loops_innermost_first(&self) -> Vec<&NaturalLoop> {
        let mut loops: Vec<&NaturalLoop> = self.loops.values().collect();
        loops.sort_by_key(|l| (std::cmp::Reverse(l.nesting_depth), l.header));
        loops
    }
}
