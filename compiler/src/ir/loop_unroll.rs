//! Full Loop Unrolling
//!
//! Replaces a countable loop with a known, small trip count by straight-line
//! copies of its body in the preheader. Two shapes qualify:
//!
//! ```text
//!   head exit                    back-edge exit
//!   preheader                    preheader
//!       |                            |
//!    header <---+                 header <--+
//!     |   \     |                  |   \____|
//!   exit  body -+                exit
//! ```
//!
//! The header of a head-exit loop may only hold its phis and the exit
//! compare; a back-edge-exit loop is a single block.

use super::countable_loop::{get_loop_iterations, CountableLoopInfo, CountableLoopParser};
use super::loop_analysis::{DominatorTree, LoopNestInfo, NaturalLoop};
use super::optimization::{OptimizationPass, OptimizationResult};
use super::{IrBlockId, IrFunction, IrId, IrTerminator};
use crate::config::UnrollConfig;
use fxhash::FxHashMap;
use tracing::{debug, trace};

const PASS_NAME: &str = "loop-unroll";

/// A loop selected for unrolling.
#[derive(Debug, Clone)]
struct UnrollCandidate {
    header: IrBlockId,
    preheader: IrBlockId,
    exit: IrBlockId,
    /// Block whose body is copied once per iteration
    iteration_block: IrBlockId,
    head_exit: bool,
    trips: u64,
    index: IrId,
}

pub struct LoopUnroll {
    config: UnrollConfig,
}

impl Default for LoopUnroll {
    fn default() -> Self {
        Self::new(UnrollConfig::default())
    }
}

impl LoopUnroll {
    pub fn new(config: UnrollConfig) -> Self {
        Self { config }
    }

    fn find_candidate(&self, function: &IrFunction) -> Option<UnrollCandidate> {
        let domtree = DominatorTree::compute(function);
        let loops = LoopNestInfo::analyze(function, &domtree);
        loops
            .loops_innermost_first()
            .into_iter()
            .filter(|l| l.children.is_empty())
            .find_map(|l| {
                let info = CountableLoopParser::new(function, l).parse()?;
                self.check_shape(function, l, &info)
            })
    }

    fn check_shape(
        &self,
        function: &IrFunction,
        natural_loop: &NaturalLoop,
        info: &CountableLoopInfo,
    ) -> Option<UnrollCandidate> {
        let header = natural_loop.header;
        let preheader = natural_loop.preheader?;
        // A guarded entry may skip the loop entirely.
        if !matches!(function.block(preheader).terminator, IrTerminator::Goto { .. }) {
            return None;
        }
        let exit = function
            .block(info.exit_block)
            .successors()
            .into_iter()
            .find(|s| !natural_loop.contains(*s))?;
        if !function.block(exit).phis.is_empty() {
            return None;
        }

        let iteration_block = if info.head_exit {
            let [latch] = natural_loop.back_edges.as_slice() else {
                return None;
            };
            let header_block = function.block(header);
            let only_compare = header_block.instructions.as_slice() == [info.compare];
            let latch_block = function.block(*latch);
            if natural_loop.blocks.len() != 2 || !only_compare || latch_block.predecessors != [header] {
                return None;
            }
            *latch
        } else {
            if natural_loop.blocks.len() != 1 {
                return None;
            }
            header
        };

        let trips = get_loop_iterations(function, info)?;
        let body_len = function.block(iteration_block).instructions.len() as u64;
        if trips > self.config.max_trip_count || body_len.saturating_mul(trips) > self.config.max_instructions as u64 {
            trace!(
                "{}: loop {} not unrolled ({} trips, {} instructions)",
                function.name,
                header,
                trips,
                body_len
            );
            return None;
        }

        Some(UnrollCandidate {
            header,
            preheader,
            exit,
            iteration_block,
            head_exit: info.head_exit,
            trips,
            index: info.index,
        })
    }

    /// Copy the body `trips` times into the preheader and bypass the loop.
    /// Returns the number of blocks removed.
    fn unroll(function: &mut IrFunction, candidate: &UnrollCandidate) -> usize {
        let header = function.block(candidate.header);
        let entry_index = header.pred_index(candidate.preheader);
        let back_index = header.pred_index(candidate.iteration_block);
        let (Some(entry_index), Some(back_index)) = (entry_index, back_index) else {
            return 0;
        };
        let phis = header.phis.clone();
        let body = function.block(candidate.iteration_block).instructions.clone();

        let mut current: FxHashMap<IrId, IrId> =
            phis.iter().map(|&phi| (phi, function.input(phi, entry_index))).collect();
        let mut copies: FxHashMap<IrId, IrId> = FxHashMap::default();
        let mut phi_at_exit = current.clone();

        for _ in 0..candidate.trips {
            copies.clear();
            phi_at_exit = current.clone();
            for &id in &body {
                let inst = function.inst(id);
                let (opcode, ty, flags, pc) = (inst.opcode, inst.ty, inst.flags, inst.pc);
                let inputs: Vec<IrId> = inst
                    .inputs
                    .iter()
                    .map(|op| copies.get(op).or_else(|| current.get(op)).copied().unwrap_or(*op))
                    .collect();
                let copy = function.append_inst(candidate.preheader, opcode, ty, &inputs);
                let copy_inst = function.inst_mut(copy);
                copy_inst.flags = flags;
                copy_inst.pc = pc;
                copies.insert(id, copy);
            }
            current = phis
                .iter()
                .map(|&phi| {
                    let incoming = function.input(phi, back_index);
                    let value = copies.get(&incoming).or_else(|| current.get(&incoming)).copied();
                    (phi, value.unwrap_or(incoming))
                })
                .collect();
        }
        if candidate.head_exit {
            phi_at_exit = current;
        }

        // Values observed after the loop.
        for &phi in &phis {
            if let Some(&value) = phi_at_exit.get(&phi) {
                function.replace_all_uses(phi, value);
            }
        }
        if !candidate.head_exit {
            for &id in &body {
                if let Some(&copy) = copies.get(&id) {
                    function.replace_all_uses(id, copy);
                }
            }
        }

        function.set_terminator(candidate.preheader, IrTerminator::Goto { target: candidate.exit });
        function.remove_unreachable_blocks()
    }
}

impl OptimizationPass for LoopUnroll {
    fn name(&self) -> &'static str {
        PASS_NAME
    }

    fn run_on_function(&self, function: &mut IrFunction) -> OptimizationResult {
        let mut result = OptimizationResult::unchanged();
        // Every unrolled loop disappears, so this terminates.
        while let Some(candidate) = self.find_candidate(function) {
            let pc = function.inst(candidate.index).pc;
            let removed = Self::unroll(function, &candidate);
            if removed == 0 {
                break;
            }
            debug!(
                "{}: unrolled loop {} ({} iterations)",
                function.name,
                candidate.header,
                candidate.trips
            );
            result.event(PASS_NAME, format!("loop unrolled {} times", candidate.trips), candidate.index, pc);
            result.blocks_eliminated += removed;
            result.count("loops_unrolled");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::instructions::Opcode;
    use crate::ir::{ConditionCode, DataType};

    /// `sum = 0; for (i = 0; i < n; i++) sum += i; return sum`
    fn sum_loop(n: i64) -> (IrFunction, IrBlockId) {
        let mut b = IrBuilder::new("sum");
        let zero = b.constant_typed(0, DataType::Int32);
        let limit = b.constant_typed(n, DataType::Int32);
        let lp = b.begin_counted_loop(zero, limit, ConditionCode::Lt, 1);
        let header = lp.header;
        b.switch_to_block(header);
        let sum = b.phi(DataType::Int32, &[zero]);
        b.switch_to_block(lp.body);
        let next = b.binary(Opcode::Add, DataType::Int32, sum, lp.index);
        b.end_counted_loop(&lp);
        b.add_phi_input(sum, next);
        b.ret(Some(sum));
        (b.finish(), header)
    }

    #[test]
    fn test_small_loop_is_fully_unrolled() {
        let (mut func, header) = sum_loop(4);
        let result = LoopUnroll::default().run_on_function(&mut func);

        assert_eq!(result.stats.get("loops_unrolled"), Some(&1));
        assert!(func.cfg.get_block(header).is_none());
        let adds = func.live_insts().filter(|i| i.opcode == Opcode::Add).count();
        // Four sum updates plus four index updates.
        assert_eq!(adds, 8);
        assert!(func.verify().is_ok());
    }

    #[test]
    fn test_zero_trip_loop_forwards_initial_values() {
        let (mut func, _) = sum_loop(0);
        LoopUnroll::default().run_on_function(&mut func);
        let exit = func
            .cfg
            .blocks
            .values()
            .find(|b| matches!(b.terminator, IrTerminator::Return { .. }))
            .map(|b| b.terminator.clone());
        let Some(IrTerminator::Return { value: Some(value) }) = exit else {
            panic!("expected return with a value");
        };
        assert_eq!(func.constant_value(value), Some(0));
    }

    #[test]
    fn test_trip_count_limit() {
        let (mut func, header) = sum_loop(100);
        let result = LoopUnroll::default().run_on_function(&mut func);
        assert!(!result.modified);
        assert!(func.cfg.get_block(header).is_some());

        let (mut func, _) = sum_loop(100);
        let config = UnrollConfig {
            max_trip_count: 100,
            max_instructions: 1000,
        };
        assert!(LoopUnroll::new(config).run_on_function(&mut func).modified);
    }

    #[test]
    fn test_unknown_trip_count_is_left_alone() {
        let mut b = IrBuilder::new("f");
        let n = b.parameter(0, DataType::Int32);
        let zero = b.constant_typed(0, DataType::Int32);
        let lp = b.begin_counted_loop(zero, n, ConditionCode::Lt, 1);
        b.end_counted_loop(&lp);
        b.ret(None);
        let mut func = b.finish();

        assert!(!LoopUnroll::default().run_on_function(&mut func).modified);
    }
}
