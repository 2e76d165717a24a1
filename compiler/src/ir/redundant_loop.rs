//! Redundant Loop Elimination
//!
//! A countable loop always terminates. When nothing inside it has an
//! observable effect and none of its values is read after it, running it
//! changes nothing, so the preheader can branch straight to the exit.

use super::countable_loop::CountableLoopParser;
use super::loop_analysis::{DominatorTree, LoopNestInfo, NaturalLoop};
use super::optimization::{OptimizationPass, OptimizationResult};
use super::{IrBlockId, IrFunction, IrTerminator, IrUser};
use tracing::debug;

const PASS_NAME: &str = "redundant-loop-elimination";

#[derive(Default)]
pub struct RedundantLoopElimination;

impl RedundantLoopElimination {
    pub fn new() -> Self {
        Self
    }

    /// `(header, preheader, exit)` of the first loop that can go.
    fn find_redundant(function: &IrFunction) -> Option<(IrBlockId, IrBlockId, IrBlockId)> {
        let domtree = DominatorTree::compute(function);
        let loops = LoopNestInfo::analyze(function, &domtree);
        // Outer loops first: removing one takes its children with it.
        loops.loops_by_depth().into_iter().find_map(|l| {
            let info = CountableLoopParser::new(function, l).parse()?;
            let preheader = l.preheader?;
            let exit = function
                .block(info.exit_block)
                .successors()
                .into_iter()
                .find(|s| !l.contains(*s))?;
            let removable = Self::single_exit(function, l, exit)
                && function.block(exit).phis.is_empty()
                && Self::has_no_effects(function, l)
                && Self::values_stay_inside(function, l);
            removable.then_some((l.header, preheader, exit))
        })
    }

    fn single_exit(function: &IrFunction, natural_loop: &NaturalLoop, exit: IrBlockId) -> bool {
        natural_loop.blocks.iter().all(|&b| {
            function
                .block(b)
                .successors()
                .iter()
                .all(|s| natural_loop.contains(*s) || *s == exit)
        })
    }

    fn has_no_effects(function: &IrFunction, natural_loop: &NaturalLoop) -> bool {
        natural_loop.blocks.iter().all(|&b| {
            let block = function.block(b);
            let returns = matches!(
                block.terminator,
                IrTerminator::Return { .. } | IrTerminator::Deoptimize { .. }
            );
            !returns
                && block.instructions.iter().all(|&id| {
                    let opcode = function.opcode(id);
                    // Save states only describe frames; they die with the loop.
                    opcode.is_save_state() || !opcode.has_side_effects()
                })
        })
    }

    fn values_stay_inside(function: &IrFunction, natural_loop: &NaturalLoop) -> bool {
        natural_loop.blocks.iter().all(|&b| {
            let block = function.block(b);
            block.phis.iter().chain(block.instructions.iter()).all(|&id| {
                function.users_of(id).into_iter().all(|user| match user {
                    IrUser::Inst(user) => natural_loop.contains(function.block_of(user)),
                    IrUser::Terminator(block) => natural_loop.contains(block),
                })
            })
        })
    }
}

impl OptimizationPass for RedundantLoopElimination {
    fn name(&self) -> &'static str {
        PASS_NAME
    }

    fn run_on_function(&self, function: &mut IrFunction) -> OptimizationResult {
        let mut result = OptimizationResult::unchanged();
        while let Some((header, preheader, exit)) = Self::find_redundant(function) {
            let mut terminator = function.block(preheader).terminator.clone();
            terminator.replace_target(header, exit);
            // A guarded entry now branches to the exit either way.
            if matches!(terminator, IrTerminator::IfImm { true_target, false_target, .. }
                if true_target == exit && false_target == exit)
            {
                terminator = IrTerminator::Goto { target: exit };
            }
            let anchor = function.block(header).phis.first().copied();
            function.set_terminator(preheader, terminator);

            let before = function.live_insts().count();
            let blocks = function.remove_unreachable_blocks();
            if blocks == 0 {
                break;
            }
            let removed = before - function.live_insts().count();
            debug!(
                "{}: removed redundant loop {} ({} blocks, {} instructions)",
                function.name, header, blocks, removed
            );
            if let Some(phi) = anchor {
                let pc = function.inst(phi).pc;
                result.event(PASS_NAME, "redundant loop removed", phi, pc);
            } else {
                result.modified = true;
            }
            result.blocks_eliminated += blocks;
            result.instructions_eliminated += removed;
            result.count("loops_removed");
        }
        result
    }
}
