//! Loop-Invariant Code Motion
//!
//! Moves instructions whose operands do not change across iterations into
//! the loop preheader. Pure arithmetic always qualifies; loads qualify when
//! no store or call in the loop may write the location they read. Checks,
//! division and anything flagged `NO_HOIST` stay where they are.

use super::alias_analysis::AliasAnalysis;
use super::instructions::{InstFlags, Opcode};
use super::loop_analysis::{DominatorTree, LoopNestInfo, NaturalLoop};
use super::optimization::{OptimizationPass, OptimizationResult};
use super::{IrBlockId, IrFunction, IrId};
use crate::config::LicmConfig;
use fxhash::FxHashSet;
use tracing::debug;

const PASS_NAME: &str = "licm";

pub struct Licm {
    config: LicmConfig,
}

impl Default for Licm {
    fn default() -> Self {
        Self::new(LicmConfig::default())
    }
}

impl Licm {
    pub fn new(config: LicmConfig) -> Self {
        Self { config }
    }

    /// Instructions of `natural_loop` that can move to its preheader, in an
    /// order where every definition precedes its uses.
    fn collect_invariants(
        &self,
        function: &IrFunction,
        natural_loop: &NaturalLoop,
        domtree: &DominatorTree,
        alias: Option<&AliasAnalysis<'_>>,
        claimed: &FxHashSet<IrId>,
    ) -> Vec<IrId> {
        let body: Vec<IrBlockId> = domtree
            .rpo()
            .iter()
            .copied()
            .filter(|b| natural_loop.contains(*b))
            .collect();

        let mut writers = Vec::new();
        let mut has_call = false;
        for &block in &body {
            for &id in &function.block(block).instructions {
                let opcode = function.opcode(id);
                if opcode.is_store() {
                    writers.push(id);
                } else if matches!(opcode, Opcode::CallStatic(_)) {
                    has_call = true;
                }
            }
        }

        let mut invariant: FxHashSet<IrId> = FxHashSet::default();
        let mut order = Vec::new();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in &body {
                let every_iteration = natural_loop
                    .back_edges
                    .iter()
                    .all(|&latch| domtree.dominates(block, latch));
                if !every_iteration {
                    continue;
                }
                for &id in &function.block(block).instructions {
                    if invariant.contains(&id) || claimed.contains(&id) {
                        continue;
                    }
                    let inst = function.inst(id);
                    if inst.flags.contains(InstFlags::NO_HOIST) {
                        continue;
                    }
                    let movable = if inst.opcode.is_pure_arithmetic() || inst.opcode == Opcode::LenArray {
                        true
                    } else if inst.opcode.is_load() && self.config.hoist_loads && !inst.is_volatile() {
                        match alias {
                            Some(alias) => {
                                !has_call && writers.iter().all(|&w| !alias.check_inst_alias(id, w).may_alias())
                            }
                            None => false,
                        }
                    } else {
                        false
                    };
                    if !movable {
                        continue;
                    }
                    let operands_invariant = inst
                        .inputs
                        .iter()
                        .all(|op| invariant.contains(op) || !natural_loop.contains(function.block_of(*op)));
                    if operands_invariant {
                        invariant.insert(id);
                        order.push(id);
                        changed = true;
                    }
                }
            }
        }
        order
    }
}

impl OptimizationPass for Licm {
    fn name(&self) -> &'static str {
        PASS_NAME
    }

    fn run_on_function(&self, function: &mut IrFunction) -> OptimizationResult {
        let mut result = OptimizationResult::unchanged();

        // Outer loops first: an instruction invariant in the outer loop
        // goes straight to the outermost preheader.
        let plans: Vec<(IrBlockId, Vec<IrId>)> = {
            let domtree = DominatorTree::compute(function);
            let loops = LoopNestInfo::analyze(function, &domtree);
            if loops.loops.is_empty() {
                return result;
            }
            let alias = if self.config.hoist_loads {
                let mut alias = AliasAnalysis::new(function);
                alias.run();
                Some(alias)
            } else {
                None
            };

            let mut claimed = FxHashSet::default();
            let mut plans = Vec::new();
            for natural_loop in loops.loops_by_depth() {
                if natural_loop.is_irreducible || natural_loop.is_osr || natural_loop.is_try_catch {
                    continue;
                }
                let Some(preheader) = natural_loop.preheader else {
                    continue;
                };
                let hoisted = self.collect_invariants(function, natural_loop, &domtree, alias.as_ref(), &claimed);
                if hoisted.is_empty() {
                    continue;
                }
                claimed.extend(hoisted.iter().copied());
                plans.push((preheader, hoisted));
            }
            plans
        };

        for (preheader, hoisted) in plans {
            for id in hoisted {
                function.move_to_block_end(id, preheader);
                let inst = function.inst(id);
                debug!("{}: hoisted {} {} to {}", function.name, inst.opcode, id, preheader);
                let (opcode, pc) = (inst.opcode, inst.pc);
                result.event(PASS_NAME, format!("{} hoisted out of loop", opcode), id, pc);
                result.count("instructions_hoisted");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::instructions::FieldId;
    use crate::ir::{ConditionCode, DataType};

    #[test]
    fn test_invariant_arithmetic_is_hoisted() {
        //   bb0 -> preheader -> header <-> body, header -> exit
        let mut b = IrBuilder::new("f");
        let x = b.parameter(0, DataType::Int32);
        let y = b.parameter(1, DataType::Int32);
        let zero = b.constant_typed(0, DataType::Int32);
        let ten = b.constant_typed(10, DataType::Int32);
        let lp = b.begin_counted_loop(zero, ten, ConditionCode::Lt, 1);
        let sum = b.binary(Opcode::Add, DataType::Int32, x, y);
        let twice = b.binary(Opcode::Mul, DataType::Int32, sum, sum);
        let varying = b.binary(Opcode::Add, DataType::Int32, twice, lp.index);
        let quotient = b.binary(Opcode::Div, DataType::Int32, x, y);
        b.call_static(1, DataType::Void, &[varying, quotient]);
        b.end_counted_loop(&lp);
        b.ret(None);
        let mut func = b.finish();

        let result = Licm::default().run_on_function(&mut func);
        assert_eq!(result.stats.get("instructions_hoisted"), Some(&2));
        assert_eq!(func.block_of(sum), lp.preheader);
        assert_eq!(func.block_of(twice), lp.preheader);
        assert_eq!(func.block_of(varying), lp.body);
        assert_eq!(func.block_of(quotient), lp.body);
        assert!(func.verify().is_ok());
    }

    #[test]
    fn test_load_hoisted_only_without_aliasing_store() {
        let build = |store_same_field: bool| {
            let mut b = IrBuilder::new("f");
            let obj = b.parameter(0, DataType::Reference);
            let zero = b.constant_typed(0, DataType::Int32);
            let ten = b.constant_typed(10, DataType::Int32);
            let lp = b.begin_counted_loop(zero, ten, ConditionCode::Lt, 1);
            let load = b.load_object(obj, FieldId(1), DataType::Int32);
            let field = if store_same_field { FieldId(1) } else { FieldId(2) };
            b.store_object(obj, field, lp.index);
            b.end_counted_loop(&lp);
            b.ret(None);
            (b.finish(), load, lp)
        };

        let (mut func, load, lp) = build(false);
        Licm::default().run_on_function(&mut func);
        assert_eq!(func.block_of(load), lp.preheader);

        let (mut func, load, lp) = build(true);
        Licm::default().run_on_function(&mut func);
        assert_eq!(func.block_of(load), lp.body);

        let (mut func, load, lp) = build(false);
        Licm::new(LicmConfig { hoist_loads: false }).run_on_function(&mut func);
        assert_eq!(func.block_of(load), lp.body);
    }

    #[test]
    fn test_no_hoist_flag_is_respected() {
        let mut b = IrBuilder::new("f");
        let x = b.parameter(0, DataType::Int32);
        let zero = b.constant_typed(0, DataType::Int32);
        let ten = b.constant_typed(10, DataType::Int32);
        let lp = b.begin_counted_loop(zero, ten, ConditionCode::Lt, 1);
        let neg = b.unary(Opcode::Neg, DataType::Int32, x);
        b.set_flags(neg, InstFlags::NO_HOIST);
        b.end_counted_loop(&lp);
        b.ret(None);
        let mut func = b.finish();

        let result = Licm::default().run_on_function(&mut func);
        assert!(!result.modified);
        assert_eq!(func.block_of(neg), lp.body);
    }
}
