//! IR Validation
//!
//! Structural verification run after passes in debug pipelines and by the
//! CLI: CFG edge consistency, phi arity, retired-operand reads and SSA
//! dominance of every use.

use super::functions::IrFunction;
use super::instructions::Opcode;
use super::loop_analysis::DominatorTree;
use crate::error::{IrError, ValidationErrorKind};
use tracing::warn;

/// Verify `function`, returning the first violation found.
pub fn verify_function(function: &IrFunction) -> Result<(), IrError> {
    match collect_violations(function).into_iter().next() {
        None => Ok(()),
        Some(kind) => {
            warn!("{}: {}", function.name, kind);
            Err(IrError::Validation {
                function: function.name.clone(),
                kind,
            })
        }
    }
}

/// Every violation in `function`, in block order.
pub fn collect_violations(function: &IrFunction) -> Vec<ValidationErrorKind> {
    let mut errors = Vec::new();
    let cfg = &function.cfg;

    for (&id, block) in &cfg.blocks {
        if !block.is_terminated() {
            errors.push(ValidationErrorKind::Unterminated { block: id });
        }
        for succ in block.successors() {
            match cfg.get_block(succ) {
                None => errors.push(ValidationErrorKind::MissingSuccessor { block: id, target: succ }),
                Some(s) if !s.predecessors.contains(&id) => {
                    errors.push(ValidationErrorKind::PredecessorMismatch { block: succ, pred: id })
                }
                Some(_) => {}
            }
        }
        for &pred in &block.predecessors {
            let linked = cfg
                .get_block(pred)
                .map(|p| p.successors().contains(&id))
                .unwrap_or(false);
            if !linked {
                errors.push(ValidationErrorKind::PredecessorMismatch { block: id, pred });
            }
        }
        for &phi in &block.phis {
            let inputs = function.inst(phi).inputs.len();
            if inputs != block.predecessors.len() {
                errors.push(ValidationErrorKind::PhiArity {
                    phi,
                    inputs,
                    preds: block.predecessors.len(),
                });
            }
        }
        for &inst in block.phis.iter().chain(block.instructions.iter()) {
            if function.inst(inst).block != Some(id) {
                errors.push(ValidationErrorKind::BlockMismatch { inst, block: id });
            }
            for &input in &function.inst(inst).inputs {
                if !function.is_live(input) {
                    errors.push(ValidationErrorKind::RetiredInput { user: inst, input });
                }
            }
        }
    }

    if !errors.is_empty() {
        return errors;
    }

    let domtree = DominatorTree::compute(function);
    for (&id, block) in &cfg.blocks {
        for &inst in block.phis.iter().chain(block.instructions.iter()) {
            let data = function.inst(inst);
            for (k, &input) in data.inputs.iter().enumerate() {
                let ok = if data.opcode == Opcode::Phi {
                    block
                        .predecessors
                        .get(k)
                        .map(|&pred| domtree.dominates(function.block_of(input), pred))
                        .unwrap_or(false)
                } else {
                    domtree.inst_dominates(function, input, inst)
                };
                if !ok {
                    errors.push(ValidationErrorKind::UseNotDominated { user: inst, input });
                }
            }
        }
        for input in block.terminator.uses() {
            if !function.is_live(input) || !domtree.dominates(function.block_of(input), id) {
                errors.push(ValidationErrorKind::TerminatorUseNotDominated { block: id, input });
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::types::DataType;

    #[test]
    fn test_valid_function_passes() {
        let mut b = IrBuilder::new("ok");
        let p = b.parameter(0, DataType::Int32);
        let sum = b.binary(Opcode::Add, DataType::Int32, p, p);
        b.ret(Some(sum));
        let func = b.finish();
        assert!(verify_function(&func).is_ok());
    }

    #[test]
    fn test_use_before_def_is_reported() {
        let mut b = IrBuilder::new("bad");
        let p = b.parameter(0, DataType::Int32);
        let sum = b.binary(Opcode::Add, DataType::Int32, p, p);
        let mul = b.binary(Opcode::Mul, DataType::Int32, sum, sum);
        b.ret(Some(mul));
        let mut func = b.finish();
        func.inst_mut(sum).inputs[0] = mul;

        let errors = collect_violations(&func);
        assert!(errors.contains(&ValidationErrorKind::UseNotDominated { user: sum, input: mul }));
    }

    #[test]
    fn test_phi_arity_is_reported() {
        let mut b = IrBuilder::new("phi");
        let one = b.constant(1);
        let next = b.create_block();
        b.goto(next);
        b.switch_to_block(next);
        let phi = b.phi(DataType::Int64, &[one, one]);
        b.ret(Some(phi));
        let func = b.finish();

        assert!(matches!(
            verify_function(&func),
            Err(IrError::Validation { kind: ValidationErrorKind::PhiArity { .. }, .. })
        ));
    }
}
