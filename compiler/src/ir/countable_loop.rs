//! Countable Loop Parser
//!
//! Recognizes the canonical counted-loop shape:
//!
//! ```text
//! preheader:
//!   ...
//! header:
//!   $i = phi [$init, preheader], [$update, latch]
//!   ...
//! latch:
//!   $update = add $i, step          ; or sub, with a constant step
//!   $cmp    = compare cc $update, $test
//!   if_imm $cmp ne 0 -> header, exit
//! ```
//!
//! The exit may instead sit in the header, comparing `$i` itself against
//! `$test` before the body runs. Either way the result is a
//! [`CountableLoopInfo`] whose condition code is normalized to the relation
//! that keeps the loop running with the induction value on the left.

use super::blocks::{IrBlockId, IrTerminator};
use super::instructions::Opcode;
use super::loop_analysis::NaturalLoop;
use super::types::ConditionCode;
use super::{IrFunction, IrId};

/// Descriptor of a counted loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountableLoopInfo {
    /// Block whose `IfImm` leaves the loop
    pub exit_block: IrBlockId,
    /// The `Compare` feeding that branch
    pub compare: IrId,
    /// Induction phi in the header
    pub index: IrId,
    /// Value of the index on loop entry
    pub init: IrId,
    /// Loop-invariant bound the index is compared against
    pub test: IrId,
    /// `index +/- step`, flowing back along the back edge
    pub update: IrId,
    /// Absolute step
    pub const_step: u64,
    /// `index_side cc test` holds while the loop keeps running
    pub normalized_cc: ConditionCode,
    pub is_inc: bool,
    /// Exit test sits in the header and compares the phi itself
    pub head_exit: bool,
}

/// Parser bound to one loop of one function.
pub struct CountableLoopParser<'a> {
    function: &'a IrFunction,
    natural_loop: &'a NaturalLoop,
}

impl<'a> CountableLoopParser<'a> {
    pub fn new(function: &'a IrFunction, natural_loop: &'a NaturalLoop) -> Self {
        Self {
            function,
            natural_loop,
        }
    }

    /// Recognize the loop, or `None` if it does not have the counted shape.
    pub fn parse(&self) -> Option<CountableLoopInfo> {
        let lp = self.natural_loop;
        if lp.is_irreducible || lp.is_osr || lp.is_try_catch || lp.is_infinite {
            return None;
        }
        let back_edge = lp.single_back_edge()?;
        let preheader = lp.preheader?;

        let exit_block = match lp.exit_blocks.as_slice() {
            [only] => *only,
            _ => return None,
        };
        if exit_block != lp.header && exit_block != back_edge {
            return None;
        }
        let head_exit = exit_block == lp.header && exit_block != back_edge;

        let (cond, stay_when_holds) = self.exit_condition(exit_block)?;
        let compare = self.function.inst(cond);
        let cmp_cc = match compare.opcode {
            Opcode::Compare(cc) => cc,
            _ => return None,
        };
        let (lhs, rhs) = (compare.input(0), compare.input(1));
        if !self.function.inst(lhs).ty.is_integer() || !self.function.inst(rhs).ty.is_integer() {
            return None;
        }
        let loop_cc = if stay_when_holds { cmp_cc } else { cmp_cc.inverse() };

        // Header phi with exactly the preheader and back-edge operands.
        let header = self.function.block(lp.header);
        if header.predecessors.len() != 2 {
            return None;
        }
        let back_index = header.pred_index(back_edge)?;
        let entry_index = header.pred_index(preheader)?;

        let (index, init, update) = header.phis.iter().find_map(|&phi| {
            let inputs = &self.function.inst(phi).inputs;
            let update = inputs[back_index];
            let on_left = if head_exit { lhs == phi } else { lhs == update };
            let on_right = if head_exit { rhs == phi } else { rhs == update };
            (on_left || on_right).then(|| (phi, inputs[entry_index], update))
        })?;

        let (index_side_is_left, test) = if head_exit {
            if lhs == index { (true, rhs) } else { (false, lhs) }
        } else if lhs == update {
            (true, rhs)
        } else {
            (false, lhs)
        };
        if test == index || test == update || lp.contains(self.function.block_of(test)) {
            return None;
        }
        let normalized_cc = if index_side_is_left { loop_cc } else { loop_cc.swap() };

        if !lp.contains(self.function.block_of(update)) {
            return None;
        }
        let step = self.update_step(update, index)?;
        if step == 0 {
            return None;
        }
        let is_inc = step > 0;

        let acceptable = if is_inc {
            matches!(normalized_cc, ConditionCode::Lt | ConditionCode::Le)
        } else {
            matches!(normalized_cc, ConditionCode::Gt | ConditionCode::Ge)
        };
        if !acceptable {
            return None;
        }

        Some(CountableLoopInfo {
            exit_block,
            compare: cond,
            index,
            init,
            test,
            update,
            const_step: step.unsigned_abs(),
            normalized_cc,
            is_inc,
            head_exit,
        })
    }

    /// Compare id of the exit branch and whether the loop continues when
    /// that compare holds.
    fn exit_condition(&self, exit_block: IrBlockId) -> Option<(IrId, bool)> {
        let IrTerminator::IfImm {
            cond,
            cc,
            imm,
            true_target,
            false_target,
        } = self.function.block(exit_block).terminator
        else {
            return None;
        };
        let taken_when_holds = match (cc, imm) {
            (ConditionCode::Ne, 0) | (ConditionCode::Eq, 1) => true,
            (ConditionCode::Eq, 0) | (ConditionCode::Ne, 1) => false,
            _ => return None,
        };
        let stays_on_true = self.natural_loop.contains(true_target);
        if stays_on_true == self.natural_loop.contains(false_target) {
            return None;
        }
        Some((cond, taken_when_holds == stays_on_true))
    }

    /// Signed step of `update` relative to `index`.
    fn update_step(&self, update: IrId, index: IrId) -> Option<i64> {
        let inst = self.function.inst(update);
        if inst.inputs.len() != 2 {
            return None;
        }
        let (a, b) = (inst.input(0), inst.input(1));
        match inst.opcode {
            Opcode::Add if a == index => self.function.constant_value(b),
            Opcode::Add if b == index => self.function.constant_value(a),
            // `i - (-1)` counts up
            Opcode::Sub if a == index => self.function.constant_value(b).and_then(i64::checked_neg),
            _ => None,
        }
    }
}

/// Exact trip count of the loop body, when init and test are constants and
/// the index cannot overflow the compared type on the way there.
///
/// For a header exit this is the classic `for` count: `ceil((test - init) /
/// step)` for `<`, zero when the range is empty. A back-edge exit runs the
/// body once before the first test, so the count is at least one.
pub fn get_loop_iterations(function: &IrFunction, info: &CountableLoopInfo) -> Option<u64> {
    let init = function.constant_value(info.init)? as i128;
    let test = function.constant_value(info.test)? as i128;
    let step = info.const_step as i128;
    if step == 0 {
        return None;
    }

    // Distance the index must travel while the condition holds.
    let (distance, inclusive) = if info.is_inc {
        (test - init, info.normalized_cc == ConditionCode::Le)
    } else {
        (init - test, info.normalized_cc == ConditionCode::Ge)
    };

    let header_trips: i128 = if distance < 0 || (distance == 0 && !inclusive) {
        0
    } else if inclusive {
        distance / step + 1
    } else {
        (distance + step - 1) / step
    };

    let trips = if info.head_exit { header_trips } else { header_trips.max(1) };

    // The last update must still be representable in the compared type.
    let ty = function.inst(info.index).ty;
    let last = if info.is_inc { init + trips * step } else { init - trips * step };
    if last < ty.min_value() as i128 || last > ty.max_value() as i128 {
        return None;
    }
    u64::try_from(trips).ok()
}

/// Whether the preheader already guards loop entry with the same compare
/// the back edge performs, with `init` in place of the update.
pub fn has_pre_header_compare(function: &IrFunction, natural_loop: &NaturalLoop, info: &CountableLoopInfo) -> bool {
    let (Some(preheader), Some(back_edge)) = (natural_loop.preheader, natural_loop.single_back_edge()) else {
        return false;
    };
    if info.exit_block != back_edge {
        return false;
    }
    let IrTerminator::IfImm {
        cond: pre_cond,
        cc: pre_cc,
        imm: pre_imm,
        true_target: pre_true,
        false_target: pre_false,
    } = function.block(preheader).terminator
    else {
        return false;
    };
    let IrTerminator::IfImm {
        cc: back_cc,
        imm: back_imm,
        true_target: back_true,
        false_target: back_false,
        ..
    } = function.block(back_edge).terminator
    else {
        return false;
    };
    if pre_cc != back_cc || pre_imm != back_imm {
        return false;
    }

    // Same shape of control flow: the loop on one side, the shared exit on
    // the other.
    let header = natural_loop.header;
    let same_flow = (pre_true == header && back_true == header && pre_false == back_false)
        || (pre_false == header && back_false == header && pre_true == back_true);
    if !same_flow {
        return false;
    }

    let pre_cmp = function.inst(pre_cond);
    let back_cmp = function.inst(info.compare);
    if pre_cmp.opcode != back_cmp.opcode || !matches!(pre_cmp.opcode, Opcode::Compare(_)) {
        return false;
    }
    let test_pos = if back_cmp.input(0) == info.test { 0 } else { 1 };
    pre_cmp.input(test_pos) == info.test && pre_cmp.input(1 - test_pos) == info.init
}
