//! Grouped bounds checks and the deoptimization guards that replace them.
//!
//! Bounds checks that stay unresolved after the per-instruction visit are
//! grouped by `(loop, length, parent index)`, where every index in a group
//! is `parent + constant`. A group is then covered either by guards in the
//! loop preheader, checking the whole iteration space of a countable loop
//! once, or by a lower/upper guard pair in front of the first check of the
//! group.
//!
//! ```text
//! preheader:                               body:
//!   $g1 = compare lt ($init + min), 0        $lo = compare lt ($i + min), 0
//!   deoptimize_if $g1, $ssd                  deoptimize_if $lo, $ss
//!   $g2 = compare lt ($len - max), $test     $hi = compare ge ($i + max), $len
//!   deoptimize_if $g2, $ssd                  deoptimize_if $hi, $ss
//! ```

use super::Forwarding;
use crate::ir::bounds_analysis::{array_root, BoundsRange, BoundsRangeInfo};
use crate::ir::instructions::{InstFlags, Opcode};
use crate::ir::{ConditionCode, DataType, DeoptimizeType, IrBlockId, IrFunction, IrId};
use tracing::debug;

/// Groups bounds checks that one pair of guards can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) struct GroupKey {
    /// Innermost loop header, `None` outside loops
    pub loop_header: Option<IrBlockId>,
    /// The `len` operand shared by the checks
    pub len: IrId,
    /// Index the offsets are relative to, `None` for constant indices
    pub parent: Option<IrId>,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct GroupedCheck {
    pub check: IrId,
    pub offset: i64,
}

/// Split a bounds-check index into `parent + offset`.
pub(super) fn decompose_index(function: &IrFunction, index: IrId) -> (Option<IrId>, i64) {
    if let Some(c) = function.constant_value(index) {
        return (None, c);
    }
    let inst = function.inst(index);
    match inst.opcode {
        Opcode::Add => {
            let (lhs, rhs) = (inst.input(0), inst.input(1));
            if let Some(c) = function.constant_value(rhs) {
                return (Some(lhs), c);
            }
            if let Some(c) = function.constant_value(lhs) {
                return (Some(rhs), c);
            }
        }
        Opcode::Sub => {
            if let Some(c) = function.constant_value(inst.input(1)).and_then(i64::checked_neg) {
                return (Some(inst.input(0)), c);
            }
        }
        _ => {}
    }
    (Some(index), 0)
}

/// Value computed by a guard, built bottom-up when the guard is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Expr {
    Value(IrId),
    /// Length the plan works against (possibly hoisted)
    Len,
    Const(i64),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn plus(self, k: i64) -> Expr {
        if k == 0 {
            self
        } else {
            Expr::Add(Box::new(self), Box::new(Expr::Const(k)))
        }
    }

    fn minus(self, k: i64) -> Expr {
        if k == 0 {
            self
        } else {
            Expr::Sub(Box::new(self), Box::new(Expr::Const(k)))
        }
    }

    fn sub(self, other: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(other))
    }

    fn rem(self, other: Expr) -> Expr {
        Expr::Mod(Box::new(self), Box::new(other))
    }
}

/// Deoptimize when `lhs cc rhs` holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Guard {
    pub cc: ConditionCode,
    pub lhs: Expr,
    pub rhs: Expr,
}

impl Guard {
    fn new(cc: ConditionCode, lhs: Expr, rhs: Expr) -> Self {
        Self { cc, lhs, rhs }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Placement {
    /// Append to the block body (the preheader)
    BlockEnd(IrBlockId),
    /// Insert in front of an instruction
    Before(IrId),
}

/// Where the length compared against comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LenSource {
    Existing(IrId),
    /// Reload the length in the preheader behind a deoptimizing null check;
    /// `replaces` is the in-loop null check the new one stands in for.
    Hoisted { array: IrId, replaces: Option<IrId> },
}

#[derive(Debug, Clone)]
pub(super) struct GuardPlan {
    pub placement: Placement,
    pub save_state: IrId,
    pub ty: DataType,
    pub len: LenSource,
    pub guards: Vec<Guard>,
    pub checks: Vec<GroupedCheck>,
    /// Guards sit in front of the loop rather than inside it
    pub before_loop: bool,
}

fn offsets(checks: &[GroupedCheck]) -> (i64, i64) {
    let min = checks.iter().map(|c| c.offset).min().unwrap_or(0);
    let max = checks.iter().map(|c| c.offset).max().unwrap_or(0);
    (min, max)
}

/// `index` is known to stay below the length of `len`'s array.
fn tagged_below_len(function: &IrFunction, range: &BoundsRange, len: IrId) -> bool {
    function.opcode(len) == Opcode::LenArray
        && range.len_array() == Some(array_root(function, function.input(len, 0)))
}

/// Guards in the preheader covering every iteration of a countable loop.
/// `None` when the loop shape or the ranges do not allow it, or when a
/// guard would fire unconditionally.
pub(super) fn plan_before_loop(
    function: &IrFunction,
    bounds: &BoundsRangeInfo<'_>,
    key: &GroupKey,
    checks: &[GroupedCheck],
) -> Option<GuardPlan> {
    let header = key.loop_header?;
    let natural_loop = bounds.loops().loops.get(&header)?;
    let info = bounds.countable_loop(header)?;
    if key.parent != Some(info.index) || !(info.head_exit || bounds.has_pre_header_compare(header)) {
        return None;
    }
    let preheader = natural_loop.preheader?;
    let save_state = function
        .block(preheader)
        .instructions
        .iter()
        .copied()
        .find(|&id| function.opcode(id) == Opcode::SaveStateDeoptimize)?;

    let len = if natural_loop.contains(function.block_of(key.len)) {
        if function.opcode(key.len) != Opcode::LenArray {
            return None;
        }
        let array_input = function.input(key.len, 0);
        let array = array_root(function, array_input);
        if natural_loop.contains(function.block_of(array)) {
            return None;
        }
        let replaces = (array_input != array && natural_loop.contains(function.block_of(array_input)))
            .then_some(array_input);
        LenSource::Hoisted { array, replaces }
    } else {
        LenSource::Existing(key.len)
    };

    let ty = function.inst(info.index).ty;
    let step = i64::try_from(info.const_step).ok()?;
    let init = bounds.find_bounds_range(preheader, info.init);
    let test = bounds.find_bounds_range(preheader, info.test);
    let len_range = match len {
        LenSource::Existing(len) => bounds.find_bounds_range(preheader, len),
        LenSource::Hoisted { .. } => BoundsRange::new(0, i32::MAX as i64),
    };
    let test_is_len = function.opcode(info.test) == Opcode::LenArray
        && function.opcode(key.len) == Opcode::LenArray
        && array_root(function, function.input(info.test, 0)) == array_root(function, function.input(key.len, 0));
    let (min, max) = offsets(checks);
    let mut guards = Vec::new();

    if info.is_inc {
        let inclusive = info.normalized_cc == ConditionCode::Le;
        // init + min >= 0
        let lowest = init.left().checked_add(min)?;
        if lowest < ty.min_value() || init.right().checked_add(min)? < 0 {
            return None;
        }
        if lowest < 0 {
            guards.push(Guard::new(ConditionCode::Lt, Expr::Value(info.init).plus(min), Expr::Const(0)));
        }

        // last + max < len
        let cc = if inclusive { ConditionCode::Le } else { ConditionCode::Lt };
        if step == 1 {
            let last = if inclusive { test.right() } else { test.right().checked_sub(1)? };
            let provable = (test_is_len && !inclusive && max <= 0)
                || last.checked_add(max).is_some_and(|v| v < len_range.left());
            if !provable {
                guards.push(Guard::new(cc, Expr::Len.minus(max), Expr::Value(info.test)));
            }
        } else {
            // The update must not wrap past the type maximum.
            let limit = if inclusive { ty.max_value() - step } else { ty.max_value() - (step - 1) };
            if test.right() > limit {
                guards.push(Guard::new(ConditionCode::Lt, Expr::Const(limit), Expr::Value(info.test)));
            }
            if !(test_is_len && !inclusive && max <= 0) {
                let first = if inclusive { Expr::Value(info.init) } else { Expr::Value(info.init).plus(1) };
                let past_last =
                    Expr::Value(info.test).sub(Expr::Value(info.test).sub(first).rem(Expr::Const(step)));
                guards.push(Guard::new(cc, Expr::Len.minus(max), past_last));
            }
        }
    } else {
        let inclusive = info.normalized_cc == ConditionCode::Ge;
        // init + max < len
        let highest = init.right().checked_add(max)?;
        if highest > ty.max_value() || init.left().checked_add(max)? >= len_range.right() {
            return None;
        }
        if highest >= len_range.left() {
            guards.push(Guard::new(ConditionCode::Ge, Expr::Value(info.init).plus(max), Expr::Len));
        }

        // last + min >= 0, last >= test (+1 when exclusive)
        let adjust = if inclusive { min } else { min.checked_add(1)? };
        if test.left().checked_add(adjust).map_or(true, |v| v < 0) {
            guards.push(Guard::new(ConditionCode::Lt, Expr::Value(info.test).plus(adjust), Expr::Const(0)));
        }
        if step > 1 {
            let limit = if inclusive { ty.min_value() + step } else { ty.min_value() + (step - 1) };
            if test.left() < limit {
                guards.push(Guard::new(ConditionCode::Lt, Expr::Value(info.test), Expr::Const(limit)));
            }
        }
    }

    Some(GuardPlan {
        placement: Placement::BlockEnd(preheader),
        save_state,
        ty,
        len,
        guards,
        checks: checks.to_vec(),
        before_loop: true,
    })
}

/// Lower/upper guard pair in front of the first check of a group. Only
/// checks the first one dominates are covered.
pub(super) fn plan_in_loop(
    function: &IrFunction,
    bounds: &BoundsRangeInfo<'_>,
    key: &GroupKey,
    checks: &[GroupedCheck],
    min_group_size: usize,
) -> Option<GuardPlan> {
    let anchor = checks.first()?.check;
    let covered: Vec<GroupedCheck> = checks
        .iter()
        .copied()
        .filter(|c| bounds.domtree().inst_dominates(function, anchor, c.check))
        .collect();
    if covered.len() < min_group_size.max(1) {
        return None;
    }

    let block = function.block_of(anchor);
    let ty = function.inst(anchor).ty;
    let save_state = function.inst(anchor).save_state()?;
    let len_range = bounds.find_bounds_range(block, key.len);
    let (min, max) = offsets(&covered);
    let mut guards = Vec::new();

    match key.parent {
        Some(parent) => {
            let range = bounds.find_bounds_range(block, parent);
            let lowest = range.left().checked_add(min)?;
            let highest = range.right().checked_add(max)?;
            // Offsets applied to the parent must not wrap.
            if lowest < ty.min_value() || highest > ty.max_value() {
                return None;
            }
            if lowest < 0 {
                guards.push(Guard::new(ConditionCode::Lt, Expr::Value(parent).plus(min), Expr::Const(0)));
            }
            let below_len = highest < len_range.left() || (max <= 0 && tagged_below_len(function, &range, key.len));
            if !below_len {
                guards.push(Guard::new(ConditionCode::Ge, Expr::Value(parent).plus(max), Expr::Len));
            }
        }
        None => {
            if min < 0 {
                return None;
            }
            if max >= len_range.left() {
                guards.push(Guard::new(ConditionCode::Ge, Expr::Const(max), Expr::Len));
            }
        }
    }

    Some(GuardPlan {
        placement: Placement::Before(anchor),
        save_state,
        ty,
        len: LenSource::Existing(key.len),
        guards,
        checks: covered,
        before_loop: false,
    })
}

/// Builds guard instructions at one placement.
struct Emitter<'f> {
    function: &'f mut IrFunction,
    placement: Placement,
    ty: DataType,
    len: IrId,
}

impl Emitter<'_> {
    fn inst(&mut self, opcode: Opcode, ty: DataType, inputs: &[IrId]) -> IrId {
        match self.placement {
            Placement::BlockEnd(block) => self.function.append_inst(block, opcode, ty, inputs),
            Placement::Before(anchor) => self.function.insert_before(anchor, opcode, ty, inputs),
        }
    }

    fn expr(&mut self, expr: &Expr, forwarding: &Forwarding) -> IrId {
        match expr {
            Expr::Value(id) => forwarding.resolve(*id),
            Expr::Len => self.len,
            Expr::Const(v) => self.function.find_or_create_constant(*v, self.ty),
            Expr::Add(a, b) => self.binary(Opcode::Add, a, b, forwarding),
            Expr::Sub(a, b) => self.binary(Opcode::Sub, a, b, forwarding),
            Expr::Mod(a, b) => self.binary(Opcode::Mod, a, b, forwarding),
        }
    }

    fn binary(&mut self, op: Opcode, a: &Expr, b: &Expr, forwarding: &Forwarding) -> IrId {
        let lhs = self.expr(a, forwarding);
        let rhs = self.expr(b, forwarding);
        self.inst(op, self.ty, &[lhs, rhs])
    }
}

/// Materialize a plan: reload the length if needed, emit the guards and
/// drop the checks they cover. Returns the number of guards emitted.
pub(super) fn emit_plan(function: &mut IrFunction, plan: &GuardPlan, forwarding: &mut Forwarding) -> usize {
    let save_state = forwarding.resolve(plan.save_state);
    let len = match plan.len {
        LenSource::Existing(len) => forwarding.resolve(len),
        LenSource::Hoisted { array, replaces } => {
            let Placement::BlockEnd(preheader) = plan.placement else {
                return 0;
            };
            let array = forwarding.resolve(array);
            let null_check =
                function.append_inst(preheader, Opcode::NullCheck, DataType::Reference, &[array, save_state]);
            function.inst_mut(null_check).flags |= InstFlags::CAN_DEOPTIMIZE;
            let len = function.append_inst(preheader, Opcode::LenArray, DataType::Int32, &[null_check]);
            if let Some(old) = replaces {
                let old = forwarding.resolve(old);
                if function.is_live(old) && old != null_check {
                    function.replace_all_uses(old, null_check);
                    function.remove_inst(old);
                    forwarding.record(old, null_check);
                }
            }
            len
        }
    };

    let mut emitter = Emitter {
        function: &mut *function,
        placement: plan.placement,
        ty: plan.ty,
        len,
    };
    for guard in &plan.guards {
        let lhs = emitter.expr(&guard.lhs, forwarding);
        let rhs = emitter.expr(&guard.rhs, forwarding);
        let cond = emitter.inst(Opcode::Compare(guard.cc), DataType::Bool, &[lhs, rhs]);
        let deopt = emitter.inst(
            Opcode::DeoptimizeIf(DeoptimizeType::BoundsCheck),
            DataType::Void,
            &[cond, save_state],
        );
        emitter.function.inst_mut(deopt).flags |= InstFlags::CAN_DEOPTIMIZE;
    }

    for grouped in &plan.checks {
        let check = grouped.check;
        if !function.is_live(check) {
            continue;
        }
        let index = forwarding.resolve(function.input(check, 1));
        function.replace_all_uses(check, index);
        function.remove_inst(check);
        forwarding.record(check, index);
    }
    debug!(
        "{}: {} bounds checks covered by {} guards{}",
        function.name,
        plan.checks.len(),
        plan.guards.len(),
        if plan.before_loop { " before the loop" } else { "" }
    );
    plan.guards.len()
}
