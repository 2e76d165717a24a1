//! Checks Elimination Pass
//!
//! Removes runtime checks the graph already guarantees, and turns the rest
//! into cheaper deoptimization guards where it can. One run goes through
//! these stages, each behind a config flag:
//!
//! 1. Visit every instruction in RPO. A check is removed when an identical
//!    check dominates it, when it directly guards the result of an
//!    identical check, or when bounds ranges / object types prove it. A
//!    check proven to always fail goes on the must-throw list; the rest are
//!    queued for hoisting or grouped (bounds checks).
//! 2. Cover grouped bounds checks of countable loops with guards in the
//!    preheader, and move loop-invariant checks into the preheader.
//! 3. Cover the remaining groups with a guard pair inside the loop.
//! 4. Replace must-throw checks by an unconditional deoptimization.
//!
//! Decisions are taken against the unmodified graph and applied afterwards,
//! so every analysis sees one consistent function.

mod loop_guards;

use super::bounds_analysis::{array_root, BoundsRange, BoundsRangeInfo};
use super::instructions::{InstFlags, Opcode, TypeId};
use super::object_type::ObjectTypeInfo;
use super::optimization::{OptimizationPass, OptimizationResult};
use super::{DataType, IrBlockId, IrFunction, IrId, IrTerminator, IrUser};
use crate::config::{ChecksEliminationConfig, DominanceMode};
use fxhash::FxHashMap;
use indexmap::IndexMap;
use loop_guards::{GroupKey, GroupedCheck, GuardPlan};
use smallvec::SmallVec;
use tracing::{debug, trace};

pub(crate) const PASS_NAME: &str = "checks-elimination";

/// Replacements of retired instructions, followed transitively.
#[derive(Debug, Default)]
struct Forwarding {
    map: FxHashMap<IrId, IrId>,
}

impl Forwarding {
    fn record(&mut self, old: IrId, new: IrId) {
        if old != new {
            self.map.insert(old, new);
        }
    }

    fn resolve(&self, mut id: IrId) -> IrId {
        while let Some(&next) = self.map.get(&id) {
            id = next;
        }
        id
    }
}

/// Identity of a check for dominated-check removal: opcode, result type
/// and checked operands (save state excluded).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CheckKey {
    opcode: Opcode,
    ty: DataType,
    operands: SmallVec<[IrId; 2]>,
}

impl CheckKey {
    fn of(function: &IrFunction, id: IrId) -> Self {
        let inst = function.inst(id);
        let checked = inst.inputs.len().saturating_sub(1);
        let mut operands: SmallVec<[IrId; 2]> = inst.inputs[..checked].iter().copied().collect();
        if inst.opcode == Opcode::AddOverflowCheck {
            operands.sort();
        }
        Self {
            opcode: inst.opcode,
            ty: inst.ty,
            operands,
        }
    }
}

/// Outcome of trying to prove a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Always passes; `narrowed` when the proof relied on a branch condition
    Redundant { narrowed: bool },
    /// Always fails
    MustThrow,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct Removal {
    check: IrId,
    /// Value the check's users read instead, `None` for void checks
    replacement: Option<IrId>,
    /// Users must stay where the proof holds
    no_hoist: bool,
    reason: &'static str,
}

/// Everything the visit decided, applied in one go afterwards.
#[derive(Debug, Default)]
struct Decisions {
    removals: Vec<Removal>,
    folds: Vec<(IrId, i64)>,
    /// Overflow checks that become plain arithmetic
    arithmetic: Vec<(IrId, Opcode)>,
    omit_null_check: Vec<IrId>,
    must_throw: Vec<IrId>,
    hoist: Vec<(IrId, IrBlockId)>,
    groups: IndexMap<GroupKey, Vec<GroupedCheck>>,
    before_loop: Vec<GuardPlan>,
    in_loop: Vec<GuardPlan>,
}

/// Checks elimination pass
pub struct ChecksElimination {
    config: ChecksEliminationConfig,
}

impl Default for ChecksElimination {
    fn default() -> Self {
        Self::new(ChecksEliminationConfig::default())
    }
}

impl ChecksElimination {
    pub fn new(config: ChecksEliminationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChecksEliminationConfig {
        &self.config
    }
}

impl OptimizationPass for ChecksElimination {
    fn name(&self) -> &'static str {
        PASS_NAME
    }

    fn run_on_function(&self, function: &mut IrFunction) -> OptimizationResult {
        let decisions = {
            let mut visitor = Visitor::new(function, &self.config);
            visitor.visit_graph();
            visitor.plan_loop_stages();
            visitor.decisions
        };
        apply(function, decisions)
    }
}

/// Per-run analysis context over the unmodified function.
struct Visitor<'a> {
    function: &'a IrFunction,
    config: &'a ChecksEliminationConfig,
    bounds: BoundsRangeInfo<'a>,
    types: ObjectTypeInfo,
    dominating: FxHashMap<CheckKey, Vec<IrId>>,
    decisions: Decisions,
}

impl<'a> Visitor<'a> {
    fn new(function: &'a IrFunction, config: &'a ChecksEliminationConfig) -> Self {
        Self {
            function,
            config,
            bounds: BoundsRangeInfo::compute(function),
            types: ObjectTypeInfo::compute(function),
            dominating: FxHashMap::default(),
            decisions: Decisions::default(),
        }
    }

    fn visit_graph(&mut self) {
        let function = self.function;
        let rpo = self.bounds.domtree().rpo().to_vec();
        for block in rpo {
            for &id in &function.block(block).instructions {
                let opcode = function.opcode(id);
                if opcode.is_check() {
                    self.visit_check(block, id);
                } else if let Opcode::IsInstance(class) = opcode {
                    self.visit_is_instance(block, id, class);
                }
            }
        }
        trace!(
            "{}: {} removals, {} must-throw, {} hoist candidates, {} bounds groups",
            function.name,
            self.decisions.removals.len(),
            self.decisions.must_throw.len(),
            self.decisions.hoist.len(),
            self.decisions.groups.len()
        );
    }

    fn remove(&mut self, check: IrId, replacement: Option<IrId>, no_hoist: bool, reason: &'static str) {
        debug!("{}: remove {} {} ({})", self.function.name, self.function.opcode(check), check, reason);
        self.decisions.removals.push(Removal {
            check,
            replacement,
            no_hoist,
            reason,
        });
    }

    fn visit_check(&mut self, block: IrBlockId, id: IrId) {
        let function = self.function;
        let inst = function.inst(id);

        // A check guarding the result of an identical check.
        if let Some(operand) = inst.forwarded() {
            let operand_inst = function.inst(operand);
            let same_len = inst.opcode != Opcode::BoundsCheck || operand_inst.input(0) == inst.input(0);
            if operand_inst.opcode == inst.opcode && operand_inst.ty == inst.ty && same_len {
                self.remove(id, Some(operand), false, "consecutive");
                return;
            }
        }

        let key = CheckKey::of(function, id);
        if let Some(dominator) = self.find_dominating(&key, id) {
            let replacement = (inst.ty != DataType::Void).then_some(dominator);
            self.remove(id, replacement, false, "dominated");
            return;
        }
        self.dominating.entry(key).or_default().push(id);

        match inst.opcode {
            Opcode::AddOverflowCheck | Opcode::SubOverflowCheck => {
                self.visit_overflow_check(block, id);
                return;
            }
            Opcode::CheckCast(_) => self.mark_omit_null_check(block, id),
            _ => {}
        }

        match self.verdict(block, id) {
            Verdict::Redundant { narrowed } => {
                let replacement = inst.forwarded();
                self.remove(id, replacement, narrowed, "proven");
            }
            Verdict::MustThrow => {
                if self.config.must_throw_deoptimization {
                    debug!("{}: {} {} always fails", function.name, inst.opcode, id);
                    self.decisions.must_throw.push(id);
                }
            }
            Verdict::Unknown => self.defer(block, id),
        }
    }

    fn find_dominating(&self, key: &CheckKey, id: IrId) -> Option<IrId> {
        let candidates = self.dominating.get(key)?;
        let function = self.function;
        candidates.iter().copied().find(|&candidate| match self.config.dominance {
            DominanceMode::Block => {
                function.block_of(candidate) == function.block_of(id)
                    && function.position_in_block(candidate) < function.position_in_block(id)
            }
            DominanceMode::Tree => self.bounds.domtree().inst_dominates(function, candidate, id),
        })
    }

    fn verdict(&self, block: IrBlockId, id: IrId) -> Verdict {
        let function = self.function;
        let inst = function.inst(id);
        let range = |value: IrId| self.bounds.find_bounds_range_with_origin(block, value);

        match inst.opcode {
            Opcode::NullCheck => {
                let object = inst.input(0);
                if self.types.is_null(object) {
                    return Verdict::MustThrow;
                }
                if self.types.exact_class(object).is_some() {
                    return Verdict::Redundant { narrowed: false };
                }
                let (r, narrowed) = range(object);
                if r.is_positive() {
                    Verdict::Redundant { narrowed }
                } else if r.is_const() == Some(0) {
                    Verdict::MustThrow
                } else {
                    Verdict::Unknown
                }
            }
            Opcode::ZeroCheck => {
                let (r, narrowed) = range(inst.input(0));
                if !r.contains(0) {
                    Verdict::Redundant { narrowed }
                } else if r.is_const() == Some(0) {
                    Verdict::MustThrow
                } else {
                    Verdict::Unknown
                }
            }
            Opcode::NegativeCheck => {
                let (r, narrowed) = range(inst.input(0));
                if r.is_not_negative() {
                    Verdict::Redundant { narrowed }
                } else if r.is_negative() {
                    Verdict::MustThrow
                } else {
                    Verdict::Unknown
                }
            }
            Opcode::NotPositiveCheck => {
                let (r, narrowed) = range(inst.input(0));
                if r.is_positive() {
                    Verdict::Redundant { narrowed }
                } else if r.right() <= 0 {
                    Verdict::MustThrow
                } else {
                    Verdict::Unknown
                }
            }
            Opcode::NegOverflowAndZeroCheck => {
                let (r, narrowed) = range(inst.input(0));
                let min = inst.ty.min_value();
                if !r.contains(0) && !r.contains(min) {
                    Verdict::Redundant { narrowed }
                } else if r.is_const() == Some(0) || r.is_const() == Some(min) {
                    Verdict::MustThrow
                } else {
                    Verdict::Unknown
                }
            }
            Opcode::BoundsCheck => {
                let len = inst.input(0);
                let (index, index_narrowed) = range(inst.input(1));
                let (len_range, len_narrowed) = range(len);
                if index.is_negative() || index.left() >= len_range.right() {
                    return Verdict::MustThrow;
                }
                if !index.is_not_negative() {
                    return Verdict::Unknown;
                }
                let below_len = index.is_less(&len_range);
                let tagged = function.opcode(len) == Opcode::LenArray
                    && index.len_array() == Some(array_root(function, function.input(len, 0)));
                if below_len || tagged {
                    Verdict::Redundant {
                        narrowed: index_narrowed || len_narrowed,
                    }
                } else {
                    Verdict::Unknown
                }
            }
            Opcode::RefTypeCheck => {
                // Storing null never violates the element type.
                let (r, _) = range(inst.input(1));
                if r.is_const() == Some(0) {
                    Verdict::Redundant { narrowed: false }
                } else {
                    Verdict::Unknown
                }
            }
            Opcode::CheckCast(class) => {
                let object = inst.input(0);
                if self.types.is_null(object) || self.types.exact_class(object) == Some(class) {
                    Verdict::Redundant { narrowed: false }
                } else if self.dominated_by_is_instance(block, object, class) {
                    Verdict::Redundant { narrowed: true }
                } else {
                    Verdict::Unknown
                }
            }
            _ => Verdict::Unknown,
        }
    }

    fn visit_overflow_check(&mut self, block: IrBlockId, id: IrId) {
        let function = self.function;
        let inst = function.inst(id);
        let lhs = self.bounds.find_bounds_range(block, inst.input(0));
        let rhs = self.bounds.find_bounds_range(block, inst.input(1));
        let (result, plain) = match inst.opcode {
            Opcode::AddOverflowCheck => (lhs.add(&rhs), Opcode::Add),
            _ => (lhs.sub(&rhs), Opcode::Sub),
        };
        let type_range = BoundsRange::for_type(inst.ty);
        if result.is_within(&type_range) {
            debug!("{}: {} {} cannot overflow", function.name, inst.opcode, id);
            self.decisions.arithmetic.push((id, plain));
        } else if type_range.intersect(&result).is_none() {
            if self.config.must_throw_deoptimization {
                self.decisions.must_throw.push(id);
            }
        }
    }

    fn visit_is_instance(&mut self, block: IrBlockId, id: IrId, class: TypeId) {
        let object = self.function.input(id, 0);
        if self.types.is_null(object) {
            self.decisions.folds.push((id, 0));
        } else if self.types.exact_class(object) == Some(class) {
            self.decisions.folds.push((id, 1));
        } else {
            self.mark_omit_null_check(block, id);
        }
    }

    /// Flag a type check whose object a dominating null check (or the
    /// ranges) already proved non-null.
    fn mark_omit_null_check(&mut self, block: IrBlockId, id: IrId) {
        let function = self.function;
        let inst = function.inst(id);
        if inst.flags.contains(InstFlags::OMIT_NULL_CHECK) {
            return;
        }
        let object = inst.input(0);
        let key = CheckKey {
            opcode: Opcode::NullCheck,
            ty: DataType::Reference,
            operands: SmallVec::from_slice(&[object]),
        };
        if self.find_dominating(&key, id).is_some() || self.bounds.is_inst_not_null(block, object) {
            self.decisions.omit_null_check.push(id);
        }
    }

    /// `block` is only reached when `IsInstance(class)` held for `object`.
    fn dominated_by_is_instance(&self, block: IrBlockId, object: IrId, class: TypeId) -> bool {
        let function = self.function;
        let root = array_root(function, object);
        let mut current = Some(block);
        while let Some(b) = current {
            if let [pred] = function.block(b).predecessors.as_slice() {
                if let IrTerminator::IfImm {
                    cond,
                    cc,
                    imm,
                    true_target,
                    false_target,
                } = function.block(*pred).terminator
                {
                    let on_true = true_target == b;
                    let taken_when = |v: i64| cc.evaluate(v, imm) == on_true;
                    if true_target != false_target
                        && function.opcode(cond) == Opcode::IsInstance(class)
                        && array_root(function, function.input(cond, 0)) == root
                        && taken_when(1)
                        && !taken_when(0)
                    {
                        return true;
                    }
                }
            }
            current = self.bounds.domtree().idom(b);
        }
        false
    }

    /// Queue an unresolved check for the loop stages.
    fn defer(&mut self, block: IrBlockId, id: IrId) {
        let function = self.function;
        if self.config.hoist_checks && !function.is_osr {
            if let Some(target) = self.hoist_target(id) {
                self.decisions.hoist.push((id, target));
                return;
            }
        }
        if function.opcode(id) == Opcode::BoundsCheck {
            let (parent, offset) = loop_guards::decompose_index(function, function.input(id, 1));
            let key = GroupKey {
                loop_header: self.bounds.loops().block_to_loop.get(&block).copied(),
                len: function.input(id, 0),
                parent,
            };
            self.decisions
                .groups
                .entry(key)
                .or_default()
                .push(GroupedCheck { check: id, offset });
        }
    }

    /// Outermost preheader a check can move to: every checked operand is
    /// defined outside the loop, the check runs on every iteration and the
    /// preheader offers a `SaveStateDeoptimize`.
    fn hoist_target(&self, id: IrId) -> Option<IrBlockId> {
        let function = self.function;
        let inst = function.inst(id);
        if inst.flags.contains(InstFlags::NO_HOIST)
            || matches!(
                inst.opcode,
                Opcode::AddOverflowCheck | Opcode::SubOverflowCheck | Opcode::NegOverflowAndZeroCheck
            )
        {
            return None;
        }
        let operands = &inst.inputs[..inst.inputs.len().saturating_sub(1)];
        let loops = self.bounds.loops();
        let domtree = self.bounds.domtree();

        let mut target = None;
        let mut position = function.block_of(id);
        while let Some(natural_loop) = loops.get_loop(position) {
            if natural_loop.is_irreducible || natural_loop.is_osr || natural_loop.is_try_catch {
                break;
            }
            let Some(preheader) = natural_loop.preheader else {
                break;
            };
            let invariant = operands
                .iter()
                .all(|&op| !natural_loop.contains(function.block_of(op)));
            let every_iteration = natural_loop
                .back_edges
                .iter()
                .all(|&latch| domtree.dominates(position, latch));
            let has_save_state = function
                .block(preheader)
                .instructions
                .iter()
                .any(|&i| function.opcode(i) == Opcode::SaveStateDeoptimize);
            if !(invariant && every_iteration && has_save_state) {
                break;
            }
            target = Some(preheader);
            position = preheader;
        }
        target
    }

    /// Turn the bounds-check groups into guard plans.
    fn plan_loop_stages(&mut self) {
        let function = self.function;
        let groups = std::mem::take(&mut self.decisions.groups);
        let mut remaining = Vec::new();
        for (key, checks) in groups {
            if self.config.loop_deoptimization && !function.is_osr {
                if let Some(plan) = loop_guards::plan_before_loop(function, &self.bounds, &key, &checks) {
                    self.decisions.before_loop.push(plan);
                    continue;
                }
            }
            remaining.push((key, checks));
        }

        // A null check the before-loop plans reload must not move on its own.
        let replaced: Vec<IrId> = self
            .decisions
            .before_loop
            .iter()
            .filter_map(|plan| match plan.len {
                loop_guards::LenSource::Hoisted { replaces, .. } => replaces,
                loop_guards::LenSource::Existing(_) => None,
            })
            .collect();
        self.decisions.hoist.retain(|(id, _)| !replaced.contains(id));

        if self.config.grouped_deoptimization {
            for (key, checks) in remaining {
                if let Some(plan) =
                    loop_guards::plan_in_loop(function, &self.bounds, &key, &checks, self.config.min_group_size)
                {
                    self.decisions.in_loop.push(plan);
                }
            }
        }
    }
}

fn retire(function: &mut IrFunction, id: IrId, replacement: Option<IrId>, forwarding: &mut Forwarding) {
    if let Some(new) = replacement {
        function.replace_all_uses(id, new);
        forwarding.record(id, new);
    }
    function.remove_inst(id);
}

/// Apply the decisions in stage order.
fn apply(function: &mut IrFunction, decisions: Decisions) -> OptimizationResult {
    let mut result = OptimizationResult::unchanged();
    let mut forwarding = Forwarding::default();

    for id in decisions.omit_null_check {
        function.inst_mut(id).flags |= InstFlags::OMIT_NULL_CHECK;
        let pc = function.inst(id).pc;
        result.event(PASS_NAME, format!("{} omits null check", function.opcode(id)), id, pc);
        result.count("omit_null_check");
    }

    for (id, value) in decisions.folds {
        let constant = function.find_or_create_constant(value, function.inst(id).ty);
        let pc = function.inst(id).pc;
        retire(function, id, Some(constant), &mut forwarding);
        result.event(PASS_NAME, "IsInstance folded", id, pc);
        result.instructions_eliminated += 1;
        result.count("folded");
    }

    for (id, opcode) in decisions.arithmetic {
        let inst = function.inst(id);
        let (ty, pc) = (inst.ty, inst.pc);
        let operands = [forwarding.resolve(inst.input(0)), forwarding.resolve(inst.input(1))];
        let check = inst.opcode;
        let plain = function.insert_before(id, opcode, ty, &operands);
        retire(function, id, Some(plain), &mut forwarding);
        result.event(PASS_NAME, format!("{} replaced by arithmetic", check), id, pc);
        result.count("overflow_checks_removed");
    }

    for removal in decisions.removals {
        let check = removal.check;
        if !function.is_live(check) {
            continue;
        }
        let replacement = removal.replacement.map(|r| forwarding.resolve(r));
        if removal.no_hoist {
            for user in function.users_of(check) {
                if let IrUser::Inst(user) = user {
                    function.inst_mut(user).flags |= InstFlags::NO_HOIST;
                }
            }
        }
        let pc = function.inst(check).pc;
        let opcode = function.opcode(check);
        retire(function, check, replacement, &mut forwarding);
        result.event(PASS_NAME, format!("{} removed ({})", opcode, removal.reason), check, pc);
        result.instructions_eliminated += 1;
        result.count("checks_removed");
    }

    for plan in &decisions.before_loop {
        let guards = loop_guards::emit_plan(function, plan, &mut forwarding);
        for grouped in &plan.checks {
            result.event(PASS_NAME, "BoundsCheck replaced by guard before loop", grouped.check, 0);
        }
        result.instructions_eliminated += plan.checks.len();
        *result.stats.entry("guards_inserted".to_string()).or_insert(0) += guards;
    }

    for (id, target) in decisions.hoist {
        if !function.is_live(id) {
            continue;
        }
        let save_state = function
            .block(target)
            .instructions
            .iter()
            .copied()
            .find(|&i| function.opcode(i) == Opcode::SaveStateDeoptimize);
        let Some(save_state) = save_state else {
            continue;
        };
        function.move_to_block_end(id, target);
        let inst = function.inst_mut(id);
        if let Some(last) = inst.inputs.last_mut() {
            *last = save_state;
        }
        inst.flags |= InstFlags::CAN_DEOPTIMIZE;
        let (pc, opcode) = (inst.pc, inst.opcode);
        result.event(PASS_NAME, format!("{} hoisted out of loop", opcode), id, pc);
        result.count("checks_hoisted");
    }

    for plan in &decisions.in_loop {
        let guards = loop_guards::emit_plan(function, plan, &mut forwarding);
        for grouped in &plan.checks {
            result.event(PASS_NAME, "BoundsCheck replaced by grouped guard", grouped.check, 0);
        }
        result.instructions_eliminated += plan.checks.len();
        *result.stats.entry("guards_inserted".to_string()).or_insert(0) += guards;
    }

    for id in decisions.must_throw {
        if !function.is_live(id) {
            continue;
        }
        let inst = function.inst(id);
        let Some(kind) = inst.opcode.check_kind() else {
            continue;
        };
        let (pc, opcode) = (inst.pc, inst.opcode);
        let save_state = inst.save_state().map(|ss| forwarding.resolve(ss));
        let block = function.block_of(id);
        function.set_terminator(block, IrTerminator::Deoptimize { kind, save_state });
        let tail = function.truncate_after(id);
        function.remove_inst(id);
        let blocks = function.remove_unreachable_blocks();
        result.event(PASS_NAME, format!("{} always fails", opcode), id, pc);
        result.instructions_eliminated += tail.len() + 1;
        result.blocks_eliminated += blocks;
        result.count("must_throw");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{CountedLoop, IrBuilder};
    use crate::ir::{ConditionCode, DeoptimizeType};

    fn run(function: &mut IrFunction) -> OptimizationResult {
        ChecksElimination::default().run_on_function(function)
    }

    fn count(function: &IrFunction, pred: impl Fn(Opcode) -> bool) -> usize {
        function.live_insts().filter(|i| pred(i.opcode)).count()
    }

    #[test]
    fn test_consecutive_null_checks_collapse() {
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Reference);
        let ss = b.save_state(&[p]);
        let nc1 = b.null_check(p, ss);
        let nc2 = b.null_check(nc1, ss);
        let nc3 = b.null_check(nc2, ss);
        let len = b.len_array(nc3);
        b.ret(Some(len));
        let mut func = b.finish();

        let result = run(&mut func);
        assert!(result.modified);
        assert_eq!(count(&func, |op| op == Opcode::NullCheck), 1);
        assert!(func.is_live(nc1));
        assert_eq!(func.input(len, 0), nc1);
    }

    #[test]
    fn test_dominated_check_is_removed_and_users_rewired() {
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Reference);
        let ss = b.save_state(&[p]);
        let nc1 = b.null_check(p, ss);
        let len1 = b.len_array(nc1);
        let nc2 = b.null_check(p, ss);
        let len2 = b.len_array(nc2);
        let sum = b.binary(Opcode::Add, DataType::Int32, len1, len2);
        b.ret(Some(sum));
        let mut func = b.finish();

        let result = run(&mut func);
        assert!(!func.is_live(nc2));
        assert_eq!(func.input(len2, 0), nc1);
        let names: Vec<&str> = result.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["NullCheck removed (dominated)"]);
    }

    #[test]
    fn test_dominance_includes_result_type() {
        let mut b = IrBuilder::new("f");
        let x = b.parameter(0, DataType::Int64);
        let ss = b.save_state(&[x]);
        let z32 = b.zero_check(x, DataType::Int32, ss);
        let z64 = b.zero_check(x, DataType::Int64, ss);
        b.ret(None);
        let mut func = b.finish();

        run(&mut func);
        assert!(func.is_live(z32));
        assert!(func.is_live(z64));
    }

    #[test]
    fn test_block_dominance_mode_ignores_other_blocks() {
        //   bb0: nc1 -> bb1: nc2
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Reference);
        let bb1 = b.create_block();
        let ss = b.save_state(&[p]);
        b.null_check(p, ss);
        b.goto(bb1);
        b.switch_to_block(bb1);
        let nc2 = b.null_check(p, ss);
        b.ret(None);
        let func = b.finish();

        let mut config = ChecksEliminationConfig::default();
        config.dominance = DominanceMode::Block;
        let mut block_mode = func.clone();
        ChecksElimination::new(config).run_on_function(&mut block_mode);
        assert!(block_mode.is_live(nc2));

        let mut tree_mode = func;
        run(&mut tree_mode);
        assert!(!tree_mode.is_live(nc2));
    }

    #[test]
    fn test_null_check_on_allocation_and_after_branch() {
        //      bb0: if p != null
        //      /  \
        //    bb1  bb2
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Reference);
        let null = b.null_ptr();
        let ss = b.save_state(&[p]);
        let obj = b.new_object(TypeId(1), ss);
        let nc_obj = b.null_check(obj, ss);
        let bb1 = b.create_block();
        let bb2 = b.create_block();
        let cmp = b.compare(ConditionCode::Ne, p, null);
        b.if_imm(cmp, ConditionCode::Ne, 0, bb1, bb2);
        b.switch_to_block(bb1);
        let nc_p = b.null_check(p, ss);
        let len = b.len_array(nc_p);
        b.ret(Some(len));
        b.switch_to_block(bb2);
        let nc_else = b.null_check(p, ss);
        b.ret(Some(nc_else));
        let mut func = b.finish();

        run(&mut func);
        assert!(!func.is_live(nc_obj));
        assert!(!func.is_live(nc_p));
        // Proven by the branch: the length load must stay below it.
        assert!(func.inst(len).flags.contains(InstFlags::NO_HOIST));
        // On the else edge p is null: the check always fails.
        assert!(!func.cfg.get_block(bb2).is_some_and(|b| b.instructions.contains(&nc_else)));
        assert!(matches!(
            func.block(bb2).terminator,
            IrTerminator::Deoptimize {
                kind: DeoptimizeType::NullCheck,
                ..
            }
        ));
    }

    #[test]
    fn test_value_checks_by_range() {
        let mut b = IrBuilder::new("f");
        let x = b.parameter(0, DataType::Int32);
        let ss = b.save_state(&[x]);
        let five = b.constant_typed(5, DataType::Int32);
        let masked = b.binary(Opcode::And, DataType::Int32, x, five);
        let neg_ok = b.negative_check(masked, ss);
        let zero_unknown = b.zero_check(masked, DataType::Int32, ss);
        let zero_ok = b.zero_check(five, DataType::Int32, ss);
        b.ret(None);
        let mut func = b.finish();

        run(&mut func);
        assert!(!func.is_live(neg_ok));
        assert!(func.is_live(zero_unknown));
        assert!(!func.is_live(zero_ok));
    }

    #[test]
    fn test_negative_check_kept_when_index_may_wrap() {
        //   i = 0; do { NegativeCheck(i); call(i) } while ((i += 2) < n)
        let mut b = IrBuilder::new("f");
        let n = b.parameter(0, DataType::Int32);
        let zero = b.constant_typed(0, DataType::Int32);
        let two = b.constant_typed(2, DataType::Int32);
        let preheader = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.goto(preheader);
        b.switch_to_block(preheader);
        b.save_state_deoptimize(&[n]);
        b.goto(body);
        b.switch_to_block(body);
        let i = b.phi(DataType::Int32, &[zero]);
        let ss = b.save_state(&[i, n]);
        let check = b.negative_check(i, ss);
        b.call_static(1, DataType::Void, &[check]);
        let update = b.binary(Opcode::Add, DataType::Int32, i, two);
        let cmp = b.compare(ConditionCode::Lt, update, n);
        b.if_imm(cmp, ConditionCode::Ne, 0, body, exit);
        b.add_phi_input(i, update);
        b.switch_to_block(exit);
        b.ret(None);
        let mut func = b.finish();

        run(&mut func);
        assert!(func.is_live(check));
    }

    #[test]
    fn test_constant_bounds_checks() {
        let mut b = IrBuilder::new("f");
        let ss = b.save_state(&[]);
        let ten = b.constant_typed(10, DataType::Int32);
        let arr = b.new_array(TypeId(1), ten, ss);
        let len = b.len_array(arr);
        let three = b.constant_typed(3, DataType::Int32);
        let ok = b.bounds_check(len, three, ss);
        let value = b.load_array(arr, ok, DataType::Int32);
        b.ret(Some(value));
        let mut func = b.finish();

        run(&mut func);
        assert!(!func.is_live(ok));
        assert_eq!(func.input(value, 1), three);

        let mut b = IrBuilder::new("g");
        let ss = b.save_state(&[]);
        let ten = b.constant_typed(10, DataType::Int32);
        let arr = b.new_array(TypeId(1), ten, ss);
        let len = b.len_array(arr);
        let eleven = b.constant_typed(11, DataType::Int32);
        let oob = b.bounds_check(len, eleven, ss);
        b.load_array(arr, oob, DataType::Int32);
        b.ret(None);
        let mut func = b.finish();

        let result = run(&mut func);
        assert_eq!(result.stats.get("must_throw"), Some(&1));
        assert!(matches!(
            func.block(func.entry_block()).terminator,
            IrTerminator::Deoptimize {
                kind: DeoptimizeType::BoundsCheck,
                ..
            }
        ));
    }

    #[test]
    fn test_checks_over_different_arrays_are_not_merged() {
        let mut b = IrBuilder::new("f");
        let a1 = b.parameter(0, DataType::Reference);
        let a2 = b.parameter(1, DataType::Reference);
        let i = b.parameter(2, DataType::Int32);
        let ss = b.save_state(&[a1, a2, i]);
        let len1 = b.len_array(a1);
        let len2 = b.len_array(a2);
        let bc1 = b.bounds_check(len1, i, ss);
        let bc2 = b.bounds_check(len2, i, ss);
        b.ret(None);
        let mut func = b.finish();

        let mut config = ChecksEliminationConfig::default();
        config.grouped_deoptimization = false;
        ChecksElimination::new(config).run_on_function(&mut func);
        assert!(func.is_live(bc1));
        assert!(func.is_live(bc2));
    }

    #[test]
    fn test_overflow_checks() {
        let mut b = IrBuilder::new("f");
        let x = b.parameter(0, DataType::Int32);
        let ss = b.save_state(&[x]);
        let mask = b.constant_typed(0xff, DataType::Int32);
        let small = b.binary(Opcode::And, DataType::Int32, x, mask);
        let safe = b.add_overflow_check(small, small, ss);
        let unknown = b.add_overflow_check(x, x, ss);
        let again = b.add_overflow_check(x, x, ss);
        b.ret(Some(safe));
        let mut func = b.finish();

        run(&mut func);
        assert!(!func.is_live(safe));
        assert!(func.is_live(unknown));
        assert!(!func.is_live(again));
        let IrTerminator::Return { value: Some(ret) } = func.block(func.entry_block()).terminator else {
            panic!("expected return");
        };
        assert_eq!(func.opcode(ret), Opcode::Add);
    }

    #[test]
    fn test_check_cast_after_is_instance() {
        //   bb0: if IsInstance(T1)(p)
        //   bb1: CheckCast(T1)(p)
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Reference);
        let ss = b.save_state(&[p]);
        let is = b.is_instance(p, TypeId(1), ss);
        let bb1 = b.create_block();
        let bb2 = b.create_block();
        b.if_imm(is, ConditionCode::Ne, 0, bb1, bb2);
        b.switch_to_block(bb1);
        let cast = b.check_cast(p, TypeId(1), ss);
        let other = b.check_cast(p, TypeId(2), ss);
        b.ret(None);
        b.switch_to_block(bb2);
        b.ret(None);
        let mut func = b.finish();

        run(&mut func);
        assert!(!func.is_live(cast));
        assert!(func.is_live(other));
    }

    #[test]
    fn test_type_checks_on_known_objects() {
        let mut b = IrBuilder::new("f");
        let ss = b.save_state(&[]);
        let obj = b.new_object(TypeId(4), ss);
        let null = b.null_ptr();
        let is_obj = b.is_instance(obj, TypeId(4), ss);
        let is_null = b.is_instance(null, TypeId(4), ss);
        let cast = b.check_cast(obj, TypeId(4), ss);
        let sum = b.binary(Opcode::Add, DataType::Bool, is_obj, is_null);
        b.ret(Some(sum));
        let mut func = b.finish();

        run(&mut func);
        assert!(!func.is_live(cast));
        assert!(!func.is_live(is_obj));
        let inputs = func.inst(sum).inputs.clone();
        assert_eq!(func.constant_value(inputs[0]), Some(1));
        assert_eq!(func.constant_value(inputs[1]), Some(0));
    }

    #[test]
    fn test_omit_null_check_flag() {
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Reference);
        let ss = b.save_state(&[p]);
        b.null_check(p, ss);
        let cast = b.check_cast(p, TypeId(2), ss);
        b.ret(None);
        let mut func = b.finish();

        let result = run(&mut func);
        assert!(result.modified);
        assert!(func.inst(cast).flags.contains(InstFlags::OMIT_NULL_CHECK));
        assert!(!run(&mut func).modified);
    }

    #[test]
    fn test_invariant_check_is_hoisted() {
        let mut b = IrBuilder::new("f");
        let x = b.parameter(0, DataType::Int32);
        let zero = b.constant_typed(0, DataType::Int32);
        let ten = b.constant_typed(10, DataType::Int32);
        let lp = b.begin_counted_loop(zero, ten, ConditionCode::Lt, 1);
        let ss = b.save_state(&[x]);
        let check = b.negative_check(x, ss);
        b.new_array(TypeId(1), check, ss);
        b.end_counted_loop(&lp);
        b.ret(None);
        let mut func = b.finish();

        let result = run(&mut func);
        assert_eq!(result.stats.get("checks_hoisted"), Some(&1));
        assert_eq!(func.block_of(check), lp.preheader);
        assert_eq!(func.inst(check).save_state(), Some(lp.save_state));
        assert!(func.inst(check).flags.contains(InstFlags::CAN_DEOPTIMIZE));
    }

    #[test]
    fn test_osr_function_does_not_hoist() {
        let mut b = IrBuilder::new("f");
        b.set_osr(true);
        let x = b.parameter(0, DataType::Int32);
        let zero = b.constant_typed(0, DataType::Int32);
        let ten = b.constant_typed(10, DataType::Int32);
        let lp = b.begin_counted_loop(zero, ten, ConditionCode::Lt, 1);
        let ss = b.save_state(&[x]);
        let check = b.negative_check(x, ss);
        b.end_counted_loop(&lp);
        b.ret(None);
        let mut func = b.finish();

        run(&mut func);
        assert_eq!(func.block_of(check), lp.body);
    }

    /// Bounds guards in `block` as `(cc, lhs, rhs)` of their compares.
    fn guards_in(function: &IrFunction, block: IrBlockId, save_state: IrId) -> Vec<(ConditionCode, IrId, IrId)> {
        function
            .block(block)
            .instructions
            .iter()
            .copied()
            .filter(|&id| function.opcode(id) == Opcode::DeoptimizeIf(DeoptimizeType::BoundsCheck))
            .map(|id| {
                assert_eq!(function.input(id, 1), save_state);
                let cond = function.inst(function.input(id, 0));
                match cond.opcode {
                    Opcode::Compare(cc) => (cc, cond.input(0), cond.input(1)),
                    other => panic!("guard on {}", other),
                }
            })
            .collect()
    }

    fn is_guard(op: Opcode) -> bool {
        matches!(op, Opcode::DeoptimizeIf(_))
    }

    /// `for (i = init; i cc test; i += step) use(a[i])` over a length
    /// loaded before the loop.
    fn indexed_loop(step: i64) -> (IrFunction, CountedLoop, IrId, IrId, IrId) {
        let mut b = IrBuilder::new("f");
        let a = b.parameter(0, DataType::Reference);
        let n = b.parameter(1, DataType::Int32);
        let ss = b.save_state(&[a, n]);
        let nc = b.null_check(a, ss);
        let len = b.len_array(nc);
        let zero = b.constant_typed(0, DataType::Int32);
        let lp = if step > 0 {
            b.begin_counted_loop(zero, n, ConditionCode::Lt, step)
        } else {
            b.begin_counted_loop(n, zero, ConditionCode::Gt, step)
        };
        let body_ss = b.save_state(&[a, lp.index]);
        let check = b.bounds_check(len, lp.index, body_ss);
        let x = b.load_array(nc, check, DataType::Int32);
        b.call_static(7, DataType::Void, &[x]);
        b.end_counted_loop(&lp);
        b.ret(None);
        (b.finish(), lp, n, len, check)
    }

    #[test]
    fn test_unknown_trip_count_guarded_before_loop() {
        let (mut func, lp, n, len, check) = indexed_loop(1);

        let result = run(&mut func);
        assert!(!func.is_live(check));
        assert_eq!(result.stats.get("guards_inserted"), Some(&1));
        assert_eq!(count(&func, is_guard), 1);
        // deoptimize when len < n
        assert_eq!(
            guards_in(&func, lp.preheader, lp.save_state),
            vec![(ConditionCode::Lt, len, n)]
        );
        assert!(result
            .events
            .iter()
            .any(|e| e.name == "BoundsCheck replaced by guard before loop"));
        assert!(func.verify().is_ok());
    }

    #[test]
    fn test_large_step_guards_overflow_and_last_index() {
        let (mut func, lp, n, len, check) = indexed_loop(3);

        let result = run(&mut func);
        assert!(!func.is_live(check));
        assert_eq!(result.stats.get("guards_inserted"), Some(&2));
        assert_eq!(count(&func, is_guard), 2);
        let guards = guards_in(&func, lp.preheader, lp.save_state);
        assert_eq!(guards.len(), 2);

        // deoptimize when i32::MAX - 2 < n: the update could wrap
        let (cc, limit, test) = guards[0];
        assert_eq!((cc, test), (ConditionCode::Lt, n));
        assert_eq!(func.constant_value(limit), Some(i32::MAX as i64 - 2));

        // deoptimize when len < n - (n - 1) % 3, one past the last index
        let (cc, lhs, past_last) = guards[1];
        assert_eq!((cc, lhs), (ConditionCode::Lt, len));
        assert_eq!(func.opcode(past_last), Opcode::Sub);
        assert_eq!(func.input(past_last, 0), n);
        let rem = func.input(past_last, 1);
        assert_eq!(func.opcode(rem), Opcode::Mod);
        assert_eq!(func.constant_value(func.input(rem, 1)), Some(3));
        let distance = func.input(rem, 0);
        assert_eq!(func.opcode(distance), Opcode::Sub);
        assert_eq!(func.input(distance, 0), n);
        assert_eq!(func.block_of(past_last), lp.preheader);
    }

    #[test]
    fn test_decreasing_loop_guards() {
        //   for (i = n; i > 0; i--) use(a[i])
        let (mut func, lp, n, len, check) = indexed_loop(-1);

        let result = run(&mut func);
        assert!(!func.is_live(check));
        assert_eq!(result.stats.get("guards_inserted"), Some(&1));
        assert_eq!(count(&func, is_guard), 1);
        // deoptimize when n >= len
        assert_eq!(
            guards_in(&func, lp.preheader, lp.save_state),
            vec![(ConditionCode::Ge, n, len)]
        );
    }

    #[test]
    fn test_decreasing_loop_to_unknown_bound() {
        //   for (i = n; i > m; i -= 2) use(a[i])
        let mut b = IrBuilder::new("f");
        let a = b.parameter(0, DataType::Reference);
        let n = b.parameter(1, DataType::Int32);
        let m = b.parameter(2, DataType::Int32);
        let ss = b.save_state(&[a, n, m]);
        let nc = b.null_check(a, ss);
        let len = b.len_array(nc);
        let lp = b.begin_counted_loop(n, m, ConditionCode::Gt, -2);
        let body_ss = b.save_state(&[a, lp.index]);
        let check = b.bounds_check(len, lp.index, body_ss);
        let x = b.load_array(nc, check, DataType::Int32);
        b.call_static(7, DataType::Void, &[x]);
        b.end_counted_loop(&lp);
        b.ret(None);
        let mut func = b.finish();

        let result = run(&mut func);
        assert!(!func.is_live(check));
        assert_eq!(result.stats.get("guards_inserted"), Some(&3));
        assert_eq!(count(&func, is_guard), 3);
        let guards = guards_in(&func, lp.preheader, lp.save_state);
        assert_eq!(guards.len(), 3);

        // n >= len
        assert_eq!(guards[0], (ConditionCode::Ge, n, len));
        // m + 1 < 0: the last index may be negative
        let (cc, last, zero) = guards[1];
        assert_eq!(cc, ConditionCode::Lt);
        assert_eq!(func.opcode(last), Opcode::Add);
        assert_eq!(func.input(last, 0), m);
        assert_eq!(func.constant_value(func.input(last, 1)), Some(1));
        assert_eq!(func.constant_value(zero), Some(0));
        // m < i32::MIN + 1: the update could wrap
        let (cc, test, limit) = guards[2];
        assert_eq!((cc, test), (ConditionCode::Lt, m));
        assert_eq!(func.constant_value(limit), Some(i32::MIN as i64 + 1));
    }

    #[test]
    fn test_length_reloaded_in_preheader() {
        //   for (i = 0; i < n; i++) use(a[i]), with a.length read in the body
        let mut b = IrBuilder::new("f");
        let a = b.parameter(0, DataType::Reference);
        let n = b.parameter(1, DataType::Int32);
        let zero = b.constant_typed(0, DataType::Int32);
        let lp = b.begin_counted_loop(zero, n, ConditionCode::Lt, 1);
        let body_ss = b.save_state(&[a, lp.index]);
        let nc = b.null_check(a, body_ss);
        let len = b.len_array(nc);
        let check = b.bounds_check(len, lp.index, body_ss);
        let x = b.load_array(nc, check, DataType::Int32);
        b.call_static(7, DataType::Void, &[x]);
        b.end_counted_loop(&lp);
        b.ret(None);
        let mut func = b.finish();

        let result = run(&mut func);
        assert!(!func.is_live(check));
        assert!(!func.is_live(nc));
        assert_eq!(result.stats.get("guards_inserted"), Some(&1));

        let preheader: Vec<Opcode> = func
            .block(lp.preheader)
            .instructions
            .iter()
            .map(|&id| func.opcode(id))
            .collect();
        assert_eq!(
            preheader,
            vec![
                Opcode::SaveStateDeoptimize,
                Opcode::NullCheck,
                Opcode::LenArray,
                Opcode::Compare(ConditionCode::Lt),
                Opcode::DeoptimizeIf(DeoptimizeType::BoundsCheck),
            ]
        );
        let hoisted_nc = func.block(lp.preheader).instructions[1];
        let hoisted_len = func.block(lp.preheader).instructions[2];
        assert_eq!(func.inst(hoisted_nc).inputs.as_slice(), &[a, lp.save_state]);
        assert_eq!(func.input(hoisted_len, 0), hoisted_nc);
        assert_eq!(
            guards_in(&func, lp.preheader, lp.save_state),
            vec![(ConditionCode::Lt, hoisted_len, n)]
        );
        // The body reads through the preheader null check.
        assert_eq!(func.input(len, 0), hoisted_nc);
        assert_eq!(func.input(x, 0), hoisted_nc);
        assert_eq!(count(&func, |op| op == Opcode::NullCheck), 1);
        assert!(func.verify().is_ok());
    }

    #[test]
    fn test_grouped_checks_outside_loops() {
        // a[x], a[x-1], a[x+1], a[x-2], a[x+2] with x in [0, 1023]
        let mut b = IrBuilder::new("f");
        let a = b.parameter(0, DataType::Reference);
        let p = b.parameter(1, DataType::Int32);
        let mask = b.constant_typed(1023, DataType::Int32);
        let x = b.binary(Opcode::And, DataType::Int32, p, mask);
        let ss = b.save_state(&[a, x]);
        let len = b.len_array(a);
        let mut checks = vec![b.bounds_check(len, x, ss)];
        for offset in [-1i64, 1, -2, 2] {
            let c = b.constant_typed(offset, DataType::Int32);
            let idx = b.binary(Opcode::Add, DataType::Int32, x, c);
            checks.push(b.bounds_check(len, idx, ss));
        }
        b.ret(None);
        let mut func = b.finish();

        let result = run(&mut func);
        assert_eq!(result.stats.get("guards_inserted"), Some(&2));
        assert!(checks.iter().all(|&c| !func.is_live(c)));
        let guards: Vec<_> = func
            .live_insts()
            .filter(|i| i.opcode == Opcode::DeoptimizeIf(DeoptimizeType::BoundsCheck))
            .map(|i| func.opcode(i.input(0)))
            .collect();
        assert_eq!(
            guards,
            vec![Opcode::Compare(ConditionCode::Lt), Opcode::Compare(ConditionCode::Ge)]
        );
    }

    #[test]
    fn test_disabled_stages_leave_checks() {
        let mut b = IrBuilder::new("f");
        let a = b.parameter(0, DataType::Reference);
        let x = b.parameter(1, DataType::Int32);
        let ss = b.save_state(&[a, x]);
        let len = b.len_array(a);
        let one = b.constant_typed(1, DataType::Int32);
        let next = b.binary(Opcode::Add, DataType::Int32, x, one);
        let c1 = b.bounds_check(len, x, ss);
        let c2 = b.bounds_check(len, next, ss);
        b.ret(None);
        let mut func = b.finish();

        let mut config = ChecksEliminationConfig::default();
        config.grouped_deoptimization = false;
        let result = ChecksElimination::new(config).run_on_function(&mut func);
        assert!(!result.modified);
        assert!(func.is_live(c1) && func.is_live(c2));
    }
}
