//! Bounds (Range) Analysis
//!
//! Forward interval analysis over the dominator tree. Every integer,
//! boolean and reference value gets a closed range `[left, right]` at its
//! definition; conditional branches add narrowed ranges for the compared
//! values in the single-predecessor successor they guard. A lookup walks
//! from the query block up the dominator chain, so a narrowed range is seen
//! exactly where the branch condition is known to hold.
//!
//! References are ranged as addresses with `0` standing for null: fresh
//! allocations are `[1, MAX]`, the null constant is `[0, 0]`.
//!
//! Induction phis of countable loops are ranged from `{init, test, step}`
//! directly. When the loop runs while `i < a.length`, the range carries the
//! array as its `len_array` tag, which is what lets a bounds check on
//! `a[i]` go away even though the length itself is unknown.

use super::countable_loop::{has_pre_header_compare, CountableLoopInfo, CountableLoopParser};
use super::functions::IrFunction;
use super::instructions::Opcode;
use super::loop_analysis::{DominatorTree, LoopNestInfo};
use super::types::ConditionCode;
use super::{DataType, IrBlockId, IrId, IrTerminator};
use fxhash::FxHashMap;
use std::fmt::Write;
use tracing::{debug, trace};

pub const MIN_RANGE_VALUE: i64 = i64::MIN;
pub const MAX_RANGE_VALUE: i64 = i64::MAX;

/// Closed interval of possible run-time values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundsRange {
    left: i64,
    right: i64,
    /// Array whose length bounds this value from above (exclusive)
    len_array: Option<IrId>,
    /// Loop whose trip structure established `len_array`
    actual_length_loop: Option<IrBlockId>,
}

impl Default for BoundsRange {
    fn default() -> Self {
        Self::full()
    }
}

impl BoundsRange {
    pub fn new(left: i64, right: i64) -> Self {
        assert!(left <= right, "empty bounds range [{}, {}]", left, right);
        Self {
            left,
            right,
            len_array: None,
            actual_length_loop: None,
        }
    }

    pub fn full() -> Self {
        Self::new(MIN_RANGE_VALUE, MAX_RANGE_VALUE)
    }

    pub fn constant(value: i64) -> Self {
        Self::new(value, value)
    }

    /// Every value of `ty`. References may be null.
    pub fn for_type(ty: DataType) -> Self {
        match ty {
            DataType::Reference => Self::new(0, MAX_RANGE_VALUE),
            other => Self::new(other.min_value(), other.max_value()),
        }
    }

    pub fn left(&self) -> i64 {
        self.left
    }

    pub fn right(&self) -> i64 {
        self.right
    }

    pub fn len_array(&self) -> Option<IrId> {
        self.len_array
    }

    pub fn actual_length_loop(&self) -> Option<IrBlockId> {
        self.actual_length_loop
    }

    pub fn with_len_array(mut self, array: IrId, actual_length_loop: Option<IrBlockId>) -> Self {
        self.len_array = Some(array);
        self.actual_length_loop = actual_length_loop;
        self
    }

    fn untagged(mut self) -> Self {
        self.len_array = None;
        self.actual_length_loop = None;
        self
    }

    /// Range from checked bounds; `None` on either side means overflow.
    fn from_checked(left: Option<i64>, right: Option<i64>) -> Self {
        match (left, right) {
            (Some(l), Some(r)) if l <= r => Self::new(l, r),
            _ => Self::full(),
        }
    }

    pub fn is_const(&self) -> Option<i64> {
        (self.left == self.right).then_some(self.left)
    }

    pub fn contains(&self, value: i64) -> bool {
        self.left <= value && value <= self.right
    }

    pub fn is_within(&self, other: &BoundsRange) -> bool {
        other.left <= self.left && self.right <= other.right
    }

    pub fn is_not_negative(&self) -> bool {
        self.left >= 0
    }

    pub fn is_negative(&self) -> bool {
        self.right < 0
    }

    pub fn is_positive(&self) -> bool {
        self.left > 0
    }

    /// Every value is below every value of `other`.
    pub fn is_less(&self, other: &BoundsRange) -> bool {
        self.right < other.left
    }

    /// Every value is above every value of `other`.
    pub fn is_more(&self, other: &BoundsRange) -> bool {
        self.left > other.right
    }

    pub fn intersect(&self, other: &BoundsRange) -> Option<BoundsRange> {
        let left = self.left.max(other.left);
        let right = self.right.min(other.right);
        if left > right {
            return None;
        }
        let mut range = *self;
        range.left = left;
        range.right = right;
        if range.len_array.is_none() {
            range.len_array = other.len_array;
            range.actual_length_loop = other.actual_length_loop;
        }
        Some(range)
    }

    pub fn union(&self, other: &BoundsRange) -> BoundsRange {
        let mut range = Self::new(self.left.min(other.left), self.right.max(other.right));
        if self.len_array == other.len_array {
            range.len_array = self.len_array;
            if self.actual_length_loop == other.actual_length_loop {
                range.actual_length_loop = self.actual_length_loop;
            }
        }
        range
    }

    /// Clamp to what `ty` can hold: a range that does not fit means the
    /// value may have wrapped, so it widens to the whole type.
    pub fn fit_in_type(self, ty: DataType) -> BoundsRange {
        if !ty.is_integer() && ty != DataType::Bool {
            return self;
        }
        if self.left < ty.min_value() || self.right > ty.max_value() {
            Self::for_type(ty)
        } else {
            self
        }
    }

    // === Interval arithmetic ===

    pub fn add(&self, other: &BoundsRange) -> BoundsRange {
        Self::from_checked(self.left.checked_add(other.left), self.right.checked_add(other.right))
    }

    pub fn sub(&self, other: &BoundsRange) -> BoundsRange {
        Self::from_checked(self.left.checked_sub(other.right), self.right.checked_sub(other.left))
    }

    pub fn mul(&self, other: &BoundsRange) -> BoundsRange {
        let corners = [
            self.left.checked_mul(other.left),
            self.left.checked_mul(other.right),
            self.right.checked_mul(other.left),
            self.right.checked_mul(other.right),
        ];
        Self::from_corners(&corners)
    }

    fn from_corners(corners: &[Option<i64>]) -> BoundsRange {
        let mut values = Vec::with_capacity(corners.len());
        for corner in corners {
            match corner {
                Some(v) => values.push(*v),
                None => return Self::full(),
            }
        }
        match (values.iter().min(), values.iter().max()) {
            (Some(&l), Some(&r)) => Self::new(l, r),
            _ => Self::full(),
        }
    }

    pub fn div(&self, other: &BoundsRange) -> BoundsRange {
        if other.contains(0) {
            return Self::full();
        }
        let corners = [
            self.left.checked_div(other.left),
            self.left.checked_div(other.right),
            self.right.checked_div(other.left),
            self.right.checked_div(other.right),
        ];
        Self::from_corners(&corners)
    }

    pub fn modulo(&self, other: &BoundsRange) -> BoundsRange {
        if other.contains(0) {
            return Self::full();
        }
        let divisor = other.left.unsigned_abs().max(other.right.unsigned_abs());
        let limit = (divisor - 1).min(MAX_RANGE_VALUE as u64) as i64;
        if self.left >= 0 {
            Self::new(0, self.right.min(limit))
        } else if self.right <= 0 {
            Self::new(self.left.max(-limit), 0)
        } else {
            Self::new(self.left.max(-limit), self.right.min(limit))
        }
    }

    pub fn neg(&self) -> BoundsRange {
        Self::from_checked(self.right.checked_neg(), self.left.checked_neg())
    }

    pub fn abs(&self) -> BoundsRange {
        if self.left >= 0 {
            self.untagged()
        } else if self.right <= 0 {
            self.neg()
        } else {
            match self.left.checked_neg() {
                Some(l) => Self::new(0, l.max(self.right)),
                None => Self::full(),
            }
        }
    }

    pub fn not(&self) -> BoundsRange {
        Self::new(!self.right, !self.left)
    }

    pub fn and(&self, other: &BoundsRange) -> BoundsRange {
        match (self.left >= 0, other.left >= 0) {
            (true, true) => Self::new(0, self.right.min(other.right)),
            (true, false) => Self::new(0, self.right),
            (false, true) => Self::new(0, other.right),
            (false, false) => Self::full(),
        }
    }

    /// All bits up to the highest set bit of a non-negative value.
    fn bit_mask(value: i64) -> i64 {
        (u64::MAX >> value.leading_zeros()) as i64
    }

    pub fn or(&self, other: &BoundsRange) -> BoundsRange {
        if self.left >= 0 && other.left >= 0 {
            Self::new(self.left.max(other.left), Self::bit_mask(self.right.max(other.right)))
        } else {
            Self::full()
        }
    }

    pub fn xor(&self, other: &BoundsRange) -> BoundsRange {
        if self.left >= 0 && other.left >= 0 {
            Self::new(0, Self::bit_mask(self.right.max(other.right)))
        } else {
            Self::full()
        }
    }

    /// Shift amount masked to the operand width, when constant.
    fn shift_amount(amount: &BoundsRange, bits: u32) -> Option<u32> {
        amount.is_const().map(|c| (c as u32) & (bits - 1))
    }

    pub fn shl(&self, amount: &BoundsRange, bits: u32) -> BoundsRange {
        match Self::shift_amount(amount, bits) {
            Some(c) if c < 63 => self.mul(&Self::constant(1i64 << c)),
            _ => Self::full(),
        }
    }

    pub fn ashr(&self, amount: &BoundsRange, bits: u32) -> BoundsRange {
        match Self::shift_amount(amount, bits) {
            Some(c) => Self::new(self.left >> c, self.right >> c),
            None => Self::new(self.left.min(0), self.right.max(0)),
        }
    }

    pub fn shr(&self, amount: &BoundsRange, bits: u32) -> BoundsRange {
        if self.left < 0 {
            return Self::full();
        }
        match Self::shift_amount(amount, bits) {
            Some(c) => Self::new(self.left >> c, self.right >> c),
            None => Self::new(0, self.right),
        }
    }

    /// Restrict `self` to the values for which `self cc other` can hold.
    /// `None` when the condition cannot hold at all.
    pub fn narrow(&self, cc: ConditionCode, other: &BoundsRange) -> Option<BoundsRange> {
        let mut range = *self;
        match cc {
            ConditionCode::Lt => range.right = range.right.min(other.right.checked_sub(1)?),
            ConditionCode::Le => range.right = range.right.min(other.right),
            ConditionCode::Gt => range.left = range.left.max(other.left.checked_add(1)?),
            ConditionCode::Ge => range.left = range.left.max(other.left),
            ConditionCode::Eq => return self.intersect(other),
            ConditionCode::Ne => {
                if let Some(c) = other.is_const() {
                    if range.left == c {
                        range.left = c.checked_add(1)?;
                    } else if range.right == c {
                        range.right = c.checked_sub(1)?;
                    }
                }
            }
        }
        (range.left <= range.right).then_some(range)
    }
}

impl std::fmt::Display for BoundsRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.left, self.right)?;
        if let Some(array) = self.len_array {
            write!(f, " len_array={}", array)?;
        }
        if let Some(header) = self.actual_length_loop {
            write!(f, " loop={}", header)?;
        }
        Ok(())
    }
}

/// Array an access goes through, looking past null checks.
pub fn array_root(function: &IrFunction, mut array: IrId) -> IrId {
    while function.opcode(array) == Opcode::NullCheck {
        array = function.input(array, 0);
    }
    array
}

#[derive(Debug, Clone, Copy)]
struct RangeEntry {
    range: BoundsRange,
    /// Established by a branch condition rather than by the definition
    narrowed: bool,
}

/// Ranges of one function.
pub struct BoundsRangeInfo<'a> {
    function: &'a IrFunction,
    domtree: DominatorTree,
    loops: LoopNestInfo,
    countable: FxHashMap<IrBlockId, (CountableLoopInfo, bool)>,
    ranges: FxHashMap<IrBlockId, FxHashMap<IrId, RangeEntry>>,
}

impl<'a> BoundsRangeInfo<'a> {
    /// Analyze `function` from scratch.
    pub fn compute(function: &'a IrFunction) -> Self {
        let domtree = DominatorTree::compute(function);
        let loops = LoopNestInfo::analyze(function, &domtree);
        let mut countable = FxHashMap::default();
        for natural_loop in loops.loops.values() {
            if let Some(info) = CountableLoopParser::new(function, natural_loop).parse() {
                let pre_compare = has_pre_header_compare(function, natural_loop, &info);
                countable.insert(natural_loop.header, (info, pre_compare));
            }
        }

        let mut analysis = Self {
            function,
            domtree,
            loops,
            countable,
            ranges: FxHashMap::default(),
        };
        let rpo = analysis.domtree.rpo().to_vec();
        for block in rpo {
            analysis.narrow_on_entry(block);
            let b = function.block(block);
            for &phi in &b.phis {
                if Self::tracks(function.inst(phi).ty) {
                    let range = analysis.phi_range(block, phi);
                    analysis.set(block, phi, range, false);
                }
            }
            for &id in &b.instructions {
                if Self::tracks(function.inst(id).ty) {
                    let range = analysis.inst_range(block, id);
                    analysis.set(block, id, range, false);
                }
            }
        }

        debug!(
            "bounds analysis of {}: {} countable loops",
            function.name,
            analysis.countable.len()
        );
        trace!("{}", analysis.dump());
        analysis
    }

    fn tracks(ty: DataType) -> bool {
        ty.is_integer() || ty == DataType::Bool || ty == DataType::Reference
    }

    pub fn domtree(&self) -> &DominatorTree {
        &self.domtree
    }

    pub fn loops(&self) -> &LoopNestInfo {
        &self.loops
    }

    /// Countable-loop descriptor of the loop headed by `header`.
    pub fn countable_loop(&self, header: IrBlockId) -> Option<&CountableLoopInfo> {
        self.countable.get(&header).map(|(info, _)| info)
    }

    pub fn has_pre_header_compare(&self, header: IrBlockId) -> bool {
        self.countable.get(&header).map(|(_, pre)| *pre).unwrap_or(false)
    }

    fn set(&mut self, block: IrBlockId, inst: IrId, range: BoundsRange, narrowed: bool) {
        self.ranges
            .entry(block)
            .or_default()
            .insert(inst, RangeEntry { range, narrowed });
    }

    /// Override the range of `inst` from `block` down.
    pub fn set_bounds_range(&mut self, block: IrBlockId, inst: IrId, range: BoundsRange) {
        self.set(block, inst, range, true);
    }

    fn find_entry(&self, block: IrBlockId, inst: IrId) -> Option<RangeEntry> {
        let mut current = Some(block);
        while let Some(b) = current {
            if let Some(entry) = self.ranges.get(&b).and_then(|m| m.get(&inst)) {
                return Some(*entry);
            }
            current = self.domtree.idom(b);
        }
        None
    }

    /// Range of `inst` as seen from `block`.
    pub fn find_bounds_range(&self, block: IrBlockId, inst: IrId) -> BoundsRange {
        match self.find_entry(block, inst) {
            Some(entry) => entry.range,
            None => self.default_range(inst),
        }
    }

    /// Range of `inst` seen from `block`, and whether a branch condition
    /// (rather than the definition) established it.
    pub fn find_bounds_range_with_origin(&self, block: IrBlockId, inst: IrId) -> (BoundsRange, bool) {
        match self.find_entry(block, inst) {
            Some(entry) => (entry.range, entry.narrowed),
            None => (self.default_range(inst), false),
        }
    }

    /// `inst` is a reference known to be non-null in `block`.
    pub fn is_inst_not_null(&self, block: IrBlockId, inst: IrId) -> bool {
        self.function.inst(inst).ty == DataType::Reference && self.find_bounds_range(block, inst).left > 0
    }

    fn default_range(&self, inst: IrId) -> BoundsRange {
        let i = self.function.inst(inst);
        match i.constant_value() {
            Some(v) => BoundsRange::constant(v),
            None => BoundsRange::for_type(i.ty),
        }
    }

    // === Branch narrowing ===

    fn narrow_on_entry(&mut self, block: IrBlockId) {
        let function = self.function;
        let [pred] = function.block(block).predecessors.as_slice() else {
            return;
        };
        let pred = *pred;
        let IrTerminator::IfImm {
            cond,
            cc,
            imm,
            true_target,
            false_target,
        } = function.block(pred).terminator
        else {
            return;
        };
        if true_target == false_target {
            return;
        }
        let on_true = true_target == block;
        // Which boolean outcomes of `cond` send control along this edge.
        let taken_when = |v: i64| cc.evaluate(v, imm) == on_true;

        let cond_inst = function.inst(cond);
        match cond_inst.opcode {
            Opcode::Compare(compare_cc) => {
                let effective = match (taken_when(1), taken_when(0)) {
                    (true, false) => compare_cc,
                    (false, true) => compare_cc.inverse(),
                    _ => return,
                };
                let (lhs, rhs) = (cond_inst.input(0), cond_inst.input(1));
                self.narrow_operand(block, pred, lhs, effective, rhs);
                self.narrow_operand(block, pred, rhs, effective.swap(), lhs);
            }
            Opcode::IsInstance(_) => {
                if taken_when(1) && !taken_when(0) {
                    let object = cond_inst.input(0);
                    let range = self.find_bounds_range(pred, object);
                    if let Some(narrowed) = range.narrow(ConditionCode::Ge, &BoundsRange::constant(1)) {
                        if narrowed != range {
                            self.set(block, object, narrowed, true);
                        }
                    }
                }
            }
            _ if Self::tracks(cond_inst.ty) => {
                let effective = if on_true { cc } else { cc.inverse() };
                let range = self.find_bounds_range(pred, cond);
                if let Some(narrowed) = range.narrow(effective, &BoundsRange::constant(imm)) {
                    if narrowed != range {
                        self.set(block, cond, narrowed, true);
                    }
                }
            }
            _ => {}
        }
    }

    fn narrow_operand(&mut self, block: IrBlockId, pred: IrBlockId, value: IrId, cc: ConditionCode, bound: IrId) {
        let function = self.function;
        if !Self::tracks(function.inst(value).ty) {
            return;
        }
        let range = self.find_bounds_range(pred, value);
        let bound_range = self.find_bounds_range(pred, bound);
        let Some(mut narrowed) = range.narrow(cc, &bound_range) else {
            return;
        };
        if cc == ConditionCode::Lt && function.opcode(bound) == Opcode::LenArray {
            let array = array_root(function, function.input(bound, 0));
            narrowed = narrowed.with_len_array(array, range.actual_length_loop);
        }
        if narrowed != range {
            self.set(block, value, narrowed, true);
        }
    }

    // === Definitions ===

    fn phi_range(&self, block: IrBlockId, phi: IrId) -> BoundsRange {
        let function = self.function;
        let inst = function.inst(phi);
        if let Some(natural_loop) = self.loops.loops.get(&block) {
            if let Some((info, pre_compare)) = self.countable.get(&block) {
                if info.index == phi {
                    if let Some(preheader) = natural_loop.preheader {
                        return self.loop_phi_range(block, preheader, info, *pre_compare).fit_in_type(inst.ty);
                    }
                }
            }
            return BoundsRange::for_type(inst.ty);
        }

        let preds = &function.block(block).predecessors;
        let mut ranges = inst
            .inputs
            .iter()
            .zip(preds.iter())
            .map(|(&input, &pred)| self.find_bounds_range(pred, input));
        match ranges.next() {
            Some(first) => ranges.fold(first, |acc, r| acc.union(&r)).fit_in_type(inst.ty),
            None => BoundsRange::for_type(inst.ty),
        }
    }

    fn loop_phi_range(
        &self,
        header: IrBlockId,
        preheader: IrBlockId,
        info: &CountableLoopInfo,
        pre_compare: bool,
    ) -> BoundsRange {
        let function = self.function;
        let ty = function.inst(info.index).ty;
        let init = self.find_bounds_range(preheader, info.init);
        let test = self.find_bounds_range(preheader, info.test);
        let Ok(step) = i64::try_from(info.const_step) else {
            return BoundsRange::for_type(ty);
        };
        let inclusive = matches!(info.normalized_cc, ConditionCode::Le | ConditionCode::Ge);

        let range = if info.is_inc {
            let Some(last_passing) = (if inclusive { Some(test.right) } else { test.right.checked_sub(1) }) else {
                return BoundsRange::for_type(ty);
            };
            let upper = if info.head_exit {
                last_passing.checked_add(step).map(|v| init.right.max(v))
            } else if pre_compare {
                Some(last_passing)
            } else {
                Some(init.right.max(last_passing))
            };
            // The update of the largest passing value must not wrap.
            let wraps = |u: i64| u.checked_add(step).map_or(true, |next| next > ty.max_value());
            match upper {
                Some(u) if init.left <= u && (info.head_exit || !wraps(u)) => BoundsRange::new(init.left, u),
                _ => return BoundsRange::for_type(ty),
            }
        } else {
            let Some(last_passing) = (if inclusive { Some(test.left) } else { test.left.checked_add(1) }) else {
                return BoundsRange::for_type(ty);
            };
            let lower = if info.head_exit {
                last_passing.checked_sub(step).map(|v| init.left.min(v))
            } else if pre_compare {
                Some(last_passing)
            } else {
                Some(init.left.min(last_passing))
            };
            let wraps = |l: i64| l.checked_sub(step).map_or(true, |next| next < ty.min_value());
            match lower {
                Some(l) if l <= init.right && (info.head_exit || !wraps(l)) => BoundsRange::new(l, init.right),
                _ => return BoundsRange::for_type(ty),
            }
        };

        if !info.head_exit
            && pre_compare
            && info.is_inc
            && info.normalized_cc == ConditionCode::Lt
            && function.opcode(info.test) == Opcode::LenArray
        {
            let array = array_root(function, function.input(info.test, 0));
            return range.with_len_array(array, Some(header));
        }
        range
    }

    fn inst_range(&self, block: IrBlockId, id: IrId) -> BoundsRange {
        let function = self.function;
        let inst = function.inst(id);
        let ty = inst.ty;
        let input = |k: usize| self.find_bounds_range(block, inst.input(k));
        let non_null = BoundsRange::new(1, MAX_RANGE_VALUE);

        let range = match inst.opcode {
            Opcode::Constant(v) => return BoundsRange::constant(v),
            Opcode::NullPtr => return BoundsRange::constant(0),
            Opcode::NewObject(_) | Opcode::NewArray(_) | Opcode::LoadString(_) => return non_null,
            Opcode::NullCheck => return input(0).intersect(&non_null).unwrap_or(non_null),

            Opcode::BoundsCheck => {
                let index = input(1);
                let len = input(0);
                match len.right.checked_sub(1).map(|r| BoundsRange::new(0, r.max(0))) {
                    Some(valid) => index.intersect(&valid).unwrap_or(index),
                    None => index,
                }
            }
            Opcode::NegativeCheck => {
                let value = input(0);
                value.intersect(&BoundsRange::new(0, MAX_RANGE_VALUE)).unwrap_or(value)
            }
            Opcode::NotPositiveCheck => {
                let value = input(0);
                value.intersect(&non_null).unwrap_or(value)
            }
            Opcode::ZeroCheck | Opcode::NegOverflowAndZeroCheck => {
                let value = input(0);
                value.narrow(ConditionCode::Ne, &BoundsRange::constant(0)).unwrap_or(value)
            }
            Opcode::AddOverflowCheck => {
                let sum = input(0).add(&input(1));
                sum.intersect(&BoundsRange::for_type(ty)).unwrap_or_else(|| BoundsRange::for_type(ty))
            }
            Opcode::SubOverflowCheck => {
                let diff = input(0).sub(&input(1));
                diff.intersect(&BoundsRange::for_type(ty)).unwrap_or_else(|| BoundsRange::for_type(ty))
            }
            Opcode::RefTypeCheck => input(1),
            Opcode::AnyTypeCheck(_) => input(0),

            Opcode::LenArray => {
                let max_len = BoundsRange::new(0, i32::MAX as i64);
                let array = array_root(function, inst.input(0));
                if let Opcode::NewArray(_) = function.opcode(array) {
                    let size = self.find_bounds_range(block, function.input(array, 0));
                    size.untagged().intersect(&max_len).unwrap_or(max_len)
                } else {
                    max_len
                }
            }

            Opcode::Add => input(0).add(&input(1)),
            Opcode::Sub => input(0).sub(&input(1)),
            Opcode::Mul => input(0).mul(&input(1)),
            Opcode::Div => input(0).div(&input(1)),
            Opcode::Mod => input(0).modulo(&input(1)),
            Opcode::Neg => input(0).neg(),
            Opcode::Abs => input(0).abs(),
            Opcode::Not => input(0).not(),
            Opcode::And => input(0).and(&input(1)),
            Opcode::Or => input(0).or(&input(1)),
            Opcode::Xor => input(0).xor(&input(1)),
            Opcode::Shl => input(0).shl(&input(1), ty.bit_width()),
            Opcode::Shr => input(0).shr(&input(1), ty.bit_width()),
            Opcode::AShr => input(0).ashr(&input(1), ty.bit_width()),
            Opcode::Cast => input(0).untagged(),

            Opcode::Compare(cc) => {
                let (a, b) = (input(0), input(1));
                let always = match cc {
                    ConditionCode::Lt => a.is_less(&b),
                    ConditionCode::Le => a.right <= b.left,
                    ConditionCode::Gt => a.is_more(&b),
                    ConditionCode::Ge => a.left >= b.right,
                    ConditionCode::Eq => a.is_const().is_some() && a.is_const() == b.is_const(),
                    ConditionCode::Ne => a.intersect(&b).is_none(),
                };
                let never = match cc {
                    ConditionCode::Lt => a.left >= b.right,
                    ConditionCode::Le => a.is_more(&b),
                    ConditionCode::Gt => a.right <= b.left,
                    ConditionCode::Ge => a.is_less(&b),
                    ConditionCode::Eq => a.intersect(&b).is_none(),
                    ConditionCode::Ne => a.is_const().is_some() && a.is_const() == b.is_const(),
                };
                if always {
                    BoundsRange::constant(1)
                } else if never {
                    BoundsRange::constant(0)
                } else {
                    BoundsRange::new(0, 1)
                }
            }

            _ => BoundsRange::for_type(ty),
        };
        range.untagged_unless_forwarded(inst.opcode).fit_in_type(ty)
    }

    // === Debug ===

    /// Text rendering of every recorded range, by block in RPO.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        writeln!(out, "bounds ranges of @{}", self.function.name).unwrap();
        for block in self.domtree.rpo() {
            let Some(entries) = self.ranges.get(block) else {
                continue;
            };
            writeln!(out, "{}:", block).unwrap();
            let mut ids: Vec<&IrId> = entries.keys().collect();
            ids.sort();
            for id in ids {
                let entry = entries[id];
                write!(out, "  {} {}", id, entry.range).unwrap();
                if entry.narrowed {
                    write!(out, " narrowed").unwrap();
                }
                writeln!(out).unwrap();
            }
        }
        out
    }
}

impl BoundsRange {
    /// Checks forward their operand, tags included; computed values
    /// start untagged.
    fn untagged_unless_forwarded(self, opcode: Opcode) -> BoundsRange {
        if opcode.forwarded_input().is_some() {
            self
        } else {
            self.untagged()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::instructions::TypeId;

    #[test]
    fn test_point_arithmetic_is_exact() {
        let a = BoundsRange::constant(7);
        let b = BoundsRange::constant(-3);
        assert_eq!(a.add(&b), BoundsRange::constant(4));
        assert_eq!(a.sub(&b), BoundsRange::constant(10));
        assert_eq!(a.mul(&b), BoundsRange::constant(-21));
        assert_eq!(a.div(&b), BoundsRange::constant(-2));
    }

    #[test]
    fn test_overflow_widens_instead_of_wrapping() {
        let big = BoundsRange::constant(i64::MAX);
        let one = BoundsRange::constant(1);
        assert_eq!(big.add(&one), BoundsRange::full());
        assert_eq!(BoundsRange::constant(i64::MIN).sub(&one), BoundsRange::full());
        assert_eq!(big.mul(&BoundsRange::constant(2)), BoundsRange::full());
        assert_eq!(BoundsRange::constant(i64::MIN).neg(), BoundsRange::full());
    }

    #[test]
    fn test_division_by_range_spanning_zero_is_unknown() {
        let a = BoundsRange::new(10, 20);
        assert_eq!(a.div(&BoundsRange::new(-1, 1)), BoundsRange::full());
        assert_eq!(a.modulo(&BoundsRange::new(-1, 1)), BoundsRange::full());
        assert_eq!(a.div(&BoundsRange::new(2, 5)), BoundsRange::new(2, 10));
        assert_eq!(a.modulo(&BoundsRange::constant(8)), BoundsRange::new(0, 7));
    }

    #[test]
    fn test_shift_amount_is_masked() {
        let a = BoundsRange::new(1, 4);
        // 33 & 31 == 1 for a 32-bit shift.
        assert_eq!(a.shl(&BoundsRange::constant(33), 32), BoundsRange::new(2, 8));
        assert_eq!(BoundsRange::new(-8, 8).ashr(&BoundsRange::constant(2), 32), BoundsRange::new(-2, 2));
    }

    #[test]
    fn test_fit_in_type() {
        let wide = BoundsRange::new(0, i32::MAX as i64 + 1);
        assert_eq!(wide.fit_in_type(DataType::Int32), BoundsRange::for_type(DataType::Int32));
        assert_eq!(wide.fit_in_type(DataType::Int64), wide);
    }

    #[test]
    fn test_narrow_by_condition() {
        let x = BoundsRange::new(0, 100);
        let len = BoundsRange::new(0, 10);
        assert_eq!(x.narrow(ConditionCode::Lt, &len), Some(BoundsRange::new(0, 9)));
        assert_eq!(x.narrow(ConditionCode::Ge, &BoundsRange::constant(5)), Some(BoundsRange::new(5, 100)));
        assert_eq!(x.narrow(ConditionCode::Ne, &BoundsRange::constant(0)), Some(BoundsRange::new(1, 100)));
        assert_eq!(x.narrow(ConditionCode::Gt, &BoundsRange::constant(100)), None);
    }

    #[test]
    fn test_constants_lie_in_their_range() {
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Int32);
        let c = b.constant_typed(-5, DataType::Int32);
        let sum = b.binary(Opcode::Add, DataType::Int32, c, c);
        let mask = b.constant_typed(15, DataType::Int32);
        let masked = b.binary(Opcode::And, DataType::Int32, p, mask);
        b.ret(None);
        let func = b.finish();

        let info = BoundsRangeInfo::compute(&func);
        let entry = func.entry_block();
        assert_eq!(info.find_bounds_range(entry, c), BoundsRange::constant(-5));
        assert_eq!(info.find_bounds_range(entry, sum), BoundsRange::constant(-10));
        assert_eq!(info.find_bounds_range(entry, masked), BoundsRange::new(0, 15));
    }

    #[test]
    fn test_branch_narrowing_and_null_tracking() {
        //     bb0: if p != null
        //     /  \
        //   bb1  bb2
        let mut b = IrBuilder::new("f");
        let p = b.parameter(0, DataType::Reference);
        let null = b.null_ptr();
        let bb1 = b.create_block();
        let bb2 = b.create_block();
        let cmp = b.compare(ConditionCode::Ne, p, null);
        b.if_imm(cmp, ConditionCode::Ne, 0, bb1, bb2);
        b.switch_to_block(bb1);
        b.ret(None);
        b.switch_to_block(bb2);
        b.ret(None);
        let func = b.finish();

        let info = BoundsRangeInfo::compute(&func);
        assert!(info.is_inst_not_null(bb1, p));
        assert!(!info.is_inst_not_null(bb2, p));
        assert!(!info.is_inst_not_null(func.entry_block(), p));
        let (range, narrowed) = info.find_bounds_range_with_origin(bb1, p);
        assert!(narrowed);
        assert_eq!(range.left(), 1);
    }

    #[test]
    fn test_loop_index_bounded_by_array_length() {
        let mut b = IrBuilder::new("sum");
        let arr = b.parameter(0, DataType::Reference);
        let ss = b.save_state(&[arr]);
        let nc = b.null_check(arr, ss);
        let len = b.len_array(nc);
        let zero = b.constant_typed(0, DataType::Int32);
        let lp = b.begin_counted_loop(zero, len, ConditionCode::Lt, 1);
        let body = b.current_block();
        b.end_counted_loop(&lp);
        b.ret(None);
        let func = b.finish();

        let info = BoundsRangeInfo::compute(&func);
        let in_header = info.find_bounds_range(lp.header, lp.index);
        assert_eq!(in_header.left(), 0);
        let in_body = info.find_bounds_range(body, lp.index);
        assert_eq!(in_body, BoundsRange::new(0, i32::MAX as i64 - 1).with_len_array(arr, None));
    }

    /// `i = init; do { } while ((i op= step) cc n)` with `n` a parameter.
    fn do_while_to_param(init: i64, op: Opcode, step: i64, cc: ConditionCode) -> (IrFunction, IrBlockId, IrId) {
        let mut b = IrBuilder::new("do_while");
        let n = b.parameter(0, DataType::Int32);
        let init = b.constant_typed(init, DataType::Int32);
        let step = b.constant_typed(step, DataType::Int32);
        let preheader = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.goto(preheader);
        b.switch_to_block(preheader);
        b.goto(body);
        b.switch_to_block(body);
        let i = b.phi(DataType::Int32, &[init]);
        let update = b.binary(op, DataType::Int32, i, step);
        let cmp = b.compare(cc, update, n);
        b.if_imm(cmp, ConditionCode::Ne, 0, body, exit);
        b.add_phi_input(i, update);
        b.switch_to_block(exit);
        b.ret(None);
        (b.finish(), body, i)
    }

    #[test]
    fn test_back_edge_exit_index_may_wrap() {
        // With n == i32::MAX the update wraps to a negative value that
        // still passes the test.
        for (op, step, cc) in [
            (Opcode::Add, 2, ConditionCode::Lt),
            (Opcode::Add, 1, ConditionCode::Le),
        ] {
            let (func, body, i) = do_while_to_param(0, op, step, cc);
            let info = BoundsRangeInfo::compute(&func);
            assert_eq!(info.find_bounds_range(body, i), BoundsRange::for_type(DataType::Int32));
        }

        // Decreasing towards i32::MIN wraps the other way.
        let (func, body, i) = do_while_to_param(0, Opcode::Sub, 3, ConditionCode::Gt);
        let info = BoundsRangeInfo::compute(&func);
        assert_eq!(info.find_bounds_range(body, i), BoundsRange::for_type(DataType::Int32));
    }

    #[test]
    fn test_back_edge_exit_index_with_headroom() {
        let mut b = IrBuilder::new("do_while");
        let zero = b.constant_typed(0, DataType::Int32);
        let limit = b.constant_typed(100, DataType::Int32);
        let two = b.constant_typed(2, DataType::Int32);
        let preheader = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.goto(preheader);
        b.switch_to_block(preheader);
        b.goto(body);
        b.switch_to_block(body);
        let i = b.phi(DataType::Int32, &[zero]);
        let update = b.binary(Opcode::Add, DataType::Int32, i, two);
        let cmp = b.compare(ConditionCode::Lt, update, limit);
        b.if_imm(cmp, ConditionCode::Ne, 0, body, exit);
        b.add_phi_input(i, update);
        b.switch_to_block(exit);
        b.ret(None);
        let func = b.finish();

        let info = BoundsRangeInfo::compute(&func);
        assert_eq!(info.find_bounds_range(body, i), BoundsRange::new(0, 99));
    }

    #[test]
    fn test_new_array_length_uses_size_range() {
        let mut b = IrBuilder::new("f");
        let ss = b.save_state(&[]);
        let size = b.constant_typed(16, DataType::Int32);
        let arr = b.new_array(TypeId(1), size, ss);
        let len = b.len_array(arr);
        b.ret(None);
        let func = b.finish();

        let info = BoundsRangeInfo::compute(&func);
        assert_eq!(info.find_bounds_range(func.entry_block(), len), BoundsRange::constant(16));
        assert!(info.is_inst_not_null(func.entry_block(), arr));
        assert!(info.dump().contains("[16, 16]"));
    }
}
