//! Alias Analysis
//!
//! Inclusion-based points-to analysis over pointer abstractions, with
//! field-sensitive memory nodes and escape tracking.
//!
//! # Pointers
//!
//! A [`Pointer`] names a class of memory: an object, a field of an object,
//! the elements of an array, a dictionary slot, a static field or a pool
//! constant. Every reference-typed value `v` has an `Object(v)` node whose
//! solution is the set of abstract objects `v` may hold. An abstract object
//! is named by the instruction that produced it: an allocation, or a
//! parameter, call or load whose object we know nothing about.
//!
//! # Constraints
//!
//! ```text
//! v = NewObject / Parameter / Load*   direct   Object(v) ∋ Object(v)
//! v = NullCheck a / Phi a, b          copy     Object(a) ⊆ Object(v)
//! Store b.f <- v                      ∀o ∈ Object(b): Object(v) ⊆ Field(o.f)
//! v = Load b.f                        ∀o ∈ Object(b): Field(o.f) ⊆ Object(v)
//! ```
//!
//! Load and store constraints derive new copy edges as the base's solution
//! grows, so the solver is a worklist over nodes. Escapes are propagated
//! afterwards: a value is *local* only when every object it may hold is an
//! allocation of this function that never becomes reachable from a static,
//! a call argument, a returned value or another escaping object.

use super::functions::IrFunction;
use super::instructions::{InstFlags, Opcode};
use super::loop_analysis::{DominatorTree, LoopNestInfo};
use super::value_numbering::ValueNumbering;
use super::{DataType, IrBlockId, IrId, IrTerminator};
use fxhash::{FxHashMap, FxHashSet};
use indexmap::{IndexMap, IndexSet};
use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};
use std::fmt::{self, Write};
use std::hash::{Hash, Hasher};
use tracing::{debug, trace};

/// Verdict of an alias query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasType {
    NoAlias,
    MayAlias,
    MustAlias,
    /// Same location provided the two bases are the same object at run time
    AliasIfBaseEquals,
}

impl AliasType {
    pub fn may_alias(self) -> bool {
        self != AliasType::NoAlias
    }
}

impl fmt::Display for AliasType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AliasType::NoAlias => "NO_ALIAS",
            AliasType::MayAlias => "MAY_ALIAS",
            AliasType::MustAlias => "MUST_ALIAS",
            AliasType::AliasIfBaseEquals => "ALIAS_IF_BASE_EQUALS",
        };
        f.write_str(name)
    }
}

/// Three-valued answer of an offset comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trilean {
    Equal,
    Unequal,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PointerKind {
    Object,
    ObjectField,
    ArrayElement,
    DictionaryElement,
    StaticField,
    PoolConstant,
    /// Native memory at a constant byte offset from the base
    RawOffset,
    /// Native memory at an offset only known at run time
    UnknownOffset,
}

impl PointerKind {
    fn is_raw(self) -> bool {
        matches!(self, PointerKind::RawOffset | PointerKind::UnknownOffset)
    }
}

/// Abstract memory location.
///
/// Identity is `(kind, base, idx, imm)`; `type_ptr` only refines
/// disambiguation and does not take part in equality.
#[derive(Debug, Clone, Copy)]
pub struct Pointer {
    pub kind: PointerKind,
    pub base: Option<IrId>,
    pub idx: Option<IrId>,
    pub imm: i64,
    pub type_ptr: Option<u32>,
}

impl Pointer {
    fn key(&self) -> (PointerKind, Option<IrId>, Option<IrId>, i64) {
        (self.kind, self.base, self.idx, self.imm)
    }

    pub fn object(base: IrId) -> Self {
        Self {
            kind: PointerKind::Object,
            base: Some(base),
            idx: None,
            imm: 0,
            type_ptr: None,
        }
    }

    pub fn field(base: IrId, field: u32) -> Self {
        Self {
            kind: PointerKind::ObjectField,
            base: Some(base),
            idx: None,
            imm: field as i64,
            type_ptr: Some(field),
        }
    }

    pub fn array_element(base: IrId, idx: Option<IrId>, imm: i64) -> Self {
        Self {
            kind: PointerKind::ArrayElement,
            base: Some(base),
            idx,
            imm,
            type_ptr: None,
        }
    }

    pub fn dictionary_element(base: IrId, key: IrId) -> Self {
        Self {
            kind: PointerKind::DictionaryElement,
            base: Some(base),
            idx: Some(key),
            imm: 0,
            type_ptr: None,
        }
    }

    pub fn static_field(field: u32) -> Self {
        Self {
            kind: PointerKind::StaticField,
            base: None,
            idx: None,
            imm: field as i64,
            type_ptr: Some(field),
        }
    }

    pub fn pool_constant(id: u32) -> Self {
        Self {
            kind: PointerKind::PoolConstant,
            base: None,
            idx: None,
            imm: id as i64,
            type_ptr: Some(id),
        }
    }

    pub fn raw_offset(base: IrId, offset: i64) -> Self {
        Self {
            kind: PointerKind::RawOffset,
            base: Some(base),
            idx: None,
            imm: offset,
            type_ptr: None,
        }
    }

    /// `base` is `None` for an address that is not a tracked reference.
    pub fn unknown_offset(base: Option<IrId>, offset: Option<IrId>) -> Self {
        Self {
            kind: PointerKind::UnknownOffset,
            base,
            idx: offset,
            imm: 0,
            type_ptr: None,
        }
    }

    /// Memory node holding the contents of this location for abstract
    /// object `object`: all elements of an array share one node.
    fn content_node(&self, object: IrId) -> Pointer {
        match self.kind {
            PointerKind::ObjectField => Pointer::field(object, self.imm as u32),
            PointerKind::ArrayElement => Pointer::array_element(object, None, 0),
            PointerKind::DictionaryElement => Pointer {
                kind: PointerKind::DictionaryElement,
                base: Some(object),
                idx: None,
                imm: 0,
                type_ptr: None,
            },
            // Raw accesses of different widths can overlap, so an object's
            // native memory is a single node.
            PointerKind::RawOffset | PointerKind::UnknownOffset => Pointer::unknown_offset(Some(object), None),
            _ => *self,
        }
    }
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pointer {}

impl Hash for Pointer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Pointer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pointer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.base.map(|b| b.to_string()).unwrap_or_default();
        match self.kind {
            PointerKind::Object => write!(f, "OBJECT {}", base),
            PointerKind::ObjectField => write!(f, "FIELD {}.F{}", base, self.imm),
            PointerKind::ArrayElement => match self.idx {
                Some(idx) => write!(f, "ELEMENT {}[{}{:+}]", base, idx, self.imm),
                None => write!(f, "ELEMENT {}[{}]", base, self.imm),
            },
            PointerKind::DictionaryElement => match self.idx {
                Some(key) => write!(f, "DICTIONARY {}[{}]", base, key),
                None => write!(f, "DICTIONARY {}[*]", base),
            },
            PointerKind::StaticField => write!(f, "STATIC F{}", self.imm),
            PointerKind::PoolConstant => write!(f, "POOL {}", self.imm),
            PointerKind::RawOffset => write!(f, "RAW_OFFSET {}{:+}", base, self.imm),
            PointerKind::UnknownOffset => match self.idx {
                Some(offset) => write!(f, "UNKNOWN_OFFSET {}+{}", base, offset),
                None => write!(f, "UNKNOWN_OFFSET {}+*", base),
            },
        }
    }
}

/// Solved facts about one pointer.
#[derive(Debug, Clone, Default)]
pub struct PointerInfo {
    /// Abstract objects (as `Object` pointers) this pointer may hold
    pub points_to: BTreeSet<Pointer>,
    /// Every object in `points_to` is a non-escaping local allocation
    pub local: bool,
    pub is_volatile: bool,
}

/// Load or store whose copy edges depend on the solution of its base.
#[derive(Debug, Clone, Copy)]
enum Deferred {
    /// `contents(o) ⊆ dest` for every object `o` of the base
    Load { access: Pointer, dest: Pointer },
    /// `src ⊆ contents(o)` for every object `o` of the base
    Store { access: Pointer, src: Pointer },
}

/// Points-to analysis of one function.
///
/// Built fresh for a function and discarded when the function changes.
pub struct AliasAnalysis<'a> {
    function: &'a IrFunction,
    pointer_info: IndexMap<Pointer, PointerInfo>,
    /// Access pointer of every memory instruction
    accesses: FxHashMap<IrId, Pointer>,
    direct: Vec<(Pointer, Pointer)>,
    chains: FxHashMap<Pointer, IndexSet<Pointer>>,
    reverse_chains: FxHashMap<Pointer, IndexSet<Pointer>>,
    /// Deferred constraints keyed by the `Object` node of their base
    deferred: FxHashMap<Pointer, Vec<Deferred>>,
    /// Pointers escaping unconditionally
    escape_roots: Vec<Pointer>,
    escaped: FxHashSet<Pointer>,
    value_numbers: Option<ValueNumbering>,
    /// Instructions executed at most once per call
    outside_loops: FxHashSet<IrId>,
}

impl<'a> AliasAnalysis<'a> {
    pub fn new(function: &'a IrFunction) -> Self {
        Self {
            function,
            pointer_info: IndexMap::new(),
            accesses: FxHashMap::default(),
            direct: Vec::new(),
            chains: FxHashMap::default(),
            reverse_chains: FxHashMap::default(),
            deferred: FxHashMap::default(),
            escape_roots: Vec::new(),
            escaped: FxHashSet::default(),
            value_numbers: None,
            outside_loops: FxHashSet::default(),
        }
    }

    /// Build and solve the constraint system. Returns false only for a
    /// function without instructions.
    pub fn run(&mut self) -> bool {
        let function = self.function;
        let domtree = DominatorTree::compute(function);
        let loops = LoopNestInfo::analyze(function, &domtree);
        self.value_numbers = Some(ValueNumbering::compute(function));

        for block in domtree.rpo() {
            let in_loop = loops.get_loop(*block).is_some();
            let b = function.block(*block);
            for &id in b.phis.iter().chain(b.instructions.iter()) {
                if !in_loop {
                    self.outside_loops.insert(id);
                }
                self.parse_instruction(id);
            }
            self.parse_terminator(*block);
        }

        self.seed_direct_edges();
        self.solve_constraints();
        self.find_escaping_pointers();
        self.compute_locality();

        debug!(
            "alias analysis of {}: {} pointers, {} escaping",
            self.function.name,
            self.pointer_info.len(),
            self.escaped.len()
        );
        trace!("{}", self.dump());
        function.live_insts().next().is_some()
    }

    // === Parsing ===

    fn node(&mut self, pointer: Pointer) -> &mut PointerInfo {
        self.pointer_info.entry(pointer).or_default()
    }

    fn add_direct_edge(&mut self, pointer: Pointer, target: Pointer) {
        self.node(pointer);
        self.direct.push((pointer, target));
    }

    fn add_copy_edge(&mut self, from: Pointer, to: Pointer) -> bool {
        self.node(from);
        self.node(to);
        self.reverse_chains.entry(to).or_default().insert(from);
        self.chains.entry(from).or_default().insert(to)
    }

    fn is_reference(&self, id: IrId) -> bool {
        self.function.inst(id).ty == DataType::Reference
    }

    /// Access pointer of a memory instruction, `None` for anything else.
    pub fn parse_access(function: &IrFunction, id: IrId) -> Option<Pointer> {
        let inst = function.inst(id);
        let pointer = match inst.opcode {
            Opcode::LoadObject(field) | Opcode::StoreObject(field) => Pointer::field(inst.input(0), field.0),
            Opcode::LoadArray | Opcode::StoreArray => {
                let idx = inst.input(1);
                match function.constant_value(idx) {
                    Some(c) => Pointer::array_element(inst.input(0), None, c),
                    None => Pointer::array_element(inst.input(0), Some(idx), 0),
                }
            }
            Opcode::LoadArrayI(imm) | Opcode::StoreArrayI(imm) => Pointer::array_element(inst.input(0), None, imm),
            Opcode::LoadObjectDynamic | Opcode::StoreObjectDynamic => {
                Pointer::dictionary_element(inst.input(0), inst.input(1))
            }
            Opcode::LoadStatic(field) | Opcode::StoreStatic(field) => Pointer::static_field(field.0),
            Opcode::LoadString(id) => Pointer::pool_constant(id.0),
            Opcode::LoadRaw | Opcode::StoreRaw => {
                let (base, offset) = (inst.input(0), inst.input(1));
                if function.inst(base).ty != DataType::Reference {
                    Pointer::unknown_offset(None, Some(offset))
                } else {
                    match function.constant_value(offset) {
                        Some(c) => Pointer::raw_offset(base, c),
                        None => Pointer::unknown_offset(Some(base), Some(offset)),
                    }
                }
            }
            _ => return None,
        };
        Some(pointer)
    }

    fn parse_instruction(&mut self, id: IrId) {
        let function = self.function;
        let inst = function.inst(id);
        let opcode = inst.opcode;
        let object = Pointer::object(id);

        if let Some(access) = Self::parse_access(function, id) {
            self.accesses.insert(id, access);
            let volatile = inst.flags.contains(InstFlags::VOLATILE);
            let info = self.node(access);
            info.is_volatile |= volatile;

            let base_object = access.base.map(Pointer::object);
            if opcode.is_load() && self.is_reference(id) {
                // The loaded object itself is unknown to us.
                self.add_direct_edge(object, object);
                match base_object {
                    Some(base) if access.kind != PointerKind::PoolConstant => {
                        self.node(base);
                        self.deferred.entry(base).or_default().push(Deferred::Load { access, dest: object });
                    }
                    _ => {
                        self.add_copy_edge(access, object);
                    }
                }
            }
            if opcode.is_store() {
                let value = *inst.inputs.last().unwrap_or(&id);
                if self.is_reference(value) {
                    let src = Pointer::object(value);
                    self.node(src);
                    match base_object {
                        Some(base) => {
                            self.node(base);
                            self.deferred.entry(base).or_default().push(Deferred::Store { access, src });
                        }
                        None => {
                            self.add_copy_edge(src, access);
                        }
                    }
                }
            }
            // Memory without a tracked base is reachable from anywhere.
            if base_object.is_none() {
                self.escape_roots.push(access);
            }
        }

        let reference = inst.ty == DataType::Reference;
        let mut modeled = opcode.is_load() || opcode.is_constant();
        match opcode {
            Opcode::NewObject(_) | Opcode::NewArray(_) => {
                self.add_direct_edge(object, object);
                modeled = true;
            }
            Opcode::Parameter(_) | Opcode::CallStatic(_) if reference => {
                self.add_direct_edge(object, object);
                self.escape_roots.push(object);
                modeled = true;
            }
            Opcode::Phi if reference => {
                for &input in &inst.inputs {
                    self.add_copy_edge(Pointer::object(input), object);
                }
                modeled = true;
            }
            Opcode::Cast if reference => {
                self.add_copy_edge(Pointer::object(inst.input(0)), object);
                modeled = true;
            }
            _ => {
                // Checks hand their operand through unchanged.
                if let Some(src) = inst.forwarded().filter(|_| reference) {
                    self.add_copy_edge(Pointer::object(src), object);
                    modeled = true;
                }
            }
        }

        if let Opcode::CallStatic(_) = opcode {
            for &arg in &inst.inputs {
                if self.is_reference(arg) {
                    self.escape_roots.push(Pointer::object(arg));
                }
            }
        }
        if reference && !modeled {
            // Any other reference producer holds an unknown object.
            self.add_direct_edge(object, object);
            self.escape_roots.push(object);
        }
        if opcode == Opcode::NullPtr {
            self.node(object);
        }
    }

    fn parse_terminator(&mut self, block: IrBlockId) {
        let function = self.function;
        if let IrTerminator::Return { value: Some(value) } = function.block(block).terminator {
            if self.is_reference(value) {
                self.escape_roots.push(Pointer::object(value));
            }
        }
    }

    // === Solving ===

    fn seed_direct_edges(&mut self) {
        for (pointer, target) in std::mem::take(&mut self.direct) {
            self.node(pointer).points_to.insert(target);
            self.direct.push((pointer, target));
        }
    }

    /// Union `from`'s solution into `to`; true if `to` grew.
    fn propagate(&mut self, from: Pointer, to: Pointer) -> bool {
        let incoming = self.pointer_info.get(&from).map(|i| i.points_to.clone()).unwrap_or_default();
        let target = self.node(to);
        let before = target.points_to.len();
        target.points_to.extend(incoming);
        target.points_to.len() != before
    }

    fn solve_constraints(&mut self) {
        let mut worklist: VecDeque<Pointer> = self
            .pointer_info
            .iter()
            .filter(|(_, info)| !info.points_to.is_empty())
            .map(|(p, _)| *p)
            .collect();
        let mut queued: FxHashSet<Pointer> = worklist.iter().copied().collect();

        while let Some(pointer) = worklist.pop_front() {
            queued.remove(&pointer);
            let objects: Vec<Pointer> = self.pointer_info[&pointer].points_to.iter().copied().collect();

            // Derive copy edges through the objects this base may hold.
            let deferred = self.deferred.get(&pointer).cloned().unwrap_or_default();
            for constraint in deferred {
                for object in &objects {
                    let Some(o) = object.base else { continue };
                    let (from, to) = match constraint {
                        Deferred::Load { access, dest } => (access.content_node(o), dest),
                        Deferred::Store { access, src } => (src, access.content_node(o)),
                    };
                    if self.add_copy_edge(from, to) && self.propagate(from, to) && queued.insert(to) {
                        worklist.push_back(to);
                    }
                }
            }

            let successors: Vec<Pointer> = self
                .chains
                .get(&pointer)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for succ in successors {
                if self.propagate(pointer, succ) && queued.insert(succ) {
                    worklist.push_back(succ);
                }
            }
        }
    }

    /// Mark everything reachable from an escape root as escaping: the
    /// objects a root may hold, the memory of those objects, and whatever
    /// flows into an escaping node.
    fn find_escaping_pointers(&mut self) {
        let mut worklist: Vec<Pointer> = std::mem::take(&mut self.escape_roots);
        let mut contents_of: FxHashMap<IrId, Vec<Pointer>> = FxHashMap::default();
        for pointer in self.pointer_info.keys() {
            if pointer.kind != PointerKind::Object {
                if let Some(base) = pointer.base {
                    contents_of.entry(base).or_default().push(*pointer);
                }
            }
        }

        while let Some(pointer) = worklist.pop() {
            if !self.escaped.insert(pointer) {
                continue;
            }
            if let Some(info) = self.pointer_info.get(&pointer) {
                worklist.extend(info.points_to.iter().copied());
            }
            if pointer.kind == PointerKind::Object {
                if let Some(nodes) = pointer.base.and_then(|b| contents_of.get(&b)) {
                    worklist.extend(nodes.iter().copied());
                }
            }
            if let Some(sources) = self.reverse_chains.get(&pointer) {
                worklist.extend(sources.iter().copied());
            }
        }
    }

    fn is_local_object(&self, object: &Pointer) -> bool {
        object.kind == PointerKind::Object
            && !self.escaped.contains(object)
            && object
                .base
                .map(|b| self.function.opcode(b).is_allocation())
                .unwrap_or(false)
    }

    fn compute_locality(&mut self) {
        let locality: Vec<bool> = self
            .pointer_info
            .iter()
            .map(|(pointer, info)| {
                let objects = match pointer.kind {
                    PointerKind::Object => info.points_to.clone(),
                    // A location is local when its base object is.
                    _ => pointer
                        .base
                        .and_then(|b| self.pointer_info.get(&Pointer::object(b)))
                        .map(|i| i.points_to.clone())
                        .unwrap_or_default(),
                };
                !objects.is_empty() && objects.iter().all(|o| self.is_local_object(o))
            })
            .collect();
        for ((_, info), local) in self.pointer_info.iter_mut().zip(locality) {
            info.local = local;
        }
    }

    // === Queries ===

    /// Solved information about `pointer`.
    ///
    /// Panics if the pointer never appeared in the constraint system,
    /// which means the caller asked about an instruction of another graph
    /// or of a stale one.
    pub fn get_pointer_info(&self, pointer: &Pointer) -> &PointerInfo {
        match self.pointer_info.get(pointer) {
            Some(info) => info,
            None => panic!("alias analysis has no information for {}", pointer),
        }
    }

    pub fn pointers(&self) -> impl Iterator<Item = (&Pointer, &PointerInfo)> {
        self.pointer_info.iter()
    }

    /// Value held by `id` cannot be observed outside this function.
    pub fn is_local(&self, id: IrId) -> bool {
        self.get_pointer_info(&Pointer::object(id)).local
    }

    fn objects_of(&self, base: IrId) -> &BTreeSet<Pointer> {
        &self.get_pointer_info(&Pointer::object(base)).points_to
    }

    fn access_of(&self, id: IrId) -> Pointer {
        match self.accesses.get(&id) {
            Some(p) => *p,
            None => panic!("{} ({}) is not a memory access", id, self.function.opcode(id)),
        }
    }

    /// Alias verdict for two memory instructions.
    pub fn check_inst_alias(&self, a: IrId, b: IrId) -> AliasType {
        self.check_inst_alias_impl(a, b, false)
    }

    /// Like [`check_inst_alias`](Self::check_inst_alias), but may answer
    /// `AliasIfBaseEquals` where the plain query says `MayAlias`.
    pub fn check_inst_alias_refined(&self, a: IrId, b: IrId) -> AliasType {
        self.check_inst_alias_impl(a, b, true)
    }

    fn check_inst_alias_impl(&self, a: IrId, b: IrId, refined: bool) -> AliasType {
        let p1 = self.access_of(a);
        let p2 = self.access_of(b);
        let volatile = self.function.inst(a).is_volatile() || self.function.inst(b).is_volatile();
        self.check_mem_address(&p1, &p2, volatile, refined)
    }

    fn check_mem_address(&self, p1: &Pointer, p2: &Pointer, volatile: bool, refined: bool) -> AliasType {
        if p1.kind != p2.kind && !(p1.kind.is_raw() && p2.kind.is_raw()) {
            return AliasType::NoAlias;
        }
        match p1.kind {
            PointerKind::StaticField | PointerKind::PoolConstant => {
                return if p1.imm == p2.imm { AliasType::MustAlias } else { AliasType::NoAlias };
            }
            PointerKind::ObjectField if p1.imm != p2.imm => return AliasType::NoAlias,
            PointerKind::ArrayElement | PointerKind::DictionaryElement => {
                // Different slots never overlap, whatever the bases are.
                if self.is_same_offsets(p1, p2) == Trilean::Unequal {
                    return AliasType::NoAlias;
                }
            }
            _ => {}
        }

        let (Some(base1), Some(base2)) = (p1.base, p2.base) else {
            return AliasType::MayAlias;
        };
        if base1 == base2 {
            return self.single_intersection_aliasing(p1, p2, None, volatile, refined);
        }

        let objects1 = self.objects_of(base1);
        let objects2 = self.objects_of(base2);
        let mut common = objects1.intersection(objects2);
        match (common.next(), common.next()) {
            (None, _) => {
                if self.is_local(base1) || self.is_local(base2) {
                    AliasType::NoAlias
                } else {
                    AliasType::MayAlias
                }
            }
            (Some(only), None) if objects1.len() == 1 && objects2.len() == 1 => {
                self.single_intersection_aliasing(p1, p2, Some(only), volatile, refined)
            }
            _ => AliasType::MayAlias,
        }
    }

    /// Both accesses address the same abstract object: either through the
    /// same base value (`object == None`) or through two bases whose only
    /// possible object is `object`.
    fn single_intersection_aliasing(
        &self,
        p1: &Pointer,
        p2: &Pointer,
        object: Option<&Pointer>,
        volatile: bool,
        refined: bool,
    ) -> AliasType {
        match p1.kind {
            PointerKind::ArrayElement | PointerKind::DictionaryElement => match self.is_same_offsets(p1, p2) {
                Trilean::Unequal => return AliasType::NoAlias,
                Trilean::Unknown => return AliasType::MayAlias,
                Trilean::Equal => {}
            },
            PointerKind::ObjectField if p1.imm != p2.imm => return AliasType::NoAlias,
            // Only the same constant offset is known to hit the same bytes.
            PointerKind::RawOffset | PointerKind::UnknownOffset => {
                if p1.kind != PointerKind::RawOffset || p2.kind != PointerKind::RawOffset || p1.imm != p2.imm {
                    return AliasType::MayAlias;
                }
            }
            _ => {}
        }
        if volatile {
            return AliasType::MayAlias;
        }
        let single_instance = match object {
            None => true,
            // The object is created once per call unless its producer sits
            // in a loop.
            Some(o) => o.base.map(|b| self.outside_loops.contains(&b)).unwrap_or(false),
        };
        if single_instance {
            AliasType::MustAlias
        } else if refined {
            AliasType::AliasIfBaseEquals
        } else {
            AliasType::MayAlias
        }
    }

    /// Index of an element access as `(symbolic part, constant offset)`,
    /// folding `x + c`, `x - c` and constants.
    fn normalized_index(&self, pointer: &Pointer) -> (Option<IrId>, i64) {
        let Some(mut idx) = pointer.idx else {
            return (None, pointer.imm);
        };
        let mut imm = pointer.imm;
        loop {
            let inst = self.function.inst(idx);
            if let Some(forwarded) = inst.forwarded() {
                idx = forwarded;
                continue;
            }
            if let Some(c) = inst.constant_value() {
                return (None, imm.wrapping_add(c));
            }
            match inst.opcode {
                Opcode::Add | Opcode::Sub => {
                    let (lhs, rhs) = (inst.input(0), inst.input(1));
                    let c = self.function.constant_value(rhs);
                    let c_left = self.function.constant_value(lhs);
                    match (inst.opcode, c, c_left) {
                        (Opcode::Add, Some(c), _) => {
                            imm = imm.wrapping_add(c);
                            idx = lhs;
                        }
                        (Opcode::Add, None, Some(c)) => {
                            imm = imm.wrapping_add(c);
                            idx = rhs;
                        }
                        (Opcode::Sub, Some(c), _) => {
                            imm = imm.wrapping_sub(c);
                            idx = lhs;
                        }
                        _ => return (Some(idx), imm),
                    }
                }
                _ => return (Some(idx), imm),
            }
        }
    }

    /// Compare the slots two element accesses address.
    pub fn is_same_offsets(&self, p1: &Pointer, p2: &Pointer) -> Trilean {
        let vn = self.value_numbers.as_ref();
        if p1.kind == PointerKind::DictionaryElement {
            return match (p1.idx, p2.idx) {
                (Some(k1), Some(k2)) if k1 == k2 || vn.map(|v| v.same(k1, k2)).unwrap_or(false) => Trilean::Equal,
                (Some(k1), Some(k2)) => match (self.function.constant_value(k1), self.function.constant_value(k2)) {
                    (Some(c1), Some(c2)) if c1 != c2 => Trilean::Unequal,
                    _ => Trilean::Unknown,
                },
                _ => Trilean::Unknown,
            };
        }

        let (idx1, imm1) = self.normalized_index(p1);
        let (idx2, imm2) = self.normalized_index(p2);
        let same_symbol = match (idx1, idx2) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b || vn.map(|v| v.same(a, b)).unwrap_or(false),
            _ => false,
        };
        if !same_symbol {
            return Trilean::Unknown;
        }
        if imm1 == imm2 {
            Trilean::Equal
        } else {
            Trilean::Unequal
        }
    }

    /// Alias verdict for two reference values.
    pub fn check_ref_alias(&self, a: IrId, b: IrId) -> AliasType {
        assert!(
            self.is_reference(a) && self.is_reference(b),
            "check_ref_alias on non-reference values {} and {}",
            a,
            b
        );
        if a == b || self.value_numbers.as_ref().map(|v| v.same(a, b)).unwrap_or(false) {
            return AliasType::MustAlias;
        }
        let objects1 = self.objects_of(a);
        let objects2 = self.objects_of(b);
        if objects1.is_disjoint(objects2) && (self.is_local(a) || self.is_local(b)) {
            return AliasType::NoAlias;
        }
        AliasType::MayAlias
    }

    // === Debug ===

    /// Text rendering of the constraint graph and its solution.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        writeln!(out, "alias analysis of @{}", self.function.name).unwrap();

        writeln!(out, "direct edges:").unwrap();
        for (pointer, target) in &self.direct {
            writeln!(out, "  {} -> {}", pointer, target).unwrap();
        }

        writeln!(out, "copy chains:").unwrap();
        let mut sources: Vec<&Pointer> = self.chains.keys().collect();
        sources.sort();
        for source in sources {
            let targets: Vec<String> = self.chains[source].iter().map(|t| t.to_string()).collect();
            writeln!(out, "  {} -> {}", source, targets.join(", ")).unwrap();
        }

        writeln!(out, "solution:").unwrap();
        for (pointer, info) in &self.pointer_info {
            let objects: Vec<String> = info.points_to.iter().map(|o| o.to_string()).collect();
            write!(out, "  {} = {{{}}}", pointer, objects.join(", ")).unwrap();
            if info.local {
                write!(out, " local").unwrap();
            }
            if info.is_volatile {
                write!(out, " volatile").unwrap();
            }
            writeln!(out).unwrap();
        }
        out
    }
}
