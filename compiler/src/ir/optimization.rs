//! Optimization Passes
//!
//! Pass trait, per-pass results, the analysis-invalidation contract and the
//! pass manager. Passes run one function at a time and to completion; the
//! manager may run different functions of a module in parallel.

use super::instructions::Opcode;
use super::{IrFunction, IrId, IrModule};
use crate::config::OptimizerConfig;
use crate::error::{IrError, IrResult};
use bitflags::bitflags;
use log::debug;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

bitflags! {
    /// Analyses a pass may leave stale after modifying a function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AnalysisSet: u8 {
        const DOMINATORS = 1 << 0;
        const LOOPS = 1 << 1;
        const ALIAS = 1 << 2;
        const BOUNDS = 1 << 3;
    }
}

/// Optimization pass trait
pub trait OptimizationPass: Send + Sync {
    /// Get the name of this pass
    fn name(&self) -> &'static str;

    /// Run the pass on a function
    fn run_on_function(&self, function: &mut IrFunction) -> OptimizationResult;

    /// Analyses invalidated when the pass reports a modification
    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::all()
    }
}

/// One applied optimization, as reported to the event writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptimizationEvent {
    /// Pass that applied it
    pub pass: &'static str,
    /// What was done, e.g. `"BoundsCheck removed"`
    pub name: String,
    pub inst: IrId,
    /// Bytecode offset of the instruction
    pub pc: u32,
}

/// Callback receiving every optimization event.
pub type EventWriter = Box<dyn Fn(&OptimizationEvent) + Send + Sync>;

/// Result of an optimization pass
#[derive(Debug, Clone, Default)]
pub struct OptimizationResult {
    /// Whether the IR was modified
    pub modified: bool,

    /// Number of instructions eliminated
    pub instructions_eliminated: usize,

    /// Number of blocks eliminated
    pub blocks_eliminated: usize,

    /// Other statistics
    pub stats: HashMap<String, usize>,

    /// Applied optimizations, in order
    pub events: Vec<OptimizationEvent>,

    /// Analyses the caller must rebuild before trusting them again
    pub invalidated: AnalysisSet,
}

impl OptimizationResult {
    /// Create a result indicating no changes
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Create a result indicating changes
    pub fn changed() -> Self {
        Self {
            modified: true,
            ..Self::default()
        }
    }

    /// Bump a named counter.
    pub fn count(&mut self, key: &str) {
        *self.stats.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Record an applied optimization on `inst`.
    pub fn event(&mut self, pass: &'static str, name: impl Into<String>, inst: IrId, pc: u32) {
        self.modified = true;
        self.events.push(OptimizationEvent {
            pass,
            name: name.into(),
            inst,
            pc,
        });
    }

    /// Combine results
    pub fn combine(mut self, other: OptimizationResult) -> Self {
        self.modified |= other.modified;
        self.instructions_eliminated += other.instructions_eliminated;
        self.blocks_eliminated += other.blocks_eliminated;

        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }
        self.events.extend(other.events);
        self.invalidated |= other.invalidated;

        self
    }
}

/// Build a pass by its pipeline name.
pub fn create_pass(name: &str, config: &OptimizerConfig) -> IrResult<Box<dyn OptimizationPass>> {
    use super::checks_elimination::ChecksElimination;
    use super::licm::Licm;
    use super::loop_unroll::LoopUnroll;
    use super::redundant_loop::RedundantLoopElimination;

    let pass: Box<dyn OptimizationPass> = match name {
        "checks-elimination" => Box::new(ChecksElimination::new(config.checks_elimination.clone())),
        "licm" => Box::new(Licm::new(config.licm.clone())),
        "loop-unroll" => Box::new(LoopUnroll::new(config.unroll.clone())),
        "redundant-loop-elimination" => Box::new(RedundantLoopElimination::new()),
        "dce" => Box::new(DeadCodeEliminationPass::new()),
        other => return Err(IrError::UnknownPass(other.to_string())),
    };
    Ok(pass)
}

/// Optimization pass manager
pub struct PassManager {
    passes: Vec<Box<dyn OptimizationPass>>,
    event_writer: Option<EventWriter>,
    verify: bool,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Create a new pass manager
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            event_writer: None,
            verify: false,
        }
    }

    /// Build the pipeline a configuration names.
    pub fn from_config(config: &OptimizerConfig) -> IrResult<Self> {
        let mut manager = Self::new();
        for name in &config.passes {
            manager.passes.push(create_pass(name, config)?);
        }
        manager.verify = config.verify;
        Ok(manager)
    }

    /// Add a pass to the manager
    pub fn add_pass<P: OptimizationPass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn set_event_writer(&mut self, writer: EventWriter) {
        self.event_writer = Some(writer);
    }

    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass, in order, over one function.
    pub fn run_function(&self, function: &mut IrFunction) -> IrResult<OptimizationResult> {
        let mut total = OptimizationResult::unchanged();
        for pass in &self.passes {
            let mut result = pass.run_on_function(function);
            if result.modified {
                result.invalidated |= pass.invalidates();
                debug!(
                    "{}: {} modified {} ({} events)",
                    function.name,
                    pass.name(),
                    result.instructions_eliminated,
                    result.events.len()
                );
                if self.verify {
                    super::validation::verify_function(function)?;
                }
            }
            for event in &result.events {
                debug!("{} {} {} pc={}", event.pass, event.name, event.inst, event.pc);
                if let Some(writer) = &self.event_writer {
                    writer(event);
                }
            }
            total = total.combine(result);
        }
        Ok(total)
    }

    /// Run the pipeline over every function of the module. Functions are
    /// independent, so they are optimized in parallel.
    pub fn run_module(&self, module: &mut IrModule) -> IrResult<OptimizationResult> {
        let results: Vec<IrResult<OptimizationResult>> = module
            .functions
            .par_iter_mut()
            .map(|function| self.run_function(function))
            .collect();

        let mut total = OptimizationResult::unchanged();
        for result in results {
            total = total.combine(result?);
        }
        Ok(total)
    }
}

/// Dead code elimination pass
///
/// Removes instructions whose values nobody reads and that have no effect
/// of their own. Liveness is propagated from effects and terminators, so
/// dead phi cycles go too.
pub struct DeadCodeEliminationPass;

impl Default for DeadCodeEliminationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadCodeEliminationPass {
    pub fn new() -> Self {
        Self
    }

    fn is_root(opcode: Opcode) -> bool {
        match opcode {
            Opcode::Parameter(_) | Opcode::SaveStateDeoptimize => true,
            Opcode::SaveState => false,
            other => other.has_side_effects(),
        }
    }

    fn find_live(function: &IrFunction) -> HashSet<IrId> {
        let mut live = HashSet::new();
        let mut worklist = Vec::new();

        for block in function.cfg.blocks.values() {
            for &id in block.phis.iter().chain(block.instructions.iter()) {
                if Self::is_root(function.opcode(id)) {
                    worklist.push(id);
                }
            }
            worklist.extend(block.terminator.uses());
        }

        while let Some(id) = worklist.pop() {
            if !live.insert(id) {
                continue;
            }
            worklist.extend(function.inst(id).inputs.iter().copied());
        }
        live
    }
}

impl OptimizationPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run_on_function(&self, function: &mut IrFunction) -> OptimizationResult {
        let live = Self::find_live(function);
        let dead: Vec<IrId> = function
            .live_insts()
            .map(|inst| inst.id)
            .filter(|id| !live.contains(id))
            .collect();

        let mut result = OptimizationResult::unchanged();
        for &id in &dead {
            function.remove_inst(id);
        }
        if !dead.is_empty() {
            result.modified = true;
            result.instructions_eliminated = dead.len();
        }
        result
    }

    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::ALIAS | AnalysisSet::BOUNDS
    }
}
