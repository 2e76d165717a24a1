//! Intermediate Representation (IR) and the optimizer built on it
//!
//! The IR is a graph-based SSA form: instructions live in a per-function
//! arena addressed by [`IrId`], blocks by [`IrBlockId`]. On top of it sit
//! the analyses (dominators, loops, countable loops, alias, bounds ranges)
//! and the transformation passes that consume them:
//!
//! - [`checks_elimination`]: removes or converts null/bounds/zero/negative,
//!   overflow and type checks
//! - [`licm`], [`loop_unroll`], [`redundant_loop`]: loop transformations
//!   driven by the countable-loop parser

pub mod types;
pub mod instructions;
pub mod blocks;
pub mod functions;
pub mod modules;
pub mod builder;
pub mod validation;
pub mod dump;
pub mod optimization;

pub mod loop_analysis;
pub mod countable_loop;
pub mod value_numbering;
pub mod alias_analysis;
pub mod bounds_analysis;
pub mod object_type;

pub mod checks_elimination;
pub mod licm;
pub mod loop_unroll;
pub mod redundant_loop;

pub use types::*;
pub use instructions::*;
pub use blocks::*;
pub use functions::*;
pub use modules::*;
pub use builder::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// IR version for compatibility checking
pub const IR_VERSION: u32 = 1;

/// Unique identifier for instructions (arena index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrId(u32);

impl IrId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn invalid() -> Self {
        Self(u32::MAX)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for IrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}
