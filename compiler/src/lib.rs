//! Optimizer core of a method JIT: an SSA graph IR, the analyses that
//! reason about it (dominators, loops, countable loops, alias, bounds
//! ranges) and the check-elimination and loop passes built on them.

pub mod config;
pub mod error;
pub mod ir;
pub mod logging;

pub use config::OptimizerConfig;
pub use error::{IrError, IrResult};
