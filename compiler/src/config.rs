//! Optimizer configuration
//!
//! Loaded from TOML; every section and field is optional and falls back to
//! its default:
//!
//! ```toml
//! passes = ["checks-elimination", "licm", "dce"]
//! verify = true
//!
//! [checks_elimination]
//! dominance = "tree"
//! min_group_size = 2
//!
//! [unroll]
//! max_trip_count = 8
//! ```

use crate::error::IrResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pipeline used when the configuration names none.
pub const DEFAULT_PASSES: &[&str] = &[
    "checks-elimination",
    "licm",
    "redundant-loop-elimination",
    "loop-unroll",
    "dce",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Pass names, run in order
    pub passes: Vec<String>,

    /// Verify each function after every modifying pass
    pub verify: bool,

    pub checks_elimination: ChecksEliminationConfig,
    pub licm: LicmConfig,
    pub unroll: UnrollConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            passes: DEFAULT_PASSES.iter().map(|p| p.to_string()).collect(),
            verify: false,
            checks_elimination: ChecksEliminationConfig::default(),
            licm: LicmConfig::default(),
            unroll: UnrollConfig::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn from_toml_str(text: &str) -> IrResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> IrResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Which dominance a dominated-check search accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DominanceMode {
    /// Only an earlier identical check in the same block
    Block,
    /// Any identical check that dominates through the dominator tree
    Tree,
}

impl std::str::FromStr for DominanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(DominanceMode::Block),
            "tree" => Ok(DominanceMode::Tree),
            other => Err(format!("unknown dominance mode `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksEliminationConfig {
    pub dominance: DominanceMode,
    /// Move loop-invariant checks into the preheader
    pub hoist_checks: bool,
    /// Replace grouped bounds checks with guards before the loop
    pub loop_deoptimization: bool,
    /// Replace grouped bounds checks with guards inside the loop
    pub grouped_deoptimization: bool,
    /// Smallest group worth an in-loop guard pair
    pub min_group_size: usize,
    /// Turn checks that always fail into unconditional deoptimization
    pub must_throw_deoptimization: bool,
}

impl Default for ChecksEliminationConfig {
    fn default() -> Self {
        Self {
            dominance: DominanceMode::Tree,
            hoist_checks: true,
            loop_deoptimization: true,
            grouped_deoptimization: true,
            min_group_size: 2,
            must_throw_deoptimization: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicmConfig {
    /// Hoist loads that no store in the loop may alias
    pub hoist_loads: bool,
}

impl Default for LicmConfig {
    fn default() -> Self {
        Self { hoist_loads: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnrollConfig {
    pub max_trip_count: u64,
    /// Cap on body size times trip count
    pub max_instructions: usize,
}

impl Default for UnrollConfig {
    fn default() -> Self {
        Self {
            max_trip_count: 8,
            max_instructions: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OptimizerConfig::from_toml_str(
            r#"
            passes = ["checks-elimination"]

            [checks_elimination]
            dominance = "block"
            hoist_checks = false
            "#,
        )
        .unwrap();

        assert_eq!(config.passes, vec!["checks-elimination".to_string()]);
        assert_eq!(config.checks_elimination.dominance, DominanceMode::Block);
        assert!(!config.checks_elimination.hoist_checks);
        assert_eq!(config.checks_elimination.min_group_size, 2);
        assert_eq!(config.unroll, UnrollConfig::default());
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(OptimizerConfig::from_toml_str("").unwrap(), OptimizerConfig::default());
    }

    #[test]
    fn test_bad_toml_is_a_config_error() {
        let err = OptimizerConfig::from_toml_str("passes = 3").unwrap_err();
        assert!(matches!(err, crate::error::IrError::Config(_)));
    }
}
