//! IR Modules
//!
//! A module is the unit the optimizer loads and stores: a named, ordered set
//! of functions. Modules round-trip through JSON so graphs can be captured
//! from one run and replayed through the CLI.

use super::IrFunction;
use crate::error::{IrError, IrResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A compilation unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrModule {
    /// Module name
    pub name: String,

    /// IR format version the module was written with
    #[serde(default = "default_version")]
    pub version: u32,

    /// Functions, in declaration order
    pub functions: Vec<IrFunction>,
}

fn default_version() -> u32 {
    super::IR_VERSION
}

impl IrModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: super::IR_VERSION,
            functions: Vec::new(),
        }
    }

    pub fn add_function(&mut self, function: IrFunction) {
        self.functions.push(function);
    }

    pub fn get_function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn get_function_mut(&mut self, name: &str) -> Option<&mut IrFunction> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    /// Look up a function, failing with [`IrError::UnknownFunction`].
    pub fn function(&self, name: &str) -> IrResult<&IrFunction> {
        self.get_function(name)
            .ok_or_else(|| IrError::UnknownFunction(name.to_string()))
    }

    pub fn from_json(text: &str) -> IrResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> IrResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> IrResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> IrResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::{ConditionCode, DataType, Opcode};

    #[test]
    fn test_json_round_trip_keeps_graph() {
        let mut b = IrBuilder::new("count");
        let zero = b.constant(0);
        let n = b.parameter(0, DataType::Int64);
        let lp = b.begin_counted_loop(zero, n, ConditionCode::Lt, 1);
        b.end_counted_loop(&lp);
        b.ret(None);

        let mut module = IrModule::new("m");
        module.add_function(b.finish());
        let text = module.to_json().unwrap();
        let loaded = IrModule::from_json(&text).unwrap();

        let func = loaded.function("count").unwrap();
        assert_eq!(func.opcode(lp.index), Opcode::Phi);
        assert_eq!(func.block(lp.header).predecessors.len(), 2);
        assert!(loaded.function("missing").is_err());
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(matches!(IrModule::from_json("{"), Err(IrError::Json(_))));
    }
}
