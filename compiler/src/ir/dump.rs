//! IR Dump Utility
//!
//! Pretty-prints functions in a stable, human-readable form. The output is
//! deterministic (blocks by id, instructions in block order), which lets
//! tests compare dumps before and after a pass.

use super::instructions::{InstFlags, IrInstruction};
use super::{IrBasicBlock, IrFunction, IrModule, IrTerminator, DataType};
use std::fmt::Write;

/// Dump an entire module to a string.
pub fn dump_module(module: &IrModule) -> String {
    let mut out = String::new();
    writeln!(out, "; Module: {}", module.name).unwrap();
    writeln!(out, "; Functions: {}", module.functions.len()).unwrap();
    writeln!(out).unwrap();

    for func in &module.functions {
        writeln!(out, "{}", dump_function(func)).unwrap();
    }

    out
}

/// Dump a single function to a string.
pub fn dump_function(func: &IrFunction) -> String {
    let mut out = String::new();
    let osr = if func.is_osr { " osr" } else { "" };
    writeln!(out, "fn @{}{} {{", func.name, osr).unwrap();
    for block in func.cfg.blocks.values() {
        out.push_str(&dump_block(func, block));
    }
    writeln!(out, "}}").unwrap();
    out
}

/// Dump one block: header line, phis, body, terminator.
pub fn dump_block(func: &IrFunction, block: &IrBasicBlock) -> String {
    let mut out = String::new();
    write!(out, "{}:", block.id).unwrap();
    if let Some(label) = &block.label {
        write!(out, " ; {}", label).unwrap();
    }
    if !block.predecessors.is_empty() {
        let preds: Vec<String> = block.predecessors.iter().map(|p| p.to_string()).collect();
        write!(out, " preds: {}", preds.join(", ")).unwrap();
    }
    if block.metadata.in_exception_handler {
        write!(out, " [try]").unwrap();
    }
    if block.metadata.osr_entry {
        write!(out, " [osr]").unwrap();
    }
    writeln!(out).unwrap();

    for &id in block.phis.iter().chain(block.instructions.iter()) {
        writeln!(out, "    {}", dump_instruction(func.inst(id))).unwrap();
    }
    writeln!(out, "    {}", dump_terminator(&block.terminator)).unwrap();
    out
}

pub fn dump_instruction(inst: &IrInstruction) -> String {
    let inputs: Vec<String> = inst.inputs.iter().map(|i| i.to_string()).collect();
    let mut line = if inst.ty == DataType::Void {
        format!("{}", inst.opcode)
    } else {
        format!("{} = {}.{}", inst.id, inst.opcode, inst.ty)
    };
    if !inputs.is_empty() {
        write!(line, " {}", inputs.join(", ")).unwrap();
    }
    if inst.ty == DataType::Void {
        write!(line, " ; {}", inst.id).unwrap();
    }
    let flags = dump_flags(inst.flags);
    if !flags.is_empty() {
        write!(line, " [{}]", flags).unwrap();
    }
    line
}

fn dump_flags(flags: InstFlags) -> String {
    let mut names = Vec::new();
    if flags.contains(InstFlags::NO_HOIST) {
        names.push("no_hoist");
    }
    if flags.contains(InstFlags::CAN_DEOPTIMIZE) {
        names.push("can_deopt");
    }
    if flags.contains(InstFlags::OMIT_NULL_CHECK) {
        names.push("omit_null_check");
    }
    if flags.contains(InstFlags::VOLATILE) {
        names.push("volatile");
    }
    names.join(", ")
}

pub fn dump_terminator(term: &IrTerminator) -> String {
    match term {
        IrTerminator::Goto { target } => format!("goto {}", target),
        IrTerminator::IfImm {
            cond,
            cc,
            imm,
            true_target,
            false_target,
        } => format!("if_imm {} {} {} -> {}, {}", cond, cc, imm, true_target, false_target),
        IrTerminator::Return { value: Some(v) } => format!("return {}", v),
        IrTerminator::Return { value: None } => "return".to_string(),
        IrTerminator::Deoptimize { kind, save_state } => match save_state {
            Some(ss) => format!("deoptimize {} {}", kind, ss),
            None => format!("deoptimize {}", kind),
        },
        IrTerminator::Unreachable => "unreachable".to_string(),
    }
}
