//! Error types for the fallible edges of the optimizer: loading IR and
//! configuration, and verifying a graph after a pass.
//!
//! Analyses and passes themselves never fail; an undecidable question
//! yields a conservative answer instead of an error.

use crate::ir::{IrBlockId, IrId};
use thiserror::Error;

/// Errors raised while loading or verifying IR.
#[derive(Debug, Error)]
pub enum IrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed IR JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("function `{function}` failed verification: {kind}")]
    Validation {
        function: String,
        kind: ValidationErrorKind,
    },

    #[error("unknown pass `{0}`")]
    UnknownPass(String),

    #[error("no function named `{0}` in module")]
    UnknownFunction(String),
}

/// A single structural violation found by the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationErrorKind {
    #[error("block {block} has no terminator")]
    Unterminated { block: IrBlockId },

    #[error("block {block} branches to missing block {target}")]
    MissingSuccessor { block: IrBlockId, target: IrBlockId },

    #[error("predecessor list of {block} disagrees with the edge from {pred}")]
    PredecessorMismatch { block: IrBlockId, pred: IrBlockId },

    #[error("phi {phi} has {inputs} operands but its block has {preds} predecessors")]
    PhiArity { phi: IrId, inputs: usize, preds: usize },

    #[error("{user} reads retired instruction {input}")]
    RetiredInput { user: IrId, input: IrId },

    #[error("{input} does not dominate its use in {user}")]
    UseNotDominated { user: IrId, input: IrId },

    #[error("terminator of {block} reads {input} which does not dominate it")]
    TerminatorUseNotDominated { block: IrBlockId, input: IrId },

    #[error("{inst} is listed in {block} but records a different block")]
    BlockMismatch { inst: IrId, block: IrBlockId },
}

pub type IrResult<T> = Result<T, IrError>;
