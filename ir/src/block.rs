//! Basic blocks and terminators.

use serde::{Deserialize, Serialize};

use crate::value::{BlockId, InstId, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Value,
        if_true: BlockId,
        if_false: BlockId,
    },
    /// `cases` maps a constant value to a destination; unmatched values go to `default`.
    Switch {
        value: Value,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Ret {
        value: Option<Value>,
    },
    Unreachable,
    /// Marks a block as an exception-handling pad entry (landing pad). Such blocks, and any
    /// terminator that can unwind into one, are immune to splitting/flattening/reordering
    /// (spec invariant 5).
    LandingPad {
        /// Where control resumes after handling.
        resume: BlockId,
    },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br { target } => vec![*target],
            Terminator::CondBr {
                if_true, if_false, ..
            } => vec![*if_true, *if_false],
            Terminator::Switch { default, cases, .. } => {
                let mut succs = vec![*default];
                succs.extend(cases.iter().map(|(_, b)| *b));
                succs
            }
            Terminator::Ret { .. } | Terminator::Unreachable => vec![],
            Terminator::LandingPad { resume } => vec![*resume],
        }
    }

    pub fn successors_mut(&mut self) -> Vec<&mut BlockId> {
        match self {
            Terminator::Br { target } => vec![target],
            Terminator::CondBr {
                if_true, if_false, ..
            } => vec![if_true, if_false],
            Terminator::Switch { default, cases, .. } => {
                let mut succs = vec![default];
                succs.extend(cases.iter_mut().map(|(_, b)| b));
                succs
            }
            Terminator::Ret { .. } | Terminator::Unreachable => vec![],
            Terminator::LandingPad { resume } => vec![resume],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub name: String,
    /// Instructions in program order, referenced by id into the owning function's arena.
    /// PHIs, if present, always occupy a contiguous prefix.
    pub insts: Vec<InstId>,
    pub terminator: Terminator,
    /// Recomputed by `Function::recompute_preds` after any CFG edit; never hand-maintained by
    /// a pass mid-edit.
    pub preds: Vec<BlockId>,
    pub is_landing_pad: bool,
}

impl BasicBlock {
    pub fn new(id: BlockId, name: impl Into<String>) -> Self {
        BasicBlock {
            id,
            name: name.into(),
            insts: Vec::new(),
            terminator: Terminator::Unreachable,
            preds: Vec::new(),
            is_landing_pad: false,
        }
    }

    pub fn has_exception_machinery(&self) -> bool {
        self.is_landing_pad || matches!(self.terminator, Terminator::LandingPad { .. })
    }
}
