//! The module/function well-formedness checker — the "host IR toolkit" verifier that
//! `codedefender-core`'s C1 (IR Verifier Shim) wraps. Spec invariants 1-4 (module verifies,
//! one terminator per block, SSA dominance, PHI predecessor-set consistency) are checked here;
//! invariant 5 (exception-pad blocks untouched) is enforced by the passes themselves, since it's
//! a transformation-authoring constraint rather than a structural one this checker can observe
//! after the fact.

use std::collections::HashSet;

use thiserror::Error;

use crate::block::Terminator;
use crate::function::Function;
use crate::module::Module;
use crate::value::{BlockId, InstId, Value};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct VerifyError {
    pub message: String,
}

impl VerifyError {
    fn new(message: impl Into<String>) -> Self {
        VerifyError {
            message: message.into(),
        }
    }
}

pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    let mut names: HashSet<&str> = HashSet::new();
    for f in &module.functions {
        if !names.insert(f.name.as_str()) {
            return Err(VerifyError::new(format!(
                "duplicate function name `{}`",
                f.name
            )));
        }
        if !f.is_declaration {
            verify_function(f)?;
        }
    }
    let mut gnames: HashSet<&str> = HashSet::new();
    for g in &module.globals {
        if !gnames.insert(g.name.as_str()) {
            return Err(VerifyError::new(format!(
                "duplicate global name `{}`",
                g.name
            )));
        }
    }
    for (ctor_name, _) in &module.global_ctors {
        if module.func_id_by_name(ctor_name).is_none() {
            return Err(VerifyError::new(format!(
                "global constructor references unknown function `{}`",
                ctor_name
            )));
        }
    }
    Ok(())
}

pub fn verify_function(f: &Function) -> Result<(), VerifyError> {
    if f.blocks.is_empty() {
        return Err(VerifyError::new(format!(
            "function `{}` has no basic blocks",
            f.name
        )));
    }

    let block_ids: HashSet<BlockId> = f.blocks.iter().map(|b| b.id).collect();
    for block in &f.blocks {
        for succ in block.terminator.successors() {
            if !block_ids.contains(&succ) {
                return Err(VerifyError::new(format!(
                    "function `{}` block `{}` branches to unknown block",
                    f.name, block.name
                )));
            }
        }
    }

    // PHI predecessor-set consistency (invariant 4). Requires preds to be current; callers
    // must have called `recompute_preds` after the last CFG edit.
    let mut with_preds = f.clone();
    with_preds.recompute_preds();
    for block in &with_preds.blocks {
        let actual_preds: HashSet<BlockId> = block.preds.iter().copied().collect();
        for inst_id in &block.insts {
            let inst = with_preds.inst(*inst_id);
            if let crate::inst::InstKind::Phi { incomings } = &inst.kind {
                let phi_preds: HashSet<BlockId> = incomings.iter().map(|(b, _)| *b).collect();
                if phi_preds != actual_preds {
                    return Err(VerifyError::new(format!(
                        "function `{}` block `{}`: phi `{}` incoming set does not match predecessor set",
                        f.name, block.name, inst.name
                    )));
                }
            }
        }
    }

    // SSA dominance (invariant 3): every non-phi use of an instruction-defined value must be
    // dominated by its definition.
    let dom = with_preds.dominators();
    let def_block: std::collections::HashMap<InstId, BlockId> = with_preds
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter().map(move |id| (*id, b.id)))
        .collect();
    let order_in_block: std::collections::HashMap<InstId, usize> = with_preds
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter().enumerate().map(|(i, id)| (*id, i)))
        .collect();

    for block in &with_preds.blocks {
        for (pos, inst_id) in block.insts.iter().enumerate() {
            let inst = with_preds.inst(*inst_id);
            if inst.is_phi() {
                continue;
            }
            for operand in inst.operands() {
                if let Value::Inst(def_id) = operand {
                    let def_blk = match def_block.get(def_id) {
                        Some(b) => *b,
                        None => {
                            return Err(VerifyError::new(format!(
                                "function `{}`: use of instruction not defined in this function",
                                f.name
                            )));
                        }
                    };
                    if def_blk == block.id {
                        if order_in_block[def_id] >= pos {
                            return Err(VerifyError::new(format!(
                                "function `{}` block `{}`: use of `{}` does not follow its definition",
                                f.name, block.name, inst.name
                            )));
                        }
                    } else if !with_preds.dominates(def_blk, block.id, &dom) {
                        return Err(VerifyError::new(format!(
                            "function `{}` block `{}`: operand of `{}` is not dominated by its definition",
                            f.name, block.name, inst.name
                        )));
                    }
                }
            }
        }
        if let Terminator::CondBr { cond, .. } = &block.terminator {
            check_terminator_operand_dominance(&with_preds, block.id, cond, &dom, &def_block, f)?;
        }
        if let Terminator::Switch { value, .. } = &block.terminator {
            check_terminator_operand_dominance(&with_preds, block.id, value, &dom, &def_block, f)?;
        }
        if let Terminator::Ret {
            value: Some(value), ..
        } = &block.terminator
        {
            check_terminator_operand_dominance(&with_preds, block.id, value, &dom, &def_block, f)?;
        }
    }

    Ok(())
}

fn check_terminator_operand_dominance(
    func: &Function,
    block_id: BlockId,
    value: &Value,
    dom: &std::collections::HashMap<BlockId, HashSet<BlockId>>,
    def_block: &std::collections::HashMap<InstId, BlockId>,
    f: &Function,
) -> Result<(), VerifyError> {
    if let Value::Inst(def_id) = value {
        let def_blk = *def_block.get(def_id).ok_or_else(|| {
            VerifyError::new(format!(
                "function `{}`: terminator uses instruction not defined in this function",
                f.name
            ))
        })?;
        if def_blk != block_id && !func.dominates(def_blk, block_id, dom) {
            return Err(VerifyError::new(format!(
                "function `{}` block `{}`: terminator operand not dominated by its definition",
                f.name,
                func.block(block_id).name
            )));
        }
    }
    Ok(())
}
