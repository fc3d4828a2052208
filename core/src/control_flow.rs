//! C6 — Control-Flow Obfuscator (spec §4.6). Splits blocks and inserts opaque-predicate-guarded
//! branches to synthetic dead blocks, or ANDs an existing conditional branch's condition with a
//! true-opaque predicate.

use codedefender_config::Criticality;
use codedefender_ir::block::Terminator;
use codedefender_ir::builder::Builder;
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BinOp, Value};
use codedefender_ir::{Function, InstKind};

use crate::model::Counters;
use crate::opaque::{self, Polarity};
use crate::rng::Prng;

const MIN_CANDIDATE_LEN: usize = 3;
const BASE_CAP: usize = 4;

fn is_candidate(f: &Function, block_idx: usize) -> bool {
    let block = &f.blocks[block_idx];
    if block.id == f.entry() {
        return false;
    }
    if opaque::is_generated_name(&block.name) {
        return false;
    }
    block.insts.len() >= MIN_CANDIDATE_LEN
}

/// Emits a typed, side-effect-free filler sequence into the given block's builder position:
/// a handful of stack-store instructions over an opaque value, never read back. Used both by
/// the control-flow obfuscator's dead blocks and (indirectly, in spirit) by the bogus injector.
fn emit_filler(builder: &mut Builder<'_>, rng: &mut Prng, tag: u32) {
    for i in 0..3 {
        let slot = builder.emit(
            InstKind::Alloca { ty: Type::I32 },
            Type::Ptr,
            format!("obf_fill_slot_{tag}_{i}"),
        );
        let v = rng.next_i64() & 0xFFFF;
        builder.emit_void(InstKind::Store {
            ptr: slot,
            value: Value::Const(Constant::Int(Type::I32, v)),
        });
    }
}

/// Every block that used to be reached through `old_pred` is now reached through `new_pred`
/// instead; rewrite any PHI incoming-edge keyed on the old predecessor so invariant 4 still
/// holds once `recompute_preds` runs.
fn rename_phi_predecessor(
    f: &mut Function,
    succ: codedefender_ir::value::BlockId,
    old_pred: codedefender_ir::value::BlockId,
    new_pred: codedefender_ir::value::BlockId,
) {
    let inst_ids = f.block(succ).insts.clone();
    for id in inst_ids {
        if let InstKind::Phi { incomings } = &mut f.inst_mut(id).kind {
            for (b, _) in incomings.iter_mut() {
                if *b == old_pred {
                    *b = new_pred;
                }
            }
        }
    }
}

fn and_with_opaque(f: &mut Function, rng: &mut Prng, block_idx: usize, tag: u32) {
    let block_id = f.blocks[block_idx].id;
    let cond = match &f.blocks[block_idx].terminator {
        Terminator::CondBr { cond, .. } => cond.clone(),
        _ => return,
    };
    let mut builder = Builder::at_end(f, block_id);
    let predicate = opaque::emit(&mut builder, rng, Polarity::True, tag);
    let anded = builder.emit(
        InstKind::Binary {
            op: BinOp::And,
            lhs: cond,
            rhs: predicate,
        },
        Type::I1,
        format!("obf_guard_{tag}"),
    );
    if let Terminator::CondBr { cond, .. } = &mut f.block_mut(block_id).terminator {
        *cond = anded;
    }
}

/// Splits `block_idx` at its median non-PHI, non-alloca instruction, creating a continuation
/// block holding the tail and the original terminator, a dead sibling holding typed filler, and
/// a new conditional branch (guarded by a true-opaque predicate) from the head to
/// `continuation`/`dead`.
fn split_with_dead_sibling(f: &mut Function, rng: &mut Prng, block_idx: usize, tag: u32) {
    let block_id = f.blocks[block_idx].id;
    let original_insts = f.blocks[block_idx].insts.clone();
    let original_terminator = f.blocks[block_idx].terminator.clone();

    let splittable: Vec<usize> = original_insts
        .iter()
        .enumerate()
        .filter(|(_, id)| {
            let inst = f.inst(**id);
            !inst.is_phi() && !inst.is_alloca()
        })
        .map(|(i, _)| i)
        .collect();
    if splittable.is_empty() {
        return;
    }
    let median = splittable[splittable.len() / 2];

    let head: Vec<_> = original_insts[..median].to_vec();
    let tail: Vec<_> = original_insts[median..].to_vec();

    let continuation = f.push_block(format!("obf_cont_{tag}"));
    f.block_mut(continuation).insts = tail;
    for succ in original_terminator.successors() {
        rename_phi_predecessor(f, succ, block_id, continuation);
    }
    f.block_mut(continuation).terminator = original_terminator;

    let dead = f.push_block(format!("obf_dead_{tag}"));
    {
        let mut builder = Builder::at_start(f, dead);
        emit_filler(&mut builder, rng, tag);
    }
    f.block_mut(dead).terminator = Terminator::Br {
        target: continuation,
    };

    f.block_mut(block_id).insts = head;
    let mut builder = Builder::at_end(f, block_id);
    let predicate = opaque::emit(&mut builder, rng, Polarity::True, tag);
    f.block_mut(block_id).terminator = Terminator::CondBr {
        cond: predicate,
        if_true: continuation,
        if_false: dead,
    };
}

/// Runs the control-flow obfuscator over `f`, returning the number of sites transformed.
/// `cap` candidates are visited at most (doubled by the caller for Critical functions, per
/// spec §4.6).
pub fn run(f: &mut Function, rng: &mut Prng, criticality: Criticality, counters: &mut Counters) -> usize {
    let cap = if criticality == Criticality::Critical {
        BASE_CAP * 2
    } else {
        BASE_CAP
    };

    let candidate_indices: Vec<usize> = (0..f.blocks.len()).filter(|&i| is_candidate(f, i)).collect();

    let mut applied = 0;
    for idx in candidate_indices.into_iter().take(cap) {
        let tag = f.fresh_id();
        let is_cond_br = matches!(f.blocks[idx].terminator, Terminator::CondBr { .. });
        if is_cond_br {
            and_with_opaque(f, rng, idx, tag);
        } else {
            split_with_dead_sibling(f, rng, idx, tag);
        }
        applied += 1;
        counters.control_flow_obfuscations += 1;
    }

    if applied > 0 {
        f.recompute_preds();
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::types::Type;

    fn big_block_fn() -> Function {
        let mut f = Function::new("f", Type::I32, vec![]);
        let entry = f.push_block("entry");
        let body = f.push_block("body");
        f.block_mut(entry).terminator = Terminator::Br { target: body };

        let mut builder = Builder::at_start(&mut f, body);
        let a = builder.emit(
            InstKind::Alloca { ty: Type::I32 },
            Type::Ptr,
            "a",
        );
        let v1 = builder.emit(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Const(Constant::Int(Type::I32, 1)),
                rhs: Value::Const(Constant::Int(Type::I32, 2)),
            },
            Type::I32,
            "v1",
        );
        builder.emit_void(InstKind::Store {
            ptr: a.clone(),
            value: v1.clone(),
        });
        let v2 = builder.emit(
            InstKind::Load {
                ptr: a,
                ty: Type::I32,
            },
            Type::I32,
            "v2",
        );
        f.block_mut(body).terminator = Terminator::Ret { value: Some(v2) };
        f.recompute_preds();
        f
    }

    #[test]
    fn split_creates_continuation_and_dead_blocks() {
        let mut f = big_block_fn();
        let mut rng = Prng::from_seed_components(1, 2);
        let mut counters = Counters::default();
        let applied = run(&mut f, &mut rng, Criticality::Standard, &mut counters);
        assert_eq!(applied, 1);
        assert!(f.blocks.iter().any(|b| b.name.starts_with("obf_cont_")));
        assert!(f.blocks.iter().any(|b| b.name.starts_with("obf_dead_")));
        assert_eq!(counters.control_flow_obfuscations, 1);
    }

    #[test]
    fn verifies_after_transform() {
        let mut f = big_block_fn();
        let mut rng = Prng::from_seed_components(5, 9);
        let mut counters = Counters::default();
        run(&mut f, &mut rng, Criticality::Standard, &mut counters);
        assert!(codedefender_ir::verify_function(&f).is_ok());
    }
}
