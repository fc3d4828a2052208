//! C7 — Bogus-Code & Fake-Loop Injector (spec §4.7).

use codedefender_ir::block::Terminator;
use codedefender_ir::builder::Builder;
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BlockId, Value};
use codedefender_ir::{Function, InstKind};

use crate::model::Counters;
use crate::opaque::{self, Polarity};
use crate::rng::Prng;

const MIN_BLOCK_LEN: usize = 2;

/// Inserts `(blockLen * bogusPercent / 200)` opaque-predicate-backed stack stores into each
/// non-trivial block, right after its PHI prefix.
pub fn inject_bogus_code(f: &mut Function, rng: &mut Prng, bogus_percent: u32, counters: &mut Counters) {
    let block_ids: Vec<BlockId> = f.blocks.iter().map(|b| b.id).collect();
    for block_id in block_ids {
        if opaque::is_generated_name(&f.block(block_id).name) {
            continue;
        }
        let block_len = f.block(block_id).insts.len();
        if block_len < MIN_BLOCK_LEN {
            continue;
        }
        let count = block_len * bogus_percent as usize / 200;
        for _ in 0..count {
            let tag = f.fresh_id();
            let mut builder = Builder::after_phis(f, block_id);
            let predicate = opaque::emit(&mut builder, rng, Polarity::True, tag);
            let slot = builder.emit(
                InstKind::Alloca { ty: Type::I32 },
                Type::Ptr,
                format!("obf_bogus_slot_{tag}"),
            );
            let noise = rng.next_i64() & 0xFFFF;
            let picked = builder.emit(
                InstKind::Select {
                    cond: predicate,
                    if_true: Value::Const(Constant::Int(Type::I32, noise)),
                    if_false: Value::Const(Constant::Int(Type::I32, !noise)),
                },
                Type::I32,
                format!("obf_bogus_val_{tag}"),
            );
            builder.emit_void(InstKind::Store {
                ptr: slot,
                value: picked,
            });
            counters.bogus_instructions += 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GuardPattern {
    CounterNegative,
    CounterAtMax,
    NotOfAlwaysTrue,
}

const GUARD_PATTERNS: [GuardPattern; 3] = [
    GuardPattern::CounterNegative,
    GuardPattern::CounterAtMax,
    GuardPattern::NotOfAlwaysTrue,
];

fn always_false_cond(builder: &mut Builder<'_>, rng: &mut Prng, pattern: GuardPattern, tag: u32) -> Value {
    match pattern {
        GuardPattern::CounterNegative => {
            let counter = builder.emit(
                InstKind::Alloca { ty: Type::I32 },
                Type::Ptr,
                format!("fake_counter_slot_{tag}"),
            );
            builder.emit_void(InstKind::Store {
                ptr: counter.clone(),
                value: Value::Const(Constant::Int(Type::I32, 0)),
            });
            let loaded = builder.emit(
                InstKind::Load {
                    ptr: counter,
                    ty: Type::I32,
                },
                Type::I32,
                format!("fake_counter_{tag}"),
            );
            builder.emit(
                InstKind::ICmp {
                    pred: codedefender_ir::value::ICmpPred::Slt,
                    lhs: loaded,
                    rhs: Value::Const(Constant::Int(Type::I32, 0)),
                },
                Type::I1,
                format!("fake_guard_{tag}"),
            )
        }
        GuardPattern::CounterAtMax => {
            let counter = builder.emit(
                InstKind::Alloca { ty: Type::I32 },
                Type::Ptr,
                format!("fake_counter_slot_{tag}"),
            );
            builder.emit_void(InstKind::Store {
                ptr: counter.clone(),
                value: Value::Const(Constant::Int(Type::I32, 0)),
            });
            let loaded = builder.emit(
                InstKind::Load {
                    ptr: counter,
                    ty: Type::I32,
                },
                Type::I32,
                format!("fake_counter_{tag}"),
            );
            builder.emit(
                InstKind::ICmp {
                    pred: codedefender_ir::value::ICmpPred::Sge,
                    lhs: loaded,
                    rhs: Value::Const(Constant::Int(Type::I32, i32::MAX as i64)),
                },
                Type::I1,
                format!("fake_guard_{tag}"),
            )
        }
        GuardPattern::NotOfAlwaysTrue => {
            let always_true = opaque::emit(builder, rng, Polarity::True, tag);
            builder.emit(
                InstKind::Unary {
                    op: codedefender_ir::value::UnOp::Not,
                    value: always_true,
                },
                Type::I1,
                format!("fake_guard_{tag}"),
            )
        }
    }
}

fn is_loop_candidate(f: &Function, idx: usize) -> bool {
    let block = &f.blocks[idx];
    if block.id == f.entry() || block.has_exception_machinery() {
        return false;
    }
    let succ = match &block.terminator {
        Terminator::Br { target } => *target,
        _ => return false,
    };
    !f.block(succ).has_exception_machinery()
}

/// `succ`'s actual predecessor along this path is now `fake_exit`, not `original_pred` (the
/// candidate no longer branches there directly). Rewrite every PHI's incoming edge to match:
/// same value that used to arrive from `original_pred` (or a typed poison if none), now keyed
/// by `fake_exit`, so the PHI's incoming set still equals the post-splice predecessor set.
fn extend_phis_for_fake_exit(
    f: &mut Function,
    succ: BlockId,
    original_pred: BlockId,
    fake_exit: BlockId,
) {
    let inst_ids = f.block(succ).insts.clone();
    for id in inst_ids {
        let ty = f.inst(id).ty.clone();
        if let InstKind::Phi { incomings } = &mut f.inst_mut(id).kind {
            let matching = incomings
                .iter()
                .find(|(b, _)| *b == original_pred)
                .map(|(_, v)| v.clone());
            incomings.retain(|(b, _)| *b != original_pred);
            let value = matching.unwrap_or_else(|| Value::Const(ty.zero_constant()));
            incomings.push((fake_exit, value));
        }
    }
}

/// Splices a two-block fake loop (header + exit) between up to `fake_loop_count` shuffled
/// candidates and their successors.
pub fn inject_fake_loops(f: &mut Function, rng: &mut Prng, fake_loop_count: u32, counters: &mut Counters) {
    let mut candidates: Vec<usize> = (0..f.blocks.len()).filter(|&i| is_loop_candidate(f, i)).collect();
    rng.shuffle(&mut candidates);

    for idx in candidates.into_iter().take(fake_loop_count as usize) {
        let candidate = f.blocks[idx].id;
        let original_succ = match &f.blocks[idx].terminator {
            Terminator::Br { target } => *target,
            _ => continue,
        };
        let tag = f.fresh_id();
        let pattern = GUARD_PATTERNS[rng.choose_index(GUARD_PATTERNS.len())];

        let header = f.push_block(format!("fake_loop_{tag}"));
        let exit = f.push_block(format!("fake_exit_{tag}"));

        {
            let mut builder = Builder::at_start(f, header);
            let cond = always_false_cond(&mut builder, rng, pattern, tag);
            f.block_mut(header).terminator = Terminator::CondBr {
                cond,
                if_true: header,
                if_false: exit,
            };
        }
        f.block_mut(exit).terminator = Terminator::Br {
            target: original_succ,
        };
        f.block_mut(candidate).terminator = Terminator::Br { target: header };

        extend_phis_for_fake_exit(f, original_succ, candidate, exit);
        counters.fake_loops += 1;
    }

    f.recompute_preds();
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::types::Type;

    fn straight_line_fn() -> Function {
        let mut f = Function::new("f", Type::Void, vec![]);
        let entry = f.push_block("entry");
        let mid = f.push_block("mid");
        let exit = f.push_block("exit");
        f.block_mut(entry).terminator = Terminator::Br { target: mid };

        let mut builder = Builder::at_start(&mut f, mid);
        let slot = builder.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, "s");
        builder.emit_void(InstKind::Store {
            ptr: slot,
            value: Value::Const(Constant::Int(Type::I32, 7)),
        });
        f.block_mut(mid).terminator = Terminator::Br { target: exit };
        f.block_mut(exit).terminator = Terminator::Ret { value: None };
        f.recompute_preds();
        f
    }

    #[test]
    fn bogus_code_inserts_stores_and_verifies() {
        let mut f = straight_line_fn();
        let mut rng = Prng::from_seed_components(1, 1);
        let mut counters = Counters::default();
        inject_bogus_code(&mut f, &mut rng, 100, &mut counters);
        assert!(counters.bogus_instructions > 0);
        assert!(codedefender_ir::verify_function(&f).is_ok());
    }

    #[test]
    fn fake_loop_splices_header_and_exit() {
        let mut f = straight_line_fn();
        let mut rng = Prng::from_seed_components(2, 3);
        let mut counters = Counters::default();
        inject_fake_loops(&mut f, &mut rng, 1, &mut counters);
        assert_eq!(counters.fake_loops, 1);
        assert!(f.blocks.iter().any(|b| b.name.starts_with("fake_loop_")));
        assert!(f.blocks.iter().any(|b| b.name.starts_with("fake_exit_")));
        assert!(codedefender_ir::verify_function(&f).is_ok());
    }
}
