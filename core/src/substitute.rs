//! C8 — Instruction Substituter & MBA (spec §4.8).

use codedefender_ir::builder::Builder;
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BinOp, UnOp, Value};
use codedefender_ir::{Function, InstKind};

use crate::model::Counters;
use crate::rng::Prng;

fn power_of_two_log2(v: i64) -> Option<u32> {
    if v > 0 && (v & (v - 1)) == 0 {
        Some(v.trailing_zeros())
    } else {
        None
    }
}

/// Lightweight, always-on rewrite: multiplication/division by a power-of-two constant becomes a
/// shift. Mutates the matched instruction's kind in place since the replacement has the same
/// arity (one binary op in, one binary op out) and needs no new value id.
pub fn substitute(f: &mut Function, counters: &mut Counters) -> usize {
    let mut applied = 0;
    for inst in &mut f.insts {
        let new_kind = match &inst.kind {
            InstKind::Binary {
                op: BinOp::Mul,
                lhs,
                rhs,
            } => const_operand(lhs, rhs).and_then(|(c, other)| {
                power_of_two_log2(c).map(|shift| InstKind::Binary {
                    op: BinOp::Shl,
                    lhs: other,
                    rhs: Value::Const(Constant::Int(Type::I64, shift as i64)),
                })
            }),
            InstKind::Binary {
                op: BinOp::UDiv,
                lhs,
                rhs,
            } => rhs.as_const_int().and_then(power_of_two_log2).map(|shift| InstKind::Binary {
                op: BinOp::LShr,
                lhs: lhs.clone(),
                rhs: Value::Const(Constant::Int(Type::I64, shift as i64)),
            }),
            InstKind::Binary {
                op: BinOp::SDiv,
                lhs,
                rhs,
            } => rhs.as_const_int().and_then(power_of_two_log2).map(|shift| InstKind::Binary {
                op: BinOp::AShr,
                lhs: lhs.clone(),
                rhs: Value::Const(Constant::Int(Type::I64, shift as i64)),
            }),
            _ => None,
        };
        if let Some(kind) = new_kind {
            inst.kind = kind;
            applied += 1;
            counters.instruction_substitutions += 1;
        }
    }
    applied
}

fn const_operand(lhs: &Value, rhs: &Value) -> Option<(i64, Value)> {
    if let Some(c) = rhs.as_const_int() {
        Some((c, lhs.clone()))
    } else {
        lhs.as_const_int().map(|c| (c, rhs.clone()))
    }
}

/// True when `f` contains a block generated by control-flow flattening; such a function's local
/// dominance relationships are too fragile for in-place MBA rewrites (spec §4.8).
pub fn is_flattened(f: &Function) -> bool {
    f.blocks.iter().any(|b| b.name.starts_with("cff_"))
}

/// Mixed Boolean-Arithmetic rewriter: replaces a binary arithmetic/bitwise op on two non-constant
/// SSA operands with a semantically equivalent, more convoluted expression tree.
pub fn apply_mba(f: &mut Function, mba_complexity: u32, counters: &mut Counters) -> usize {
    if is_flattened(f) {
        return 0;
    }

    let mut applied = 0;
    let block_ids: Vec<_> = f.blocks.iter().map(|b| b.id).collect();
    for block_id in block_ids {
        let inst_ids = f.block(block_id).insts.clone();
        for inst_id in inst_ids {
            let kind = f.inst(inst_id).kind.clone();
            let ty = f.inst(inst_id).ty.clone();
            let rewritten = match &kind {
                InstKind::Binary { op, lhs, rhs }
                    if lhs.as_const_int().is_none() && rhs.as_const_int().is_none() =>
                {
                    rewrite_mba(f, block_id, inst_id, *op, lhs.clone(), rhs.clone(), &ty, mba_complexity)
                }
                InstKind::Unary {
                    op: UnOp::Not,
                    value,
                } if value.as_const_int().is_none() => {
                    Some(rewrite_not(f, block_id, inst_id, value.clone(), &ty))
                }
                _ => None,
            };
            if let Some(new_value) = rewritten {
                f.replace_inst_uses(inst_id, new_value);
                f.block_mut(block_id).insts.retain(|id| *id != inst_id);
                applied += 1;
                counters.mba_rewrites += 1;
            }
        }
    }
    applied
}

fn position_of(f: &Function, block_id: codedefender_ir::value::BlockId, inst_id: codedefender_ir::value::InstId) -> usize {
    f.block(block_id)
        .insts
        .iter()
        .position(|id| *id == inst_id)
        .expect("instruction must be in its own block")
}

fn bin(builder: &mut Builder<'_>, op: BinOp, lhs: Value, rhs: Value, ty: &Type, name: String) -> Value {
    builder.emit(InstKind::Binary { op, lhs, rhs }, ty.clone(), name)
}

#[allow(clippy::too_many_arguments)]
fn rewrite_mba(
    f: &mut Function,
    block_id: codedefender_ir::value::BlockId,
    inst_id: codedefender_ir::value::InstId,
    op: BinOp,
    a: Value,
    b: Value,
    ty: &Type,
    mba_complexity: u32,
) -> Option<Value> {
    let pos = position_of(f, block_id, inst_id);
    let mut builder = Builder::at(f, block_id, codedefender_ir::builder::InsertPoint::Index(pos));
    let n = |suffix: &str| format!("mba_{}_{suffix}", inst_id.0);

    let result = match op {
        BinOp::Add => {
            let x = bin(&mut builder, BinOp::Xor, a.clone(), b.clone(), ty, n("xor"));
            let and = bin(&mut builder, BinOp::And, a, b, ty, n("and"));
            let two_and = bin(
                &mut builder,
                BinOp::Shl,
                and,
                Value::Const(Constant::Int(Type::I64, 1)),
                ty,
                n("dbl"),
            );
            bin(&mut builder, BinOp::Add, x, two_and, ty, n("sum"))
        }
        BinOp::Sub => {
            let x = bin(&mut builder, BinOp::Xor, a.clone(), b.clone(), ty, n("xor"));
            let not_a = builder.emit(
                InstKind::Unary {
                    op: UnOp::Not,
                    value: a,
                },
                ty.clone(),
                n("nota"),
            );
            let and = bin(&mut builder, BinOp::And, not_a, b, ty, n("and"));
            let two_and = bin(
                &mut builder,
                BinOp::Shl,
                and,
                Value::Const(Constant::Int(Type::I64, 1)),
                ty,
                n("dbl"),
            );
            bin(&mut builder, BinOp::Sub, x, two_and, ty, n("diff"))
        }
        BinOp::Xor => {
            let or = bin(&mut builder, BinOp::Or, a.clone(), b.clone(), ty, n("or"));
            let and = bin(&mut builder, BinOp::And, a, b, ty, n("and"));
            bin(&mut builder, BinOp::Sub, or, and, ty, n("res"))
        }
        BinOp::And => {
            let sum = bin(&mut builder, BinOp::Add, a.clone(), b.clone(), ty, n("sum"));
            let x = bin(&mut builder, BinOp::Xor, a, b, ty, n("xor"));
            let diff = bin(&mut builder, BinOp::Sub, sum, x, ty, n("diff"));
            bin(
                &mut builder,
                BinOp::LShr,
                diff,
                Value::Const(Constant::Int(Type::I64, 1)),
                ty,
                n("res"),
            )
        }
        BinOp::Or => {
            let sum = bin(&mut builder, BinOp::Add, a.clone(), b.clone(), ty, n("sum"));
            let and = bin(&mut builder, BinOp::And, a, b, ty, n("and"));
            bin(&mut builder, BinOp::Sub, sum, and, ty, n("res"))
        }
        BinOp::Mul if mba_complexity >= 3 => {
            let sum = bin(&mut builder, BinOp::Add, a.clone(), b.clone(), ty, n("sum"));
            let diff = bin(&mut builder, BinOp::Sub, a, b, ty, n("diff"));
            let sum_sq = bin(&mut builder, BinOp::Mul, sum.clone(), sum, ty, n("sumsq"));
            let diff_sq = bin(&mut builder, BinOp::Mul, diff.clone(), diff, ty, n("diffsq"));
            let delta = bin(&mut builder, BinOp::Sub, sum_sq, diff_sq, ty, n("delta"));
            bin(
                &mut builder,
                BinOp::AShr,
                delta,
                Value::Const(Constant::Int(Type::I64, 2)),
                ty,
                n("res"),
            )
        }
        _ => return None,
    };
    Some(result)
}

fn rewrite_not(
    f: &mut Function,
    block_id: codedefender_ir::value::BlockId,
    inst_id: codedefender_ir::value::InstId,
    value: Value,
    ty: &Type,
) -> Value {
    let pos = position_of(f, block_id, inst_id);
    let mut builder = Builder::at(f, block_id, codedefender_ir::builder::InsertPoint::Index(pos));
    let n = |suffix: &str| format!("mba_not_{}_{suffix}", inst_id.0);
    let neg = builder.emit(
        InstKind::Unary {
            op: UnOp::Neg,
            value,
        },
        ty.clone(),
        n("neg"),
    );
    bin(&mut builder, BinOp::Sub, neg, Value::Const(Constant::Int(Type::I64, 1)), ty, n("res"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::block::Terminator;
    use codedefender_ir::types::Type;

    #[test]
    fn power_of_two_mul_becomes_shift() {
        let mut f = Function::new("f", Type::I32, vec![]);
        let entry = f.push_block("entry");
        let mut builder = Builder::at_start(&mut f, entry);
        let v = builder.emit(
            InstKind::Binary {
                op: BinOp::Mul,
                lhs: Value::Param(0),
                rhs: Value::Const(Constant::Int(Type::I32, 8)),
            },
            Type::I32,
            "v",
        );
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(v) };
        let mut counters = Counters::default();
        let applied = substitute(&mut f, &mut counters);
        assert_eq!(applied, 1);
        match &f.insts[0].kind {
            InstKind::Binary { op: BinOp::Shl, .. } => {}
            other => panic!("expected shl, got {other:?}"),
        }
    }

    #[test]
    fn mba_rewrite_preserves_verification() {
        let mut f = Function::new("f", Type::I32, vec![]);
        let entry = f.push_block("entry");
        let mut builder = Builder::at_start(&mut f, entry);
        let sum = builder.emit(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Param(0),
                rhs: Value::Param(1),
            },
            Type::I32,
            "sum",
        );
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(sum) };
        f.recompute_preds();
        let mut counters = Counters::default();
        let applied = apply_mba(&mut f, 5, &mut counters);
        assert_eq!(applied, 1);
        assert!(codedefender_ir::verify_function(&f).is_ok());
    }

    #[test]
    fn flattened_function_is_skipped() {
        let mut f = Function::new("f", Type::I32, vec![]);
        let entry = f.push_block("entry");
        f.push_block("cff_dispatch");
        let mut builder = Builder::at_start(&mut f, entry);
        let sum = builder.emit(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Param(0),
                rhs: Value::Param(1),
            },
            Type::I32,
            "sum",
        );
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(sum) };
        let mut counters = Counters::default();
        assert_eq!(apply_mba(&mut f, 5, &mut counters), 0);
    }
}
