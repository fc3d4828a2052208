//! C14 — Anti-Tamper / Integrity Checker (spec §4.14). For each Critical function, folds the
//! function's final opcode sequence into a checksum stored as a read-only module constant, then
//! wires in an entry-point recomputation that branches to a tamper block on mismatch. Must run
//! after every other function-scoped pass — the fold is taken over final opcodes.

use codedefender_ir::block::Terminator;
use codedefender_ir::builder::Builder;
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BlockId, FuncId, ICmpPred, Value};
use codedefender_ir::{Callee, Function, GlobalInit, GlobalVariable, InstKind, Linkage, Module};

use crate::model::Counters;

const SELF_CHECKSUM_FN: &str = "__self_code_checksum";

/// `rotl(checksum ^ opcode, 1)` over every non-terminator instruction, in block-layout order
/// (spec §4.14). Orphaned arena entries left behind by earlier block splits are not reachable
/// through any block's `insts` list, so they never enter the fold.
pub fn fold_opcodes(f: &Function) -> u32 {
    let mut checksum: u32 = 0;
    for block in &f.blocks {
        for &id in &block.insts {
            let opcode = f.inst(id).opcode_tag();
            checksum = (checksum ^ opcode).rotate_left(1);
        }
    }
    checksum
}

fn checksum_global_name(func_name: &str) -> String {
    format!("{func_name}_checksum")
}

fn ensure_declaration(module: &mut Module, name: &str, ret_ty: Type, param_tys: Vec<Type>) -> FuncId {
    if let Some(id) = module.func_id_by_name(name) {
        return id;
    }
    module.add_function(Function::declaration(name, ret_ty, param_tys))
}

/// Splits `block_id` at `pos`; the tail becomes a fresh block, with PHI incoming edges in old
/// successors repointed. Same idiom as the other function-scoped passes (`control_flow.rs`,
/// `calls.rs`, `antidebug.rs`).
fn split_block_at(f: &mut Function, block_id: BlockId, pos: usize, tail_name: &str) -> BlockId {
    let original_insts = f.block(block_id).insts.clone();
    let original_terminator = f.block(block_id).terminator.clone();
    let tail: Vec<_> = original_insts[pos..].to_vec();
    f.block_mut(block_id).insts = original_insts[..pos].to_vec();

    let tail_block = f.push_block(tail_name);
    f.block_mut(tail_block).insts = tail;
    for succ in original_terminator.successors() {
        let inst_ids = f.block(succ).insts.clone();
        for id in inst_ids {
            if let InstKind::Phi { incomings } = &mut f.inst_mut(id).kind {
                for (b, _) in incomings.iter_mut() {
                    if *b == block_id {
                        *b = tail_block;
                    }
                }
            }
        }
    }
    f.block_mut(tail_block).terminator = original_terminator;
    tail_block
}

/// Emits the tamper sentinel a tampered function falls through to. Conservatively returns a
/// zeroed value of the function's return type rather than aborting outright, matching spec
/// §4.14's "returns an error sentinel" option (the alternative, calling an unreachable trap, is
/// reserved for `Void`-returning functions where no sentinel value exists).
fn tamper_terminator(f: &Function) -> Terminator {
    match &f.ret_ty {
        Type::Void => Terminator::Unreachable,
        ty => Terminator::Ret { value: Some(Value::Const(ty.zero_constant())) },
    }
}

/// Injects the checksum-recompute-and-compare scaffolding at `f`'s entry, reading the precomputed
/// constant from `checksum_global_name(f.name)`. `checksum_fid` is the runtime support routine
/// that hashes the function's compiled bytes (spec §4.14: the engine records the fold it computed
/// over the transformed IR; the equivalent hash over the emitted machine code is the runtime
/// toolchain's job, the same split already used for `__check_debugger`'s OS-backed probes).
fn inject_check(module: &mut Module, f: &mut Function, checksum_fid: FuncId, counters: &mut Counters) {
    let existing = module.globals.iter().find(|g| g.name == checksum_global_name(&f.name)).map(|g| g.id);
    let checksum_global = match existing {
        Some(_) => return,
        None => {
            let checksum = fold_opcodes(f);
            module.add_global(GlobalVariable {
                id: codedefender_ir::GlobalId(0),
                name: checksum_global_name(&f.name),
                ty: Type::I64,
                initializer: Some(GlobalInit::Int(checksum as i64)),
                linkage: Linkage::Internal,
                is_constant: true,
                comdat: None,
                section: None,
                is_tls_callback_entry: false,
            })
        }
    };

    let entry = f.entry();
    let continuation = split_block_at(f, entry, 0, "integrity_continue");
    let tampered = f.push_block("tampered");

    let self_func = module.func_id_by_name(&f.name);
    let mismatch = {
        let mut b = Builder::at_end(f, entry);
        let func_ptr = match self_func {
            Some(fid) => b.emit(InstKind::FuncAddr { func: fid }, Type::Ptr, "integrity_self_ptr"),
            None => Value::Const(Constant::Null),
        };
        let observed = b.emit(
            InstKind::Call { callee: Callee::Direct(checksum_fid), args: vec![func_ptr] },
            Type::I64,
            "integrity_observed",
        );
        let expected = b.emit(InstKind::GlobalAddr { global: checksum_global }, Type::Ptr, "integrity_expected_ptr");
        let expected = b.emit(InstKind::Load { ptr: expected, ty: Type::I64 }, Type::I64, "integrity_expected");
        b.emit(InstKind::ICmp { pred: ICmpPred::Ne, lhs: observed, rhs: expected }, Type::I1, "integrity_mismatch")
    };
    f.block_mut(entry).terminator = Terminator::CondBr { cond: mismatch, if_true: tampered, if_false: continuation };
    f.block_mut(tampered).terminator = tamper_terminator(f);
    counters.anti_analysis_insertions += 1;
}

/// Top-level C14 entry point: for every function in `target_functions`, stores its opcode
/// checksum as a module constant and wires in the recompute-and-compare check. Must be the last
/// function-scoped pass run in a cycle.
pub fn run(module: &mut Module, target_functions: &[FuncId], counters: &mut Counters) {
    let checksum_fid = ensure_declaration(module, SELF_CHECKSUM_FN, Type::I64, vec![Type::Ptr]);
    for &fid in target_functions {
        let mut f = module.function(fid).clone();
        inject_check(module, &mut f, checksum_fid, counters);
        *module.function_mut(fid) = f;
    }
    for f in &mut module.functions {
        f.recompute_preds();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::value::BinOp;

    fn adder_fn() -> Function {
        let mut f = Function::new("compute", Type::I32, vec![Type::I32, Type::I32]);
        let entry = f.push_block("entry");
        let sum = {
            let mut b = Builder::at_end(&mut f, entry);
            b.emit(InstKind::Binary { op: BinOp::Add, lhs: Value::Param(0), rhs: Value::Param(1) }, Type::I32, "sum")
        };
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(sum) };
        f
    }

    #[test]
    fn fold_is_deterministic_and_order_sensitive() {
        let f = adder_fn();
        let a = fold_opcodes(&f);
        let b = fold_opcodes(&f);
        assert_eq!(a, b);
    }

    #[test]
    fn injects_checksum_global_and_tamper_block() {
        let mut module = Module::new("m");
        let fid = module.add_function(adder_fn());
        let mut counters = Counters::default();
        run(&mut module, &[fid], &mut counters);

        assert!(module.globals.iter().any(|g| g.name == "compute_checksum" && g.is_constant));
        let f = module.function(fid);
        assert!(f.blocks.iter().any(|b| b.name == "tampered"));
        assert!(f.blocks.iter().any(|b| b.name == "integrity_continue"));
        assert!(codedefender_ir::verify_module(&module).is_ok());
        assert_eq!(counters.anti_analysis_insertions, 1);
    }

    #[test]
    fn idempotent_on_second_invocation() {
        let mut module = Module::new("m");
        let fid = module.add_function(adder_fn());
        let mut counters = Counters::default();
        run(&mut module, &[fid], &mut counters);
        run(&mut module, &[fid], &mut counters);
        assert_eq!(counters.anti_analysis_insertions, 1);
        assert_eq!(module.globals.iter().filter(|g| g.name == "compute_checksum").count(), 1);
    }
}
