//! C15 — Polymorphic & Metamorphic Engine (spec §4.15).
//!
//! Metamorphic reshaping perturbs a function's existing instruction stream in place (safe
//! reordering, dead-code insertion, instruction substitution), each independently gated at 30%
//! probability per site. Polymorphic cloning goes further: it produces `polyVariants` distinct,
//! independently mutated bodies for a function and replaces external call sites with a dispatcher
//! that picks one at runtime.

use codedefender_ir::block::Terminator;
use codedefender_ir::builder::{Builder, InsertPoint};
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BinOp, BlockId, FuncId, ICmpPred, InstId, UnOp, Value};
use codedefender_ir::{Callee, Function, InstKind, Linkage, Module};

use crate::model::Counters;
use crate::opaque;
use crate::rng::Prng;
use crate::substitute::is_flattened;

fn ensure_declaration(module: &mut Module, name: &str, ret_ty: Type, param_tys: Vec<Type>) -> FuncId {
    if let Some(id) = module.func_id_by_name(name) {
        return id;
    }
    module.add_function(Function::declaration(name, ret_ty, param_tys))
}

fn is_reorderable(f: &Function, id: InstId) -> bool {
    let inst = f.inst(id);
    !inst.is_phi() && !inst.is_call() && !inst.is_memory_op()
}

/// Shuffles each maximal run of reorderable instructions in `block_id` that has no intra-run
/// dependency (spec §4.15: "no reorderable instruction depends on another in the same run").
fn reorder_block(f: &mut Function, block_id: BlockId, rng: &mut Prng) {
    let insts = f.block(block_id).insts.clone();
    let mut new_order = insts.clone();
    let mut i = 0;
    while i < insts.len() {
        if !is_reorderable(f, insts[i]) {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < insts.len() && is_reorderable(f, insts[j]) {
            j += 1;
        }
        let run = &insts[i..j];
        if run.len() > 1 {
            let run_set: std::collections::HashSet<InstId> = run.iter().copied().collect();
            let no_intra_dep = run.iter().all(|id| {
                f.inst(*id)
                    .operands()
                    .iter()
                    .all(|v| !matches!(v, Value::Inst(dep) if run_set.contains(dep)))
            });
            if no_intra_dep {
                let mut shuffled = run.to_vec();
                rng.shuffle(&mut shuffled);
                new_order[i..j].clone_from_slice(&shuffled);
            }
        }
        i = j;
    }
    f.block_mut(block_id).insts = new_order;
}

#[derive(Debug, Clone, Copy)]
enum DeadTemplate {
    Arithmetic,
    Comparison,
    Counter,
    XorCrypto,
}

const DEAD_TEMPLATES: [DeadTemplate; 4] =
    [DeadTemplate::Arithmetic, DeadTemplate::Comparison, DeadTemplate::Counter, DeadTemplate::XorCrypto];

/// Emits a self-contained, side-effect-free instruction sequence (its own alloca, never read by
/// the rest of the block) before a randomly chosen instruction in `block_id`.
fn insert_dead_code(f: &mut Function, block_id: BlockId, rng: &mut Prng, counters: &mut Counters) {
    let len = f.block(block_id).insts.len();
    let pos = if len == 0 { 0 } else { rng.choose_index(len) };
    let tag = f.fresh_id();
    let template = DEAD_TEMPLATES[rng.choose_index(DEAD_TEMPLATES.len())];
    let a = (rng.next_i64() & 0xFF) as i64;
    let b = (rng.next_i64() & 0xFF) as i64;

    let mut builder = Builder::at(f, block_id, InsertPoint::Index(pos));
    let slot = builder.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, format!("dead_slot_{tag}"));
    builder.emit_void(InstKind::Store { ptr: slot.clone(), value: Value::Const(Constant::Int(Type::I32, a)) });
    let loaded = builder.emit(InstKind::Load { ptr: slot.clone(), ty: Type::I32 }, Type::I32, format!("dead_load_{tag}"));
    let result = match template {
        DeadTemplate::Arithmetic => builder.emit(
            InstKind::Binary { op: BinOp::Add, lhs: loaded, rhs: Value::Const(Constant::Int(Type::I32, b)) },
            Type::I32,
            format!("dead_arith_{tag}"),
        ),
        DeadTemplate::Comparison => {
            let cmp = builder.emit(
                InstKind::ICmp { pred: ICmpPred::Sgt, lhs: loaded, rhs: Value::Const(Constant::Int(Type::I32, b)) },
                Type::I1,
                format!("dead_cmp_{tag}"),
            );
            builder.emit(
                InstKind::Select {
                    cond: cmp,
                    if_true: Value::Const(Constant::Int(Type::I32, a)),
                    if_false: Value::Const(Constant::Int(Type::I32, b)),
                },
                Type::I32,
                format!("dead_cmp_val_{tag}"),
            )
        }
        DeadTemplate::Counter => builder.emit(
            InstKind::Binary { op: BinOp::Add, lhs: loaded, rhs: Value::Const(Constant::Int(Type::I32, 1)) },
            Type::I32,
            format!("dead_counter_{tag}"),
        ),
        DeadTemplate::XorCrypto => builder.emit(
            InstKind::Binary { op: BinOp::Xor, lhs: loaded, rhs: Value::Const(Constant::Int(Type::I32, b)) },
            Type::I32,
            format!("dead_xor_{tag}"),
        ),
    };
    builder.emit_void(InstKind::Store { ptr: slot, value: result });
    counters.metamorphic_transforms += 1;
}

fn bin(b: &mut Builder<'_>, op: BinOp, lhs: Value, rhs: Value, ty: &Type, name: String) -> Value {
    b.emit(InstKind::Binary { op, lhs, rhs }, ty.clone(), name)
}

fn not(b: &mut Builder<'_>, value: Value, ty: &Type, name: String) -> Value {
    b.emit(InstKind::Unary { op: UnOp::Not, value }, ty.clone(), name)
}

/// Two independent identities per commutative/associative binary op, selected by a per-site
/// random bit — distinct from C8's always-on MBA rewrite so a polymorphic variant's substitution
/// pattern doesn't just reproduce the module-wide MBA pass.
fn substitute_once(f: &mut Function, block_id: BlockId, inst_id: InstId, rng: &mut Prng) -> bool {
    let (op, lhs, rhs, ty) = match &f.inst(inst_id).kind {
        InstKind::Binary { op, lhs, rhs } if lhs.as_const_int().is_none() && rhs.as_const_int().is_none() => {
            (*op, lhs.clone(), rhs.clone(), f.inst(inst_id).ty.clone())
        }
        _ => return false,
    };
    if !matches!(op, BinOp::Add | BinOp::Sub | BinOp::Xor | BinOp::And | BinOp::Or) {
        return false;
    }
    let pos = f.block(block_id).insts.iter().position(|id| *id == inst_id).expect("inst in its own block");
    let variant = rng.gen_range(0, 2);
    let mut b = Builder::at(f, block_id, InsertPoint::Index(pos));
    let n = |suffix: &str| format!("poly_sub_{}_{suffix}", inst_id.0);

    let replacement = match (op, variant) {
        (BinOp::Add, 0) => {
            let x = bin(&mut b, BinOp::Xor, lhs.clone(), rhs.clone(), &ty, n("xor"));
            let and = bin(&mut b, BinOp::And, lhs, rhs, &ty, n("and"));
            let dbl = bin(&mut b, BinOp::Shl, and, Value::Const(Constant::Int(Type::I64, 1)), &ty, n("dbl"));
            bin(&mut b, BinOp::Add, x, dbl, &ty, n("res"))
        }
        (BinOp::Add, _) => {
            let or = bin(&mut b, BinOp::Or, lhs.clone(), rhs.clone(), &ty, n("or"));
            let and = bin(&mut b, BinOp::And, lhs, rhs, &ty, n("and"));
            bin(&mut b, BinOp::Add, or, and, &ty, n("res"))
        }
        (BinOp::Sub, 0) => {
            let x = bin(&mut b, BinOp::Xor, lhs.clone(), rhs.clone(), &ty, n("xor"));
            let not_l = not(&mut b, lhs, &ty, n("notl"));
            let and = bin(&mut b, BinOp::And, not_l, rhs, &ty, n("and"));
            let dbl = bin(&mut b, BinOp::Shl, and, Value::Const(Constant::Int(Type::I64, 1)), &ty, n("dbl"));
            bin(&mut b, BinOp::Sub, x, dbl, &ty, n("res"))
        }
        (BinOp::Sub, _) => {
            let not_r = not(&mut b, rhs, &ty, n("notr"));
            let sum = bin(&mut b, BinOp::Add, lhs, not_r, &ty, n("sum"));
            bin(&mut b, BinOp::Add, sum, Value::Const(Constant::Int(Type::I64, 1)), &ty, n("res"))
        }
        (BinOp::Xor, 0) => {
            let or = bin(&mut b, BinOp::Or, lhs.clone(), rhs.clone(), &ty, n("or"));
            let and = bin(&mut b, BinOp::And, lhs, rhs, &ty, n("and"));
            bin(&mut b, BinOp::Sub, or, and, &ty, n("res"))
        }
        (BinOp::Xor, _) => {
            let not_l = not(&mut b, lhs.clone(), &ty, n("notl"));
            let not_r = not(&mut b, rhs.clone(), &ty, n("notr"));
            let a = bin(&mut b, BinOp::And, lhs, not_r, &ty, n("a"));
            let c = bin(&mut b, BinOp::And, not_l, rhs, &ty, n("c"));
            bin(&mut b, BinOp::Or, a, c, &ty, n("res"))
        }
        (BinOp::And, 0) => {
            let sum = bin(&mut b, BinOp::Add, lhs.clone(), rhs.clone(), &ty, n("sum"));
            let x = bin(&mut b, BinOp::Xor, lhs, rhs, &ty, n("xor"));
            let diff = bin(&mut b, BinOp::Sub, sum, x, &ty, n("diff"));
            bin(&mut b, BinOp::LShr, diff, Value::Const(Constant::Int(Type::I64, 1)), &ty, n("res"))
        }
        (BinOp::And, _) => {
            let not_l = not(&mut b, lhs, &ty, n("notl"));
            let not_r = not(&mut b, rhs, &ty, n("notr"));
            let or = bin(&mut b, BinOp::Or, not_l, not_r, &ty, n("or"));
            not(&mut b, or, &ty, n("res"))
        }
        (BinOp::Or, 0) => {
            let sum = bin(&mut b, BinOp::Add, lhs.clone(), rhs.clone(), &ty, n("sum"));
            let and = bin(&mut b, BinOp::And, lhs, rhs, &ty, n("and"));
            bin(&mut b, BinOp::Sub, sum, and, &ty, n("res"))
        }
        (BinOp::Or, _) => {
            let not_l = not(&mut b, lhs, &ty, n("notl"));
            let not_r = not(&mut b, rhs, &ty, n("notr"));
            let and = bin(&mut b, BinOp::And, not_l, not_r, &ty, n("and"));
            not(&mut b, and, &ty, n("res"))
        }
        _ => unreachable!("filtered above"),
    };
    f.replace_inst_uses(inst_id, replacement);
    f.block_mut(block_id).insts.retain(|id| *id != inst_id);
    true
}

fn substitute_block(f: &mut Function, block_id: BlockId, rng: &mut Prng, counters: &mut Counters) {
    let inst_ids = f.block(block_id).insts.clone();
    for inst_id in inst_ids {
        if substitute_once(f, block_id, inst_id, rng) {
            counters.metamorphic_transforms += 1;
        }
    }
}

/// Applies the three metamorphic transforms to every non-generated block of `f`, each gated at
/// an independent 30% probability per block. The substitution step is skipped for functions
/// carrying `cff_*` blocks, whose dominance is too fragile for in-place rewrites (spec §4.15,
/// §4.8).
pub fn metamorphic_reshape(f: &mut Function, rng: &mut Prng, counters: &mut Counters) {
    let skip_substitution = is_flattened(f);
    let block_ids: Vec<BlockId> = f.blocks.iter().map(|b| b.id).collect();
    for block_id in block_ids {
        if opaque::is_generated_name(&f.block(block_id).name) {
            continue;
        }
        if rng.percent_roll(30) {
            reorder_block(f, block_id, rng);
        }
        if rng.percent_roll(30) {
            insert_dead_code(f, block_id, rng, counters);
        }
        if !skip_substitution && rng.percent_roll(30) {
            substitute_block(f, block_id, rng, counters);
        }
    }
    f.recompute_preds();
}

/// Applies metamorphic reshaping to every function named in `target_functions`.
pub fn metamorphic_reshape_module(module: &mut Module, target_functions: &[FuncId], rng: &mut Prng, counters: &mut Counters) {
    for &fid in target_functions {
        let f = module.function_mut(fid);
        metamorphic_reshape(f, rng, counters);
    }
}

fn deterministic_variant_seed(func_name: &str, variant_index: u32) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    let prime: u64 = 0x100000001b3;
    for b in func_name.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(prime);
    }
    hash ^= variant_index as u64;
    hash.wrapping_mul(prime)
}

/// Applies the "second pass" variant-differentiating mutation: dead-code insertion in every
/// block, then substitution (unless the function is already flattened), driven by a seed
/// deterministic in `(func_name, variant_index)` alone — independent of the shared cycle RNG
/// stream position, so variant bodies don't depend on how many other functions were processed
/// first (spec §5 determinism).
fn mutate_variant(f: &mut Function, variant_index: u32, counters: &mut Counters) {
    let seed = deterministic_variant_seed(&f.name, variant_index);
    let mut rng = Prng::from_seed_components(seed, variant_index as u64);
    let skip_substitution = is_flattened(f);
    let block_ids: Vec<BlockId> = f.blocks.iter().map(|b| b.id).collect();
    for block_id in block_ids {
        if opaque::is_generated_name(&f.block(block_id).name) {
            continue;
        }
        insert_dead_code(f, block_id, &mut rng, counters);
        if !skip_substitution {
            substitute_block(f, block_id, &mut rng, counters);
        }
    }
    f.recompute_preds();
}

fn build_dispatcher_function(original: &Function, variant_fids: &[FuncId], rdtsc_fid: FuncId) -> Function {
    let mut f = Function::new(original.name.clone(), original.ret_ty.clone(), original.param_tys.clone());
    f.linkage = original.linkage;
    let entry = f.push_block("dispatch");
    let n = variant_fids.len() as i64;

    let idx = {
        let mut b = Builder::at_end(&mut f, entry);
        let raw = b.emit(InstKind::Call { callee: Callee::Direct(rdtsc_fid), args: vec![] }, Type::I64, "poly_rdtsc");
        b.emit(
            InstKind::Binary { op: BinOp::URem, lhs: raw, rhs: Value::Const(Constant::Int(Type::I64, n)) },
            Type::I64,
            "poly_idx",
        )
    };

    let mut case_blocks = Vec::with_capacity(variant_fids.len());
    for (i, &vfid) in variant_fids.iter().enumerate() {
        let case_block = f.push_block(format!("{}_dispatch_case_{i}", original.name));
        let args: Vec<Value> = (0..original.param_tys.len()).map(|p| Value::Param(p as u32)).collect();
        let result = {
            let mut b = Builder::at_end(&mut f, case_block);
            if matches!(original.ret_ty, Type::Void) {
                b.emit_void(InstKind::Call { callee: Callee::Direct(vfid), args });
                None
            } else {
                Some(b.emit(
                    InstKind::Call { callee: Callee::Direct(vfid), args },
                    original.ret_ty.clone(),
                    format!("poly_result_{i}"),
                ))
            }
        };
        f.block_mut(case_block).terminator = Terminator::Ret { value: result };
        case_blocks.push(case_block);
    }

    let cases: Vec<(i64, BlockId)> = case_blocks.iter().enumerate().skip(1).map(|(i, b)| (i as i64, *b)).collect();
    f.block_mut(entry).terminator = Terminator::Switch { value: idx, default: case_blocks[0], cases };
    f
}

/// Top-level polymorphic cloning: for each function in `target_functions`, preserves the current
/// body under an internal name, produces `poly_variants` independently mutated clones, and
/// replaces the function (by `FuncId`, so existing call sites keep working unmodified) with an
/// RDTSC-driven dispatcher (spec §4.15). Idempotent across repeated invocations on the same
/// function: a function already carrying a `_original_impl` twin is skipped, so running this once
/// per cycle over several cycles still bounds total growth to `poly_variants * |targets|`, not
/// that multiplied by the cycle count (spec §8 property 4).
pub fn polymorphic_variants(module: &mut Module, target_functions: &[FuncId], poly_variants: u32, counters: &mut Counters) {
    if poly_variants == 0 {
        return;
    }
    let rdtsc_fid = ensure_declaration(module, "__rdtsc", Type::I64, vec![]);

    for &fid in target_functions {
        let original = module.function(fid).clone();
        if original.is_declaration {
            continue;
        }
        if module.func_id_by_name(&format!("{}_original_impl", original.name)).is_some() {
            continue;
        }

        let mut preserved = original.clone();
        preserved.name = format!("{}_original_impl", original.name);
        preserved.linkage = Linkage::Internal;
        module.add_function(preserved);

        let mut variant_fids = Vec::with_capacity(poly_variants as usize);
        for v in 0..poly_variants {
            let mut variant = original.clone();
            variant.name = format!("{}_variant_{v}", original.name);
            variant.linkage = Linkage::Internal;
            mutate_variant(&mut variant, v, counters);
            variant_fids.push(module.add_function(variant));
            counters.polymorphic_variants += 1;
        }

        let dispatcher = build_dispatcher_function(&original, &variant_fids, rdtsc_fid);
        *module.function_mut(fid) = dispatcher;
    }
}

/// Runs metamorphic reshaping over `target_functions`, then polymorphic cloning over the
/// (now-reshaped) bodies.
pub fn run(module: &mut Module, target_functions: &[FuncId], poly_variants: u32, rng: &mut Prng, counters: &mut Counters) {
    metamorphic_reshape_module(module, target_functions, rng, counters);
    polymorphic_variants(module, target_functions, poly_variants, counters);
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::types::Type;

    fn straight_line_fn(name: &str) -> Function {
        let mut f = Function::new(name, Type::I32, vec![Type::I32, Type::I32]);
        let entry = f.push_block("entry");
        let mut b = Builder::at_start(&mut f, entry);
        let sum = b.emit(
            InstKind::Binary { op: BinOp::Add, lhs: Value::Param(0), rhs: Value::Param(1) },
            Type::I32,
            "sum",
        );
        let prod = b.emit(
            InstKind::Binary { op: BinOp::Mul, lhs: sum.clone(), rhs: Value::Param(0) },
            Type::I32,
            "prod",
        );
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(prod) };
        f.recompute_preds();
        f
    }

    #[test]
    fn metamorphic_reshape_preserves_verification() {
        let mut f = straight_line_fn("shape_me");
        let mut rng = Prng::from_seed_components(11, 22);
        let mut counters = Counters::default();
        for _ in 0..5 {
            metamorphic_reshape(&mut f, &mut rng, &mut counters);
        }
        assert!(codedefender_ir::verify_function(&f).is_ok());
    }

    #[test]
    fn polymorphic_variants_installs_dispatcher_and_verifies() {
        let mut module = Module::new("m");
        let fid = module.add_function(straight_line_fn("compute"));
        let mut counters = Counters::default();
        polymorphic_variants(&mut module, &[fid], 3, &mut counters);

        assert_eq!(counters.polymorphic_variants, 3);
        assert!(module.func_id_by_name("compute_original_impl").is_some());
        for v in 0..3 {
            assert!(module.func_id_by_name(&format!("compute_variant_{v}")).is_some());
        }
        let dispatcher = module.function(fid);
        assert_eq!(dispatcher.name, "compute");
        assert!(matches!(dispatcher.blocks[0].terminator, Terminator::Switch { .. }));
        assert!(codedefender_ir::verify_module(&module).is_ok());
    }

    #[test]
    fn polymorphic_variants_is_idempotent_across_repeated_calls() {
        let mut module = Module::new("m");
        let fid = module.add_function(straight_line_fn("compute"));
        let mut counters = Counters::default();
        polymorphic_variants(&mut module, &[fid], 3, &mut counters);
        let count_after_first = module.functions.len();
        polymorphic_variants(&mut module, &[fid], 3, &mut counters);
        assert_eq!(module.functions.len(), count_after_first);
        assert_eq!(counters.polymorphic_variants, 3);
    }

    #[test]
    fn mutate_variant_is_deterministic_per_seed() {
        let mut a = straight_line_fn("x");
        let mut b = straight_line_fn("x");
        let mut counters = Counters::default();
        mutate_variant(&mut a, 2, &mut counters);
        mutate_variant(&mut b, 2, &mut counters);
        assert_eq!(a.blocks.len(), b.blocks.len());
        assert_eq!(a.block(a.entry()).insts.len(), b.block(b.entry()).insts.len());
    }
}
