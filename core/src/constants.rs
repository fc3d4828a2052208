//! C10 — Constant Obfuscator & Pseudo-VM (spec §4.10).

use codedefender_ir::builder::{Builder, InsertPoint};
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BinOp, BlockId, InstId, Value};
use codedefender_ir::{Function, GlobalInit, GlobalVariable, InstKind, Linkage, Module};

use crate::model::Counters;
use crate::rng::Prng;

const PSEUDO_VM_MIN_CONST: i64 = 16;
const PSEUDO_VM_MAX_FUNCTIONS_PER_MODULE: usize = 5;

fn inst_position(f: &Function, block_id: BlockId, inst_id: InstId) -> usize {
    f.block(block_id)
        .insts
        .iter()
        .position(|id| *id == inst_id)
        .expect("instruction must be in its own block")
}

/// For each integer constant operand `c` not in `{-1, 0, 1}`: synthesize `y = c*7`, spill it to a
/// stack slot, load it back, divide by 7, and use the result instead. Hides the literal from a
/// naive `strings`-style scan of the IR.
pub fn obfuscate_constants(f: &mut Function, counters: &mut Counters) -> usize {
    let mut applied = 0;
    let block_ids: Vec<_> = f.blocks.iter().map(|b| b.id).collect();

    for block_id in block_ids {
        let inst_ids = f.block(block_id).insts.clone();
        for inst_id in inst_ids {
            let targets: Vec<(usize, i64, Type)> = f
                .inst(inst_id)
                .operands()
                .iter()
                .enumerate()
                .filter_map(|(i, v)| {
                    v.as_const_int()
                        .filter(|c| *c != -1 && *c != 0 && *c != 1)
                        .map(|c| (i, c, v.as_const().unwrap().ty()))
                })
                .collect();

            for (operand_idx, c, ty) in targets {
                let pos = inst_position(f, block_id, inst_id);
                let replacement = {
                    let mut builder = Builder::at(f, block_id, InsertPoint::Index(pos));
                    emit_hidden_constant(&mut builder, c, &ty, inst_id.0, operand_idx as u32)
                };
                let mut ops = f.inst_mut(inst_id).operands_mut();
                *ops[operand_idx] = replacement;
                applied += 1;
                counters.constants_hidden += 1;
            }
        }
    }
    applied
}

fn emit_hidden_constant(builder: &mut Builder<'_>, c: i64, ty: &Type, tag: u32, slot_idx: u32) -> Value {
    let y = builder.emit(
        InstKind::Binary {
            op: BinOp::Mul,
            lhs: Value::Const(Constant::Int(ty.clone(), c)),
            rhs: Value::Const(Constant::Int(ty.clone(), 7)),
        },
        ty.clone(),
        format!("obf_chide_y_{tag}_{slot_idx}"),
    );
    let slot = builder.emit(
        InstKind::Alloca { ty: ty.clone() },
        Type::Ptr,
        format!("obf_chide_slot_{tag}_{slot_idx}"),
    );
    builder.emit_void(InstKind::Store {
        ptr: slot.clone(),
        value: y,
    });
    let loaded = builder.emit(
        InstKind::Load {
            ptr: slot,
            ty: ty.clone(),
        },
        ty.clone(),
        format!("obf_chide_load_{tag}_{slot_idx}"),
    );
    builder.emit(
        InstKind::Binary {
            op: BinOp::SDiv,
            lhs: loaded,
            rhs: Value::Const(Constant::Int(ty.clone(), 7)),
        },
        ty.clone(),
        format!("obf_chide_res_{tag}_{slot_idx}"),
    )
}

fn ensure_vm_key_global(module: &mut Module, func_name: &str, rng: &mut Prng) -> u32 {
    let key = rng.gen_range(1, u16::MAX as u32);
    module.add_global(GlobalVariable {
        id: codedefender_ir::GlobalId(0),
        name: format!("__obf_key_{func_name}"),
        ty: Type::I32,
        initializer: Some(GlobalInit::Int((key as i64) ^ 0x5A5A)),
        linkage: Linkage::Internal,
        is_constant: true,
        comdat: None,
        section: None,
        is_tls_callback_entry: false,
    });
    key
}

/// Replaces integer constants `>= 16` (by absolute value) used as binary-op operands with
/// `encoded ^ key`. Capped at a handful of virtualized functions per module; skips functions with
/// exception machinery.
pub fn apply_pseudo_vm(
    module: &mut Module,
    func_name: &str,
    rng: &mut Prng,
    virtualized_so_far: &mut usize,
    counters: &mut Counters,
) -> bool {
    if *virtualized_so_far >= PSEUDO_VM_MAX_FUNCTIONS_PER_MODULE {
        return false;
    }
    let fid = match module.func_id_by_name(func_name) {
        Some(id) => id,
        None => return false,
    };
    if module.function(fid).has_exception_pad() {
        return false;
    }

    let candidates: Vec<(BlockId, InstId, usize, i64, Type)> = {
        let f = module.function(fid);
        let mut found = Vec::new();
        for block in &f.blocks {
            for inst_id in &block.insts {
                if let InstKind::Binary { .. } = &f.inst(*inst_id).kind {
                    for (i, operand) in f.inst(*inst_id).operands().iter().enumerate() {
                        if let Some(c) = operand.as_const_int() {
                            if c.abs() >= PSEUDO_VM_MIN_CONST {
                                found.push((block.id, *inst_id, i, c, operand.as_const().unwrap().ty()));
                            }
                        }
                    }
                }
            }
        }
        found
    };
    if candidates.is_empty() {
        return false;
    }

    let key = ensure_vm_key_global(module, func_name, rng);

    let f = module.function_mut(fid);
    for (block_id, inst_id, operand_idx, c, ty) in candidates {
        let pos = inst_position(f, block_id, inst_id);
        let encoded = c ^ key as i64;
        let result_ty = f.inst(inst_id).ty.clone();
        let decoded = {
            let mut builder = Builder::at(f, block_id, InsertPoint::Index(pos));
            builder.emit(
                InstKind::Binary {
                    op: BinOp::Xor,
                    lhs: Value::Const(Constant::Int(ty.clone(), encoded)),
                    rhs: Value::Const(Constant::Int(ty, key as i64)),
                },
                result_ty,
                format!("obf_vmconst_{}", inst_id.0),
            )
        };
        let mut ops = f.inst_mut(inst_id).operands_mut();
        *ops[operand_idx] = decoded;
        counters.dynamic_obfuscations += 1;
    }

    *virtualized_so_far += 1;
    counters.functions_virtualized += 1;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::block::Terminator;
    use codedefender_ir::types::Type;

    #[test]
    fn hides_nontrivial_constant() {
        let mut f = Function::new("f", Type::I32, vec![]);
        let entry = f.push_block("entry");
        let mut builder = Builder::at_start(&mut f, entry);
        let v = builder.emit(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Param(0),
                rhs: Value::Const(Constant::Int(Type::I32, 42)),
            },
            Type::I32,
            "v",
        );
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(v) };
        let mut counters = Counters::default();
        let applied = obfuscate_constants(&mut f, &mut counters);
        assert_eq!(applied, 1);
        assert_eq!(counters.constants_hidden, 1);
        assert!(codedefender_ir::verify_function(&f).is_ok());
    }

    #[test]
    fn leaves_small_constants_alone() {
        let mut f = Function::new("f", Type::I32, vec![]);
        let entry = f.push_block("entry");
        let mut builder = Builder::at_start(&mut f, entry);
        let v = builder.emit(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Param(0),
                rhs: Value::Const(Constant::Int(Type::I32, 1)),
            },
            Type::I32,
            "v",
        );
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(v) };
        let mut counters = Counters::default();
        assert_eq!(obfuscate_constants(&mut f, &mut counters), 0);
    }

    #[test]
    fn pseudo_vm_hides_large_constant() {
        let mut module = Module::new("m");
        let mut f = Function::new("target", Type::I32, vec![]);
        let entry = f.push_block("entry");
        let mut builder = Builder::at_start(&mut f, entry);
        let v = builder.emit(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Param(0),
                rhs: Value::Const(Constant::Int(Type::I32, 1000)),
            },
            Type::I32,
            "v",
        );
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(v) };
        module.add_function(f);

        let mut rng = Prng::from_seed_components(1, 2);
        let mut counters = Counters::default();
        let mut virtualized = 0;
        let applied = apply_pseudo_vm(&mut module, "target", &mut rng, &mut virtualized, &mut counters);
        assert!(applied);
        assert_eq!(virtualized, 1);
        assert_eq!(module.globals.len(), 1);
        let f = module.function(module.func_id_by_name("target").unwrap());
        assert!(codedefender_ir::verify_function(f).is_ok());
    }
}
