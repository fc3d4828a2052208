//! C12 — Indirect-Call Table & Import Hider (spec §4.12).
//!
//! Two independent rewrites over the whole module: internal direct calls are redirected through
//! a module-level function-pointer table; external (declaration-only) calls are redirected
//! through a hash-verified, lazily-resolved cache slot.

use codedefender_ir::block::Terminator;
use codedefender_ir::builder::Builder;
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BlockId, FuncId, GlobalId, ICmpPred, InstId, Value};
use codedefender_ir::{Callee, Function, GlobalInit, GlobalVariable, InsertPoint, Linkage, Module};
use codedefender_ir::InstKind;

use crate::model::{ApiResolutionCacheSlot, Counters, FunctionPointerTable};

const PTR_SIZE: i64 = 8;
const API_HASH_FN: &str = "__api_hash";
const RESOLVE_API_FN: &str = "__resolve_api";
const LOAD_LIBRARY_FN: &str = "LoadLibraryA";
const GET_PROC_ADDRESS_FN: &str = "GetProcAddress";

/// Runtime primitives never worth hiding behind the resolver (spec §4.12).
const IMPORT_ALLOWLIST: &[&str] = &[
    "printf", "puts", "exit", "malloc", "free", "memcpy", "memset", "strlen",
];

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    let prime: u64 = 0x100000001b3;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(prime);
    }
    hash
}

/// `Create|Open|Read|Write -> kernel32`, `Nt|Rtl -> ntdll`, anything naming a window or message
/// API -> user32. Everything else defaults to kernel32 (spec §4.12).
fn dll_name_for(func_name: &str) -> &'static str {
    if func_name.starts_with("Create")
        || func_name.starts_with("Open")
        || func_name.starts_with("Read")
        || func_name.starts_with("Write")
    {
        "kernel32.dll"
    } else if func_name.starts_with("Nt") || func_name.starts_with("Rtl") {
        "ntdll.dll"
    } else if func_name.contains("Window") || func_name.contains("Message") {
        "user32.dll"
    } else {
        "kernel32.dll"
    }
}

fn add_bytes_global(module: &mut Module, name: String, mut bytes: Vec<u8>) -> GlobalId {
    bytes.push(0);
    module.add_global(GlobalVariable {
        id: GlobalId(0),
        name,
        ty: Type::ByteArray(bytes.len()),
        initializer: Some(GlobalInit::Bytes(bytes)),
        linkage: Linkage::Internal,
        is_constant: true,
        comdat: None,
        section: None,
        is_tls_callback_entry: false,
    })
}

// ---------------------------------------------------------------------------------------------
// Internal calls: function-pointer table
// ---------------------------------------------------------------------------------------------

/// Every function directly called anywhere in the module, that is itself defined (not a
/// declaration). Deduplicated and sorted by name for determinism (spec §5).
fn collect_internal_call_targets(module: &Module) -> Vec<FuncId> {
    let mut names: Vec<String> = Vec::new();
    for f in &module.functions {
        for inst in &f.insts {
            if let InstKind::Call {
                callee: Callee::Direct(fid),
                ..
            } = &inst.kind
            {
                let callee = module.function(*fid);
                if !callee.is_declaration && !names.contains(&callee.name) {
                    names.push(callee.name.clone());
                }
            }
        }
    }
    names.sort();
    names
        .into_iter()
        .map(|n| module.func_id_by_name(&n).unwrap())
        .collect()
}

fn build_function_pointer_table(module: &mut Module, targets: &[FuncId]) -> FunctionPointerTable {
    let table_global = module.add_global(GlobalVariable {
        id: GlobalId(0),
        name: "__func_table".to_string(),
        ty: Type::Ptr,
        initializer: Some(GlobalInit::FuncPtrArray(targets.to_vec())),
        linkage: Linkage::Internal,
        is_constant: true,
        comdat: None,
        section: None,
        is_tls_callback_entry: false,
    });
    let index_of = targets
        .iter()
        .enumerate()
        .map(|(i, fid)| (*fid, i))
        .collect();
    FunctionPointerTable {
        table_global: Some(table_global),
        index_of,
    }
}

/// Rewrites every direct call to a tabled function into: load of its table slot, bitcast to the
/// callee's signature (a no-op on this IR's single untyped `Ptr`, kept for structural fidelity to
/// what a typed backend would need here), indirect call with the original arguments.
fn rewrite_internal_call_sites(f: &mut Function, table: &FunctionPointerTable, counters: &mut Counters) {
    let table_global = match table.table_global {
        Some(g) => g,
        None => return,
    };
    let block_ids: Vec<_> = f.blocks.iter().map(|b| b.id).collect();
    for block_id in block_ids {
        let inst_ids = f.block(block_id).insts.clone();
        for inst_id in inst_ids {
            let target = match &f.inst(inst_id).kind {
                InstKind::Call {
                    callee: Callee::Direct(fid),
                    ..
                } => table.index_of.get(fid).copied(),
                _ => None,
            };
            let Some(slot_index) = target else { continue };

            let pos = f
                .block(block_id)
                .insts
                .iter()
                .position(|id| *id == inst_id)
                .expect("instruction must be in its own block");
            let casted = {
                let mut b = Builder::at(f, block_id, InsertPoint::Index(pos));
                let table_addr = b.emit(
                    InstKind::GlobalAddr { global: table_global },
                    Type::Ptr,
                    format!("ict_table_{}", inst_id.0),
                );
                let slot_ptr = b.emit(
                    InstKind::PtrIndex {
                        base: table_addr,
                        index: Value::Const(Constant::Int(Type::I64, slot_index as i64 * PTR_SIZE)),
                    },
                    Type::Ptr,
                    format!("ict_slot_{}", inst_id.0),
                );
                let loaded = b.emit(
                    InstKind::Load {
                        ptr: slot_ptr,
                        ty: Type::Ptr,
                    },
                    Type::Ptr,
                    format!("ict_fp_{}", inst_id.0),
                );
                b.emit(
                    InstKind::Bitcast { value: loaded, ty: Type::Ptr },
                    Type::Ptr,
                    format!("ict_casted_{}", inst_id.0),
                )
            };

            if let InstKind::Call { callee, .. } = &mut f.inst_mut(inst_id).kind {
                *callee = Callee::Indirect(casted);
            }
            counters.indirect_calls += 1;
        }
    }
}

/// Runs the internal-call indirection rewrite over the whole module (spec §4.12 "Internal
/// calls"). Returns the built table, even if empty (no direct calls to hide).
pub fn hide_internal_calls(module: &mut Module, counters: &mut Counters) -> FunctionPointerTable {
    let targets = collect_internal_call_targets(module);
    if targets.is_empty() {
        return FunctionPointerTable::default();
    }
    let table = build_function_pointer_table(module, &targets);
    let fn_names: Vec<String> = module.functions.iter().map(|f| f.name.clone()).collect();
    for name in fn_names {
        let fid = module.func_id_by_name(&name).unwrap();
        let f = module.function_mut(fid);
        rewrite_internal_call_sites(f, &table, counters);
    }
    table
}

// ---------------------------------------------------------------------------------------------
// External calls: import hiding
// ---------------------------------------------------------------------------------------------

/// Scans a null-terminated byte buffer pointed to by its single parameter and returns its
/// FNV-1a-64 hash, matching `fnv1a` above byte for byte (spec §4.12's runtime re-hash, used by
/// the resolver to guard against IAT rewriting).
fn build_api_hash_function() -> Function {
    let mut f = Function::new(API_HASH_FN, Type::I64, vec![Type::Ptr]);
    f.linkage = Linkage::Internal;
    let name_ptr = Value::Param(0);

    let entry = f.push_block("entry");
    let (hash_slot, idx_slot) = {
        let mut b = Builder::at_end(&mut f, entry);
        let hash_slot = b.emit(InstKind::Alloca { ty: Type::I64 }, Type::Ptr, "hash_slot");
        b.emit_void(InstKind::Store {
            ptr: hash_slot.clone(),
            value: Value::Const(Constant::Int(Type::I64, 0xcbf29ce484222325u64 as i64)),
        });
        let idx_slot = b.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, "idx_slot");
        b.emit_void(InstKind::Store {
            ptr: idx_slot.clone(),
            value: Value::Const(Constant::Int(Type::I32, 0)),
        });
        (hash_slot, idx_slot)
    };

    let header = f.push_block("hash_header");
    let body = f.push_block("hash_body");
    let exit = f.push_block("hash_exit");
    f.block_mut(entry).terminator = Terminator::Br { target: header };

    let (idx, byte) = {
        let mut b = Builder::at_end(&mut f, header);
        let idx = b.emit(InstKind::Load { ptr: idx_slot.clone(), ty: Type::I32 }, Type::I32, "idx");
        let ptr = b.emit(InstKind::PtrIndex { base: name_ptr.clone(), index: idx.clone() }, Type::Ptr, "byte_ptr");
        let byte = b.emit(InstKind::Load { ptr, ty: Type::I8 }, Type::I8, "byte");
        (idx, byte)
    };
    let cond = {
        let mut b = Builder::at_end(&mut f, header);
        b.emit(
            InstKind::ICmp { pred: ICmpPred::Ne, lhs: byte.clone(), rhs: Value::Const(Constant::Int(Type::I8, 0)) },
            Type::I1,
            "has_more",
        )
    };
    f.block_mut(header).terminator = Terminator::CondBr { cond, if_true: body, if_false: exit };

    {
        let mut b = Builder::at_end(&mut f, body);
        let byte64 = b.emit(InstKind::Bitcast { value: byte, ty: Type::I64 }, Type::I64, "byte64");
        let hash = b.emit(InstKind::Load { ptr: hash_slot.clone(), ty: Type::I64 }, Type::I64, "hash");
        let xored = b.emit(InstKind::Binary { op: codedefender_ir::BinOp::Xor, lhs: hash, rhs: byte64 }, Type::I64, "xored");
        let mixed = b.emit(
            InstKind::Binary {
                op: codedefender_ir::BinOp::Mul,
                lhs: xored,
                rhs: Value::Const(Constant::Int(Type::I64, 0x100000001b3u64 as i64)),
            },
            Type::I64,
            "mixed",
        );
        b.emit_void(InstKind::Store { ptr: hash_slot.clone(), value: mixed });
        let next_idx = b.emit(
            InstKind::Binary { op: codedefender_ir::BinOp::Add, lhs: idx, rhs: Value::Const(Constant::Int(Type::I32, 1)) },
            Type::I32,
            "next_idx",
        );
        b.emit_void(InstKind::Store { ptr: idx_slot, value: next_idx });
    }
    f.block_mut(body).terminator = Terminator::Br { target: header };

    let result = {
        let mut b = Builder::at_end(&mut f, exit);
        b.emit(InstKind::Load { ptr: hash_slot, ty: Type::I64 }, Type::I64, "final_hash")
    };
    f.block_mut(exit).terminator = Terminator::Ret { value: Some(result) };
    f
}

fn ensure_api_hash_function(module: &mut Module) -> FuncId {
    if let Some(id) = module.func_id_by_name(API_HASH_FN) {
        return id;
    }
    module.add_function(build_api_hash_function())
}

fn ensure_declaration(module: &mut Module, name: &str, ret_ty: Type, param_tys: Vec<Type>) -> FuncId {
    if let Some(id) = module.func_id_by_name(name) {
        return id;
    }
    module.add_function(Function::declaration(name, ret_ty, param_tys))
}

/// `__resolve_api(expectedHash, dllName*, funcName*) -> ptr`: loads the library, resolves the
/// function, recomputes its hash, and returns the pointer only if the hash still matches (spec
/// §4.12's guard against IAT rewriting).
fn build_resolve_api_function(module: &mut Module, api_hash_fid: FuncId) -> Function {
    let load_library = ensure_declaration(module, LOAD_LIBRARY_FN, Type::Ptr, vec![Type::Ptr]);
    let get_proc_address = ensure_declaration(module, GET_PROC_ADDRESS_FN, Type::Ptr, vec![Type::Ptr, Type::Ptr]);

    let mut f = Function::new(RESOLVE_API_FN, Type::Ptr, vec![Type::I64, Type::Ptr, Type::Ptr]);
    f.linkage = Linkage::Internal;
    let expected_hash = Value::Param(0);
    let dll_name = Value::Param(1);
    let func_name = Value::Param(2);

    let entry = f.push_block("entry");
    let (fp, cond) = {
        let mut b = Builder::at_end(&mut f, entry);
        let lib = b.emit(
            InstKind::Call { callee: Callee::Direct(load_library), args: vec![dll_name] },
            Type::Ptr,
            "lib",
        );
        let fp = b.emit(
            InstKind::Call { callee: Callee::Direct(get_proc_address), args: vec![lib, func_name.clone()] },
            Type::Ptr,
            "fp",
        );
        let actual_hash = b.emit(
            InstKind::Call { callee: Callee::Direct(api_hash_fid), args: vec![func_name] },
            Type::I64,
            "actual_hash",
        );
        let cond = b.emit(
            InstKind::ICmp { pred: ICmpPred::Eq, lhs: actual_hash, rhs: expected_hash },
            Type::I1,
            "hash_matches",
        );
        (fp, cond)
    };

    let matched = f.push_block("resolve_api_ok");
    let mismatched = f.push_block("resolve_api_fail");
    f.block_mut(entry).terminator = Terminator::CondBr { cond, if_true: matched, if_false: mismatched };
    f.block_mut(matched).terminator = Terminator::Ret { value: Some(fp) };
    f.block_mut(mismatched).terminator = Terminator::Ret { value: Some(Value::Const(Constant::Null)) };
    f
}

fn ensure_resolve_api_function(module: &mut Module, api_hash_fid: FuncId) -> FuncId {
    if let Some(id) = module.func_id_by_name(RESOLVE_API_FN) {
        return id;
    }
    let f = build_resolve_api_function(module, api_hash_fid);
    module.add_function(f)
}

/// Every declaration-only function directly called anywhere, excluding the runtime allowlist,
/// sorted by name for determinism.
fn collect_hidden_externals(module: &Module) -> Vec<FuncId> {
    let mut names: Vec<String> = Vec::new();
    for f in &module.functions {
        for inst in &f.insts {
            if let InstKind::Call {
                callee: Callee::Direct(fid),
                ..
            } = &inst.kind
            {
                let callee = module.function(*fid);
                if callee.is_declaration
                    && !IMPORT_ALLOWLIST.contains(&callee.name.as_str())
                    && !names.contains(&callee.name)
                {
                    names.push(callee.name.clone());
                }
            }
        }
    }
    names.sort();
    names
        .into_iter()
        .map(|n| module.func_id_by_name(&n).unwrap())
        .collect()
}

/// The cache slot plus the two supporting string globals, kept together only for the duration of
/// call-site rewriting (the public `ApiResolutionCacheSlot` record doesn't need the string
/// globals once rewriting is done; their addresses are baked into the emitted IR).
struct HidingSite {
    slot: ApiResolutionCacheSlot,
    dll_name_global: GlobalId,
    func_name_global: GlobalId,
}

fn build_cache_slot(module: &mut Module, fid: FuncId) -> HidingSite {
    let name = module.function(fid).name.clone();
    let hash = fnv1a(name.as_bytes());
    let dll = dll_name_for(&name);

    let cache_global = module.add_global(GlobalVariable {
        id: GlobalId(0),
        name: format!("__cache_{name}"),
        ty: Type::Ptr,
        initializer: Some(GlobalInit::Zero),
        linkage: Linkage::Internal,
        is_constant: false,
        comdat: None,
        section: None,
        is_tls_callback_entry: false,
    });
    let hash_global = module.add_global(GlobalVariable {
        id: GlobalId(0),
        name: format!("__apihash_{name}"),
        ty: Type::I64,
        initializer: Some(GlobalInit::Int(hash as i64)),
        linkage: Linkage::Internal,
        is_constant: true,
        comdat: None,
        section: None,
        is_tls_callback_entry: false,
    });
    let dll_name_global = add_bytes_global(module, format!("__dllname_{name}"), dll.as_bytes().to_vec());
    let func_name_global = add_bytes_global(module, format!("__funcname_{name}"), name.as_bytes().to_vec());

    HidingSite {
        slot: ApiResolutionCacheSlot {
            func: fid,
            cache_global,
            hash_global,
            name_hash: hash,
            dll_name: dll,
        },
        dll_name_global,
        func_name_global,
    }
}

/// Splits `block_id` at `pos`, moving everything from `pos` onward (including the terminator)
/// into a fresh block; `block_id` is left with no terminator, which the caller must assign. PHI
/// incoming edges among the old successors are repointed to the new tail block.
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

/// Rewrites one call site to `site.slot.func` into: check cache, resolve-and-populate on miss,
/// call through the (now-populated) cache pointer (spec §4.12's per-call-site sequence).
fn rewrite_external_call_site(
    f: &mut Function,
    block_id: BlockId,
    inst_id: InstId,
    site: &HidingSite,
    resolve_api_fid: FuncId,
) {
    let pos = f
        .block(block_id)
        .insts
        .iter()
        .position(|id| *id == inst_id)
        .expect("instruction must be in its own block");

    // Everything from the call onward (inclusive) moves into `call_api`; `block_id` keeps the
    // head and gains the cache-check/resolve scaffolding below.
    let call_api = split_block_at(f, block_id, pos, "call_api");
    let resolve = f.push_block("resolve_api");

    let (cache_ptr, is_null) = {
        let mut b = Builder::at_end(f, block_id);
        let cache_ptr = b.emit(
            InstKind::GlobalAddr { global: site.slot.cache_global },
            Type::Ptr,
            format!("ih_cache_{}", inst_id.0),
        );
        let cached = b.emit(
            InstKind::Load { ptr: cache_ptr.clone(), ty: Type::Ptr },
            Type::Ptr,
            format!("ih_cached_{}", inst_id.0),
        );
        let is_null = b.emit(
            InstKind::ICmp { pred: ICmpPred::Eq, lhs: cached, rhs: Value::Const(Constant::Null) },
            Type::I1,
            format!("ih_needs_resolve_{}", inst_id.0),
        );
        (cache_ptr, is_null)
    };
    f.block_mut(block_id).terminator = Terminator::CondBr {
        cond: is_null,
        if_true: resolve,
        if_false: call_api,
    };

    {
        let mut b = Builder::at_end(f, resolve);
        let dll_addr = b.emit(
            InstKind::GlobalAddr { global: site.dll_name_global },
            Type::Ptr,
            format!("ih_dllname_{}", inst_id.0),
        );
        let func_addr = b.emit(
            InstKind::GlobalAddr { global: site.func_name_global },
            Type::Ptr,
            format!("ih_funcname_{}", inst_id.0),
        );
        let resolved = b.emit(
            InstKind::Call {
                callee: Callee::Direct(resolve_api_fid),
                args: vec![
                    Value::Const(Constant::Int(Type::I64, site.slot.name_hash as i64)),
                    dll_addr,
                    func_addr,
                ],
            },
            Type::Ptr,
            format!("ih_resolved_{}", inst_id.0),
        );
        b.emit_void(InstKind::Store { ptr: cache_ptr.clone(), value: resolved });
    }
    f.block_mut(resolve).terminator = Terminator::Br { target: call_api };

    // `call_api` reloads the cache pointer (valid on both incoming edges, since `cache_ptr`'s
    // address computation dominates it) and bitcasts it before the original call.
    let casted = {
        let mut b = Builder::at(f, call_api, InsertPoint::Index(0));
        let fn_ptr = b.emit(
            InstKind::Load { ptr: cache_ptr, ty: Type::Ptr },
            Type::Ptr,
            format!("ih_fp_{}", inst_id.0),
        );
        b.emit(
            InstKind::Bitcast { value: fn_ptr, ty: Type::Ptr },
            Type::Ptr,
            format!("ih_casted_{}", inst_id.0),
        )
    };
    if let InstKind::Call { callee, .. } = &mut f.inst_mut(inst_id).kind {
        *callee = Callee::Indirect(casted);
    }
}

/// Runs the import-hiding rewrite over the whole module (spec §4.12 "External calls"). Idempotent
/// per external function: once a function's calls go through `Callee::Indirect`, they no longer
/// match `collect_hidden_externals`'s direct-call scan.
pub fn hide_imports(module: &mut Module, counters: &mut Counters) -> Vec<ApiResolutionCacheSlot> {
    let hidden = collect_hidden_externals(module);
    if hidden.is_empty() {
        return Vec::new();
    }
    let api_hash_fid = ensure_api_hash_function(module);
    let resolve_api_fid = ensure_resolve_api_function(module, api_hash_fid);

    let mut slots = Vec::new();
    for fid in hidden {
        let site = build_cache_slot(module, fid);

        loop {
            let found = module.functions.iter().enumerate().find_map(|(fi, f)| {
                if f.name == RESOLVE_API_FN || f.name == API_HASH_FN {
                    return None;
                }
                f.blocks.iter().find_map(|b| {
                    b.insts.iter().find_map(|id| {
                        if matches!(
                            &f.inst(*id).kind,
                            InstKind::Call { callee: Callee::Direct(callee_fid), .. } if *callee_fid == fid
                        ) {
                            Some((fi, b.id, *id))
                        } else {
                            None
                        }
                    })
                })
            });
            let Some((fi, block_id, id)) = found else { break };
            let f = &mut module.functions[fi];
            rewrite_external_call_site(f, block_id, id, &site, resolve_api_fid);
            counters.imports_hidden += 1;
        }

        slots.push(site.slot);
    }
    for f in &mut module.functions {
        f.recompute_preds();
    }
    slots
}

/// Top-level C12 entry point. Returns the function-pointer table and the resolved-import cache
/// slots, both consumed by C17's report and kept alive as long as the module (spec §3).
pub fn run(module: &mut Module, counters: &mut Counters) -> (FunctionPointerTable, Vec<ApiResolutionCacheSlot>) {
    let table = hide_internal_calls(module, counters);
    let slots = hide_imports(module, counters);
    (table, slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::types::Type;

    fn module_with_internal_calls() -> Module {
        let mut module = Module::new("m");
        let mut callee = Function::new("helper", Type::I32, vec![]);
        let entry = callee.push_block("entry");
        callee.block_mut(entry).terminator = Terminator::Ret {
            value: Some(Value::Const(Constant::Int(Type::I32, 7))),
        };
        let callee_fid = module.add_function(callee);

        let mut caller = Function::new("main", Type::I32, vec![]);
        let entry = caller.push_block("entry");
        let mut b = Builder::at_start(&mut caller, entry);
        let v = b.emit(
            InstKind::Call { callee: Callee::Direct(callee_fid), args: vec![] },
            Type::I32,
            "v",
        );
        caller.block_mut(entry).terminator = Terminator::Ret { value: Some(v) };
        module.add_function(caller);
        module
    }

    #[test]
    fn hides_internal_calls_and_verifies() {
        let mut module = module_with_internal_calls();
        let mut counters = Counters::default();
        let table = hide_internal_calls(&mut module, &mut counters);
        assert_eq!(table.index_of.len(), 1);
        assert_eq!(counters.indirect_calls, 1);

        let main = module.function(module.func_id_by_name("main").unwrap());
        let has_indirect = main
            .insts
            .iter()
            .any(|i| matches!(&i.kind, InstKind::Call { callee: Callee::Indirect(_), .. }));
        assert!(has_indirect);
        assert!(codedefender_ir::verify_module(&module).is_ok());
    }

    fn module_with_hidden_import() -> Module {
        let mut module = Module::new("m");
        let decl = Function::declaration("CreateFileW", Type::Ptr, vec![Type::Ptr]);
        let decl_fid = module.add_function(decl);

        let mut caller = Function::new("opens_file", Type::Ptr, vec![Type::Ptr]);
        let entry = caller.push_block("entry");
        let mut b = Builder::at_start(&mut caller, entry);
        let v = b.emit(
            InstKind::Call { callee: Callee::Direct(decl_fid), args: vec![Value::Param(0)] },
            Type::Ptr,
            "v",
        );
        caller.block_mut(entry).terminator = Terminator::Ret { value: Some(v) };
        module.add_function(caller);
        module
    }

    #[test]
    fn hides_imports_and_verifies() {
        let mut module = module_with_hidden_import();
        let mut counters = Counters::default();
        let slots = hide_imports(&mut module, &mut counters);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].dll_name, "kernel32.dll");
        assert_eq!(counters.imports_hidden, 1);
        assert!(codedefender_ir::verify_module(&module).is_ok());
    }

    #[test]
    fn allowlisted_imports_are_left_alone() {
        let mut module = Module::new("m");
        let decl = Function::declaration("printf", Type::I32, vec![Type::Ptr]);
        let decl_fid = module.add_function(decl);
        let mut caller = Function::new("logs", Type::Void, vec![Type::Ptr]);
        let entry = caller.push_block("entry");
        let mut b = Builder::at_start(&mut caller, entry);
        b.emit_void(InstKind::Call { callee: Callee::Direct(decl_fid), args: vec![Value::Param(0)] });
        caller.block_mut(entry).terminator = Terminator::Ret { value: None };
        module.add_function(caller);

        let mut counters = Counters::default();
        let slots = hide_imports(&mut module, &mut counters);
        assert!(slots.is_empty());
        assert_eq!(counters.imports_hidden, 0);
    }
}
