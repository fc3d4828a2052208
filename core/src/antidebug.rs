//! C13 — Anti-Debug Injector (spec §4.13). Synthesizes `__check_debugger`, wires it into every
//! guarded function's entry and return sites, and (Windows only) registers a TLS callback that
//! runs the same check on process attach.

use codedefender_ir::block::Terminator;
use codedefender_ir::builder::Builder;
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BinOp, BlockId, FuncId, ICmpPred, Value};
use codedefender_ir::{Callee, Function, GlobalInit, GlobalVariable, InstKind, Linkage, Module};

use crate::model::Counters;

const CHECK_DEBUGGER_FN: &str = "__check_debugger";
const TLS_CALLBACK_FN: &str = "__tls_antidebug_callback";
const TLS_CALLBACK_ARRAY: &str = "__tls_callback_array";
const EXIT_FN: &str = "exit";
const DEBUGGER_EXIT_CODE: i64 = 0xDEAD;
const DLL_PROCESS_ATTACH: i64 = 1;

/// Gates TLS-callback-section placement (spec §6, §9: a Windows-only mechanism). POSIX builds
/// get only the single `ptrace` probe and skip the callback entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Posix,
}

fn ensure_declaration(module: &mut Module, name: &str, ret_ty: Type, param_tys: Vec<Type>) -> FuncId {
    if let Some(id) = module.func_id_by_name(name) {
        return id;
    }
    module.add_function(Function::declaration(name, ret_ty, param_tys))
}

fn add_bytes_global(module: &mut Module, name: String, mut bytes: Vec<u8>) -> codedefender_ir::GlobalId {
    bytes.push(0);
    module.add_global(GlobalVariable {
        id: codedefender_ir::GlobalId(0),
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

pub fn is_main_like(name: &str) -> bool {
    matches!(name, "main" | "WinMain" | "wWinMain" | "DllMain")
}

fn nonzero(b: &mut Builder<'_>, v: Value, ty: &Type, tag: &str) -> Value {
    b.emit(
        InstKind::ICmp { pred: ICmpPred::Ne, lhs: v, rhs: Value::Const(ty.zero_constant()) },
        Type::I1,
        tag.to_string(),
    )
}

fn or_in(b: &mut Builder<'_>, acc: Value, cond: Value, tag: &str) -> Value {
    b.emit(InstKind::Binary { op: BinOp::Or, lhs: acc, rhs: cond }, Type::I1, tag.to_string())
}

/// OR-combines the eight probes named in spec §4.13. Built directly into `b`'s current block.
fn emit_windows_probes(module: &mut Module, b: &mut Builder<'_>, tag: &str) -> Value {
    let is_debugger_present = ensure_declaration(module, "IsDebuggerPresent", Type::I32, vec![]);
    let get_current_process = ensure_declaration(module, "GetCurrentProcess", Type::Ptr, vec![]);
    let check_remote = ensure_declaration(module, "CheckRemoteDebuggerPresent", Type::I32, vec![Type::Ptr, Type::Ptr]);
    let nt_query = ensure_declaration(
        module,
        "NtQueryInformationProcess",
        Type::I32,
        vec![Type::Ptr, Type::I32, Type::Ptr, Type::I32, Type::Ptr],
    );
    let get_module_handle = ensure_declaration(module, "GetModuleHandleA", Type::Ptr, vec![Type::Ptr]);
    let read_gs_qword = ensure_declaration(module, "__readgsqword", Type::I64, vec![Type::I64]);
    let rdtsc = ensure_declaration(module, "__rdtsc", Type::I64, vec![]);
    let get_current_thread = ensure_declaration(module, "GetCurrentThread", Type::Ptr, vec![]);
    let get_thread_context = ensure_declaration(module, "GetThreadContext", Type::I32, vec![Type::Ptr, Type::Ptr]);

    // Probe 1: IsDebuggerPresent() != 0
    let p1 = {
        let r = b.emit(InstKind::Call { callee: Callee::Direct(is_debugger_present), args: vec![] }, Type::I32, format!("{tag}_idp"));
        nonzero(b, r, &Type::I32, &format!("{tag}_idp_flag"))
    };

    // Probe 2: CheckRemoteDebuggerPresent(GetCurrentProcess(), &present) observed true
    let p2 = {
        let proc = b.emit(InstKind::Call { callee: Callee::Direct(get_current_process), args: vec![] }, Type::Ptr, format!("{tag}_proc"));
        let present_slot = b.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, format!("{tag}_present_slot"));
        b.emit_void(InstKind::Store { ptr: present_slot.clone(), value: Value::Const(Constant::Int(Type::I32, 0)) });
        b.emit_void(InstKind::Call { callee: Callee::Direct(check_remote), args: vec![proc, present_slot.clone()] });
        let present = b.emit(InstKind::Load { ptr: present_slot, ty: Type::I32 }, Type::I32, format!("{tag}_present"));
        nonzero(b, present, &Type::I32, &format!("{tag}_crdp_flag"))
    };

    // Probe 3: NtQueryInformationProcess(self, ProcessDebugPort=7, &port, 8, null); port != 0
    let p3 = {
        let proc = b.emit(InstKind::Call { callee: Callee::Direct(get_current_process), args: vec![] }, Type::Ptr, format!("{tag}_proc3"));
        let port_slot = b.emit(InstKind::Alloca { ty: Type::I64 }, Type::Ptr, format!("{tag}_port_slot"));
        b.emit_void(InstKind::Store { ptr: port_slot.clone(), value: Value::Const(Constant::Int(Type::I64, 0)) });
        b.emit_void(InstKind::Call {
            callee: Callee::Direct(nt_query),
            args: vec![
                proc,
                Value::Const(Constant::Int(Type::I32, 7)),
                port_slot.clone(),
                Value::Const(Constant::Int(Type::I32, 8)),
                Value::Const(Constant::Null),
            ],
        });
        let port = b.emit(InstKind::Load { ptr: port_slot, ty: Type::I64 }, Type::I64, format!("{tag}_port"));
        nonzero(b, port, &Type::I64, &format!("{tag}_port_flag"))
    };

    // Probe 4: any well-known debugger process module loaded into this process.
    let p4 = {
        let ollydbg = add_bytes_global(module, format!("__adstr_ollydbg_{tag}"), b"ollydbg.exe".to_vec());
        let x64dbg = add_bytes_global(module, format!("__adstr_x64dbg_{tag}"), b"x64dbg.exe".to_vec());
        let n1 = b.emit(InstKind::GlobalAddr { global: ollydbg }, Type::Ptr, format!("{tag}_ollyname"));
        let h1 = b.emit(InstKind::Call { callee: Callee::Direct(get_module_handle), args: vec![n1] }, Type::Ptr, format!("{tag}_ollyh"));
        let f1 = nonzero(b, h1, &Type::Ptr, &format!("{tag}_ollyflag"));
        let n2 = b.emit(InstKind::GlobalAddr { global: x64dbg }, Type::Ptr, format!("{tag}_x64name"));
        let h2 = b.emit(InstKind::Call { callee: Callee::Direct(get_module_handle), args: vec![n2] }, Type::Ptr, format!("{tag}_x64h"));
        let f2 = nonzero(b, h2, &Type::Ptr, &format!("{tag}_x64flag"));
        or_in(b, f1, f2, &format!("{tag}_modscan_flag"))
    };

    // Probe 5: RDTSC-bracketed timing, suspicious if the delta exceeds ~10^7 cycles.
    let p5 = {
        let t0 = b.emit(InstKind::Call { callee: Callee::Direct(rdtsc), args: vec![] }, Type::I64, format!("{tag}_t0"));
        let t1 = b.emit(InstKind::Call { callee: Callee::Direct(rdtsc), args: vec![] }, Type::I64, format!("{tag}_t1"));
        let delta = b.emit(InstKind::Binary { op: BinOp::Sub, lhs: t1, rhs: t0 }, Type::I64, format!("{tag}_delta"));
        b.emit(
            InstKind::ICmp { pred: ICmpPred::Sgt, lhs: delta, rhs: Value::Const(Constant::Int(Type::I64, 10_000_000)) },
            Type::I1,
            format!("{tag}_timing_flag"),
        )
    };

    // Probe 6: hardware breakpoint registers Dr0..Dr3 in the current thread's CONTEXT.
    let p6 = {
        let thread = b.emit(InstKind::Call { callee: Callee::Direct(get_current_thread), args: vec![] }, Type::Ptr, format!("{tag}_thread"));
        let ctx = b.emit(InstKind::Alloca { ty: Type::ByteArray(256) }, Type::Ptr, format!("{tag}_ctx"));
        b.emit_void(InstKind::Call { callee: Callee::Direct(get_thread_context), args: vec![thread, ctx.clone()] });
        let mut acc = None;
        for (i, offset) in [0x48i64, 0x50, 0x58, 0x60].into_iter().enumerate() {
            let ptr = b.emit(
                InstKind::PtrIndex { base: ctx.clone(), index: Value::Const(Constant::Int(Type::I64, offset)) },
                Type::Ptr,
                format!("{tag}_dr{i}_ptr"),
            );
            let v = b.emit(InstKind::Load { ptr, ty: Type::I64 }, Type::I64, format!("{tag}_dr{i}"));
            let flag = nonzero(b, v, &Type::I64, &format!("{tag}_dr{i}_flag"));
            acc = Some(match acc {
                None => flag,
                Some(prev) => or_in(b, prev, flag, &format!("{tag}_dr_acc_{i}")),
            });
        }
        acc.unwrap()
    };

    // Probes 7-8: PEB fields reached via the GS-segment self pointer at offset 0x60.
    let peb = {
        let raw = b.emit(
            InstKind::Call { callee: Callee::Direct(read_gs_qword), args: vec![Value::Const(Constant::Int(Type::I64, 0x60))] },
            Type::I64,
            format!("{tag}_peb_raw"),
        );
        b.emit(InstKind::Bitcast { value: raw, ty: Type::Ptr }, Type::Ptr, format!("{tag}_peb"))
    };
    let p7 = {
        let ptr = b.emit(
            InstKind::PtrIndex { base: peb.clone(), index: Value::Const(Constant::Int(Type::I64, 0x68)) },
            Type::Ptr,
            format!("{tag}_ntgf_ptr"),
        );
        let flags = b.emit(InstKind::Load { ptr, ty: Type::I32 }, Type::I32, format!("{tag}_ntgf"));
        let masked = b.emit(
            InstKind::Binary { op: BinOp::And, lhs: flags, rhs: Value::Const(Constant::Int(Type::I32, 0x70)) },
            Type::I32,
            format!("{tag}_ntgf_masked"),
        );
        nonzero(b, masked, &Type::I32, &format!("{tag}_ntgf_flag"))
    };
    let p8 = {
        let ptr = b.emit(
            InstKind::PtrIndex { base: peb, index: Value::Const(Constant::Int(Type::I64, 0x2)) },
            Type::Ptr,
            format!("{tag}_bd_ptr"),
        );
        let v = b.emit(InstKind::Load { ptr, ty: Type::I8 }, Type::I8, format!("{tag}_bd"));
        nonzero(b, v, &Type::I8, &format!("{tag}_bd_flag"))
    };

    let acc = or_in(b, p1, p2, &format!("{tag}_acc1"));
    let acc = or_in(b, acc, p3, &format!("{tag}_acc2"));
    let acc = or_in(b, acc, p4, &format!("{tag}_acc3"));
    let acc = or_in(b, acc, p5, &format!("{tag}_acc4"));
    let acc = or_in(b, acc, p6, &format!("{tag}_acc5"));
    let acc = or_in(b, acc, p7, &format!("{tag}_acc6"));
    or_in(b, acc, p8, &format!("{tag}_acc7"))
}

fn emit_posix_probe(module: &mut Module, b: &mut Builder<'_>, tag: &str) -> Value {
    let ptrace = ensure_declaration(module, "ptrace", Type::I64, vec![Type::I32, Type::I32, Type::Ptr, Type::Ptr]);
    let r = b.emit(
        InstKind::Call {
            callee: Callee::Direct(ptrace),
            args: vec![
                Value::Const(Constant::Int(Type::I32, 0)),
                Value::Const(Constant::Int(Type::I32, 0)),
                Value::Const(Constant::Null),
                Value::Const(Constant::Null),
            ],
        },
        Type::I64,
        format!("{tag}_ptrace"),
    );
    b.emit(
        InstKind::ICmp { pred: ICmpPred::Eq, lhs: r, rhs: Value::Const(Constant::Int(Type::I64, -1)) },
        Type::I1,
        format!("{tag}_ptrace_flag"),
    )
}

fn build_check_debugger_function(module: &mut Module, platform: Platform) -> Function {
    let mut f = Function::new(CHECK_DEBUGGER_FN, Type::I32, vec![]);
    f.linkage = Linkage::Internal;
    let entry = f.push_block("entry");
    let result = {
        let mut b = Builder::at_end(&mut f, entry);
        let fired = match platform {
            Platform::Windows => emit_windows_probes(module, &mut b, "adprobe"),
            Platform::Posix => emit_posix_probe(module, &mut b, "adprobe"),
        };
        b.emit(
            InstKind::Select {
                cond: fired,
                if_true: Value::Const(Constant::Int(Type::I32, 1)),
                if_false: Value::Const(Constant::Int(Type::I32, 0)),
            },
            Type::I32,
            "check_result",
        )
    };
    f.block_mut(entry).terminator = Terminator::Ret { value: Some(result) };
    f
}

fn ensure_check_debugger_function(module: &mut Module, platform: Platform) -> FuncId {
    if let Some(id) = module.func_id_by_name(CHECK_DEBUGGER_FN) {
        return id;
    }
    let f = build_check_debugger_function(module, platform);
    module.add_function(f)
}

/// Splits `block_id` at `pos`; the tail (instructions from `pos` onward, plus the original
/// terminator) becomes a fresh block. PHI incoming edges in old successors are repointed.
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

/// Wraps the split point at `block_id`/`pos` with a debugger check: call `check_fid`, and on a
/// nonzero result branch to a fresh `debugger_detected_*` block that calls `exit` and is
/// otherwise unreachable; branch to the tail (the original content) otherwise.
fn wrap_with_check(f: &mut Function, block_id: BlockId, pos: usize, check_fid: FuncId, exit_fid: FuncId, tag: u32) {
    let tail = split_block_at(f, block_id, pos, &format!("ad_continue_{tag}"));
    let detected = f.push_block(format!("debugger_detected_{tag}"));

    let cond = {
        let mut b = Builder::at_end(f, block_id);
        let r = b.emit(InstKind::Call { callee: Callee::Direct(check_fid), args: vec![] }, Type::I32, format!("ad_check_{tag}"));
        nonzero(&mut b, r, &Type::I32, &format!("ad_hit_{tag}"))
    };
    f.block_mut(block_id).terminator = Terminator::CondBr { cond, if_true: detected, if_false: tail };

    {
        let mut b = Builder::at_end(f, detected);
        b.emit_void(InstKind::Call {
            callee: Callee::Direct(exit_fid),
            args: vec![Value::Const(Constant::Int(Type::I32, DEBUGGER_EXIT_CODE))],
        });
    }
    f.block_mut(detected).terminator = Terminator::Unreachable;
}

/// Injects a debugger check at `f`'s entry and at every return site (spec §4.13). Idempotent
/// across repeated calls is the orchestrator's responsibility (run on cycle 1 only).
pub fn inject(f: &mut Function, check_fid: FuncId, exit_fid: FuncId, counters: &mut Counters) {
    let entry = f.entry();
    let tag = f.fresh_id();
    wrap_with_check(f, entry, 0, check_fid, exit_fid, tag);
    counters.anti_debug_insertion_points += 1;

    let return_blocks: Vec<BlockId> = f
        .blocks
        .iter()
        .filter(|b| matches!(b.terminator, Terminator::Ret { .. }))
        .map(|b| b.id)
        .collect();
    for block_id in return_blocks {
        let pos = f.block(block_id).insts.len();
        let tag = f.fresh_id();
        wrap_with_check(f, block_id, pos, check_fid, exit_fid, tag);
    }
    f.recompute_preds();
}

fn build_tls_callback_function(check_fid: FuncId, exit_fid: FuncId) -> Function {
    let mut f = Function::new(TLS_CALLBACK_FN, Type::Void, vec![Type::Ptr, Type::I32, Type::Ptr]);
    f.linkage = Linkage::Internal;
    let reason = Value::Param(1);

    let entry = f.push_block("entry");
    let check_block = f.push_block("tls_check");
    let detected = f.push_block("debugger_detected_tls");
    let skip = f.push_block("tls_skip");

    let is_attach = {
        let mut b = Builder::at_end(&mut f, entry);
        b.emit(
            InstKind::ICmp { pred: ICmpPred::Eq, lhs: reason, rhs: Value::Const(Constant::Int(Type::I32, DLL_PROCESS_ATTACH)) },
            Type::I1,
            "is_attach",
        )
    };
    f.block_mut(entry).terminator = Terminator::CondBr { cond: is_attach, if_true: check_block, if_false: skip };

    let hit = {
        let mut b = Builder::at_end(&mut f, check_block);
        let r = b.emit(InstKind::Call { callee: Callee::Direct(check_fid), args: vec![] }, Type::I32, "tls_check_result");
        nonzero(&mut b, r, &Type::I32, "tls_hit")
    };
    f.block_mut(check_block).terminator = Terminator::CondBr { cond: hit, if_true: detected, if_false: skip };

    {
        let mut b = Builder::at_end(&mut f, detected);
        b.emit_void(InstKind::Call {
            callee: Callee::Direct(exit_fid),
            args: vec![Value::Const(Constant::Int(Type::I32, DEBUGGER_EXIT_CODE))],
        });
    }
    f.block_mut(detected).terminator = Terminator::Unreachable;
    f.block_mut(skip).terminator = Terminator::Ret { value: None };
    f
}

/// Registers the TLS-attach callback in the platform's TLS-callback section (`.CRT$XLB` on
/// Windows). Idempotent: does nothing if the array already exists.
fn ensure_tls_callback(module: &mut Module, check_fid: FuncId, exit_fid: FuncId) {
    if module.func_id_by_name(TLS_CALLBACK_FN).is_some() {
        return;
    }
    let callback = build_tls_callback_function(check_fid, exit_fid);
    let callback_fid = module.add_function(callback);
    module.add_global(GlobalVariable {
        id: codedefender_ir::GlobalId(0),
        name: TLS_CALLBACK_ARRAY.to_string(),
        ty: Type::Ptr,
        initializer: Some(GlobalInit::FuncPtrArray(vec![callback_fid])),
        linkage: Linkage::Internal,
        is_constant: true,
        comdat: None,
        section: Some(".CRT$XLB".to_string()),
        is_tls_callback_entry: true,
    });
}

/// Top-level C13 entry point: builds `__check_debugger`, injects entry/return-site checks into
/// every target function, and (Windows only) registers the TLS callback. Run once, on cycle 1.
pub fn run(module: &mut Module, target_functions: &[FuncId], platform: Platform, counters: &mut Counters) {
    let check_fid = ensure_check_debugger_function(module, platform);
    let exit_fid = ensure_declaration(module, EXIT_FN, Type::Void, vec![Type::I32]);

    for &fid in target_functions {
        let f = module.function_mut(fid);
        inject(f, check_fid, exit_fid, counters);
    }

    if platform == Platform::Windows {
        ensure_tls_callback(module, check_fid, exit_fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::types::Type;

    fn trivial_fn(name: &str) -> Function {
        let mut f = Function::new(name, Type::I32, vec![]);
        let entry = f.push_block("entry");
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(Value::Const(Constant::Int(Type::I32, 0))) };
        f
    }

    #[test]
    fn injects_entry_and_return_checks_and_verifies() {
        let mut module = Module::new("m");
        let fid = module.add_function(trivial_fn("main"));
        let mut counters = Counters::default();
        run(&mut module, &[fid], Platform::Windows, &mut counters);

        assert_eq!(counters.anti_debug_insertion_points, 1);
        let f = module.function(fid);
        assert!(f.blocks.iter().any(|b| b.name.starts_with("debugger_detected_")));
        assert!(codedefender_ir::verify_module(&module).is_ok());
        assert!(module.func_id_by_name(TLS_CALLBACK_FN).is_some());
        assert!(module.globals.iter().any(|g| g.name == TLS_CALLBACK_ARRAY && g.is_tls_callback_entry));
    }

    #[test]
    fn posix_uses_single_ptrace_probe() {
        let mut module = Module::new("m");
        let fid = module.add_function(trivial_fn("main"));
        let mut counters = Counters::default();
        run(&mut module, &[fid], Platform::Posix, &mut counters);
        assert!(module.func_id_by_name("ptrace").is_some());
        assert!(module.func_id_by_name("IsDebuggerPresent").is_none());
        assert!(module.func_id_by_name(TLS_CALLBACK_FN).is_none());
        assert!(codedefender_ir::verify_module(&module).is_ok());
    }
}
