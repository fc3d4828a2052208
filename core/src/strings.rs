//! C11 — String Cipher (spec §4.11), the hardest module-scoped pass: encrypts every
//! null-terminated byte-sequence global in place, then synthesizes either a lazy per-string
//! decryptor stub or a module startup constructor to undo it at runtime.

use codedefender_config::StringCipher;
use codedefender_ir::block::Terminator;
use codedefender_ir::builder::Builder;
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BinOp, BlockId, FuncId, GlobalId, ICmpPred, Value};
use codedefender_ir::{Function, GlobalInit, GlobalVariable, InstKind, Linkage, Module};

use crate::crypto;
use crate::model::{Counters, EncryptedStringRecord};
use crate::rng::{module_fingerprint, Prng};

const RC4_DECRYPT_FN: &str = "__rc4_decrypt";
const RC4_KEY_LEN: usize = 16;

/// Every constant global whose initializer is a null-terminated byte sequence (spec §4.11).
pub fn identify_candidates(module: &Module) -> Vec<GlobalId> {
    module
        .globals
        .iter()
        .filter(|g| g.is_constant && matches!(g.string_bytes(), Some(b) if b.last() == Some(&0)))
        .map(|g| g.id)
        .collect()
}

/// A loop over `0..bound` driven by a stack-allocated `i32` counter. Returns the header/body/exit
/// blocks and the index value as loaded at the top of `header` — valid for direct use inside
/// `body` since `header` is `body`'s sole predecessor and so dominates it.
struct CounterLoop {
    header: BlockId,
    body: BlockId,
    exit: BlockId,
    slot: Value,
    index: Value,
}

fn open_counter_loop(f: &mut Function, pred_block: BlockId, prefix: &str, bound: Value) -> CounterLoop {
    let slot = {
        let mut b = Builder::at_end(f, pred_block);
        let slot = b.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, format!("{prefix}_idx_slot"));
        b.emit_void(InstKind::Store {
            ptr: slot.clone(),
            value: Value::Const(Constant::Int(Type::I32, 0)),
        });
        slot
    };
    let header = f.push_block(format!("{prefix}_header"));
    let body = f.push_block(format!("{prefix}_body"));
    let exit = f.push_block(format!("{prefix}_exit"));
    f.block_mut(pred_block).terminator = Terminator::Br { target: header };

    let index = {
        let mut b = Builder::at_end(f, header);
        b.emit(
            InstKind::Load {
                ptr: slot.clone(),
                ty: Type::I32,
            },
            Type::I32,
            format!("{prefix}_i"),
        )
    };
    let cond = {
        let mut b = Builder::at_end(f, header);
        b.emit(
            InstKind::ICmp {
                pred: ICmpPred::Slt,
                lhs: index.clone(),
                rhs: bound,
            },
            Type::I1,
            format!("{prefix}_cond"),
        )
    };
    f.block_mut(header).terminator = Terminator::CondBr {
        cond,
        if_true: body,
        if_false: exit,
    };
    CounterLoop {
        header,
        body,
        exit,
        slot,
        index,
    }
}

fn close_counter_loop(f: &mut Function, loop_: &CounterLoop) {
    let mut b = Builder::at_end(f, loop_.body);
    let next = b.emit(
        InstKind::Binary {
            op: BinOp::Add,
            lhs: loop_.index.clone(),
            rhs: Value::Const(Constant::Int(Type::I32, 1)),
        },
        Type::I32,
        "idx_next",
    );
    b.emit_void(InstKind::Store {
        ptr: loop_.slot.clone(),
        value: next,
    });
    drop(b);
    f.block_mut(loop_.body).terminator = Terminator::Br { target: loop_.header };
}

fn load_byte(b: &mut Builder<'_>, arr: Value, idx: Value, name: &str) -> Value {
    let ptr = b.emit(
        InstKind::PtrIndex {
            base: arr,
            index: idx,
        },
        Type::Ptr,
        format!("{name}_ptr"),
    );
    b.emit(InstKind::Load { ptr, ty: Type::I8 }, Type::I8, name)
}

fn store_byte(b: &mut Builder<'_>, arr: Value, idx: Value, value: Value, name: &str) {
    let ptr = b.emit(
        InstKind::PtrIndex {
            base: arr,
            index: idx,
        },
        Type::Ptr,
        format!("{name}_ptr"),
    );
    b.emit_void(InstKind::Store { ptr, value });
}

fn urem256(b: &mut Builder<'_>, v: Value, name: &str) -> Value {
    b.emit(
        InstKind::Binary {
            op: BinOp::URem,
            lhs: v,
            rhs: Value::Const(Constant::Int(Type::I32, 256)),
        },
        Type::I32,
        name,
    )
}

fn swap_bytes(b: &mut Builder<'_>, arr: Value, idx_a: Value, idx_b: Value, tag: &str) {
    let va = load_byte(b, arr.clone(), idx_a.clone(), &format!("{tag}_va"));
    let vb = load_byte(b, arr.clone(), idx_b.clone(), &format!("{tag}_vb"));
    store_byte(b, arr.clone(), idx_a, vb, &format!("{tag}_sa"));
    store_byte(b, arr, idx_b, va, &format!("{tag}_sb"));
}

/// Builds `__rc4_decrypt(data: ptr, len: i32, key: ptr, key_len: i32)`: textbook RC4 KSA then
/// PRGA over a 256-byte state array allocated on its own stack frame (spec §4.11 step/"Startup
/// constructor mode").
fn build_rc4_decrypt_function() -> Function {
    let mut f = Function::new(RC4_DECRYPT_FN, Type::Void, vec![Type::Ptr, Type::I32, Type::Ptr, Type::I32]);
    f.linkage = Linkage::Internal;
    let data = Value::Param(0);
    let len = Value::Param(1);
    let key = Value::Param(2);
    let key_len = Value::Param(3);

    let entry = f.push_block("entry");
    let s_slot = {
        let mut b = Builder::at_end(&mut f, entry);
        b.emit(InstKind::Alloca { ty: Type::ByteArray(256) }, Type::Ptr, "s")
    };

    // s[i] = i, for i in 0..256
    let init = open_counter_loop(&mut f, entry, "ksa_init", Value::Const(Constant::Int(Type::I32, 256)));
    {
        let mut b = Builder::at_end(&mut f, init.body);
        let byte_i = b.emit(InstKind::Bitcast { value: init.index.clone(), ty: Type::I8 }, Type::I8, "ksa_init_byte");
        store_byte(&mut b, s_slot.clone(), init.index.clone(), byte_i, "ksa_init_store");
    }
    close_counter_loop(&mut f, &init);

    // j = (j + s[i] + key[i % key_len]) % 256; swap(s[i], s[j])
    let j_slot = {
        let mut b = Builder::at_end(&mut f, init.exit);
        let slot = b.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, "j_slot");
        b.emit_void(InstKind::Store {
            ptr: slot.clone(),
            value: Value::Const(Constant::Int(Type::I32, 0)),
        });
        slot
    };
    let scramble = open_counter_loop(&mut f, init.exit, "ksa_scramble", Value::Const(Constant::Int(Type::I32, 256)));
    {
        let mut b = Builder::at_end(&mut f, scramble.body);
        let j = b.emit(InstKind::Load { ptr: j_slot.clone(), ty: Type::I32 }, Type::I32, "j");
        let si = load_byte(&mut b, s_slot.clone(), scramble.index.clone(), "scramble_si");
        let si32 = b.emit(InstKind::Bitcast { value: si, ty: Type::I32 }, Type::I32, "scramble_si32");
        let key_idx = urem256(&mut b, scramble.index.clone(), "scramble_key_idx_wide");
        let key_idx = b.emit(
            InstKind::Binary { op: BinOp::URem, lhs: key_idx, rhs: key_len.clone() },
            Type::I32,
            "scramble_key_idx",
        );
        let key_byte = load_byte(&mut b, key.clone(), key_idx, "scramble_keybyte");
        let key_byte32 = b.emit(InstKind::Bitcast { value: key_byte, ty: Type::I32 }, Type::I32, "scramble_keybyte32");
        let sum = b.emit(InstKind::Binary { op: BinOp::Add, lhs: j, rhs: si32 }, Type::I32, "scramble_sum1");
        let sum = b.emit(InstKind::Binary { op: BinOp::Add, lhs: sum, rhs: key_byte32 }, Type::I32, "scramble_sum2");
        let new_j = urem256(&mut b, sum, "scramble_newj");
        b.emit_void(InstKind::Store { ptr: j_slot.clone(), value: new_j.clone() });
        swap_bytes(&mut b, s_slot.clone(), scramble.index.clone(), new_j, "scramble_swap");
    }
    close_counter_loop(&mut f, &scramble);

    // PRGA: for each output byte, advance i and j, swap, XOR into data[idx].
    let i_slot = {
        let mut b = Builder::at_end(&mut f, scramble.exit);
        let slot = b.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, "prga_i_slot");
        b.emit_void(InstKind::Store { ptr: slot.clone(), value: Value::Const(Constant::Int(Type::I32, 0)) });
        slot
    };
    {
        let mut b = Builder::at_end(&mut f, scramble.exit);
        b.emit_void(InstKind::Store { ptr: j_slot.clone(), value: Value::Const(Constant::Int(Type::I32, 0)) });
    }
    let prga = open_counter_loop(&mut f, scramble.exit, "prga", len);
    {
        let mut b = Builder::at_end(&mut f, prga.body);
        let i = b.emit(InstKind::Load { ptr: i_slot.clone(), ty: Type::I32 }, Type::I32, "prga_i_load");
        let i_next = b.emit(InstKind::Binary { op: BinOp::Add, lhs: i, rhs: Value::Const(Constant::Int(Type::I32, 1)) }, Type::I32, "prga_i_inc");
        let i_next = urem256(&mut b, i_next, "prga_i_mod");
        b.emit_void(InstKind::Store { ptr: i_slot.clone(), value: i_next.clone() });

        let j = b.emit(InstKind::Load { ptr: j_slot.clone(), ty: Type::I32 }, Type::I32, "prga_j_load");
        let si = load_byte(&mut b, s_slot.clone(), i_next.clone(), "prga_si");
        let si32 = b.emit(InstKind::Bitcast { value: si, ty: Type::I32 }, Type::I32, "prga_si32");
        let j_next = b.emit(InstKind::Binary { op: BinOp::Add, lhs: j, rhs: si32 }, Type::I32, "prga_j_sum");
        let j_next = urem256(&mut b, j_next, "prga_j_mod");
        b.emit_void(InstKind::Store { ptr: j_slot.clone(), value: j_next.clone() });

        swap_bytes(&mut b, s_slot.clone(), i_next.clone(), j_next.clone(), "prga_swap");

        let si2 = load_byte(&mut b, s_slot.clone(), i_next, "prga_si2");
        let sj2 = load_byte(&mut b, s_slot.clone(), j_next, "prga_sj2");
        let si232 = b.emit(InstKind::Bitcast { value: si2, ty: Type::I32 }, Type::I32, "prga_si232");
        let sj232 = b.emit(InstKind::Bitcast { value: sj2, ty: Type::I32 }, Type::I32, "prga_sj232");
        let t = b.emit(InstKind::Binary { op: BinOp::Add, lhs: si232, rhs: sj232 }, Type::I32, "prga_t");
        let t = urem256(&mut b, t, "prga_t_mod");
        let keystream = load_byte(&mut b, s_slot.clone(), t, "prga_keystream");

        let data_byte = load_byte(&mut b, data.clone(), prga.index.clone(), "prga_databyte");
        let xored = b.emit(
            InstKind::Binary { op: BinOp::Xor, lhs: data_byte, rhs: keystream },
            Type::I8,
            "prga_xored",
        );
        store_byte(&mut b, data.clone(), prga.index.clone(), xored, "prga_store");
    }
    close_counter_loop(&mut f, &prga);

    f.block_mut(prga.exit).terminator = Terminator::Ret { value: None };
    f
}

fn ensure_rc4_decrypt(module: &mut Module) -> FuncId {
    if let Some(id) = module.func_id_by_name(RC4_DECRYPT_FN) {
        return id;
    }
    module.add_function(build_rc4_decrypt_function())
}

/// Builds the in-place rotating-xor decrypt loop for one record directly into `pred_block`,
/// chaining `data[i] ^= (obf_keys[i % keylen] ^ base_key) ^ base_key ^ (i & 0xFF)`. Returns the
/// exit block reached once the loop is done.
fn emit_rotating_xor_decrypt(
    f: &mut Function,
    pred_block: BlockId,
    data_global: GlobalId,
    obf_key_global: GlobalId,
    base_key: u8,
    key_len: usize,
    length: usize,
    tag: &str,
) -> BlockId {
    let data = {
        let mut b = Builder::at_end(f, pred_block);
        b.emit(InstKind::GlobalAddr { global: data_global }, Type::Ptr, format!("{tag}_data"))
    };
    let keys = {
        let mut b = Builder::at_end(f, pred_block);
        b.emit(InstKind::GlobalAddr { global: obf_key_global }, Type::Ptr, format!("{tag}_keys"))
    };

    let loop_ = open_counter_loop(f, pred_block, tag, Value::Const(Constant::Int(Type::I32, length as i64)));
    {
        let mut b = Builder::at_end(f, loop_.body);
        let key_idx = b.emit(
            InstKind::Binary {
                op: BinOp::URem,
                lhs: loop_.index.clone(),
                rhs: Value::Const(Constant::Int(Type::I32, key_len as i64)),
            },
            Type::I32,
            format!("{tag}_key_idx"),
        );
        let obf_key_byte = load_byte(&mut b, keys.clone(), key_idx, &format!("{tag}_obfkey"));
        let actual_key = b.emit(
            InstKind::Binary {
                op: BinOp::Xor,
                lhs: obf_key_byte,
                rhs: Value::Const(Constant::Int(Type::I8, base_key as i64)),
            },
            Type::I8,
            format!("{tag}_key"),
        );
        let pos_mask = b.emit(
            InstKind::Binary {
                op: BinOp::And,
                lhs: loop_.index.clone(),
                rhs: Value::Const(Constant::Int(Type::I32, 0xFF)),
            },
            Type::I32,
            format!("{tag}_posmask"),
        );
        let pos_mask8 = b.emit(InstKind::Bitcast { value: pos_mask, ty: Type::I8 }, Type::I8, format!("{tag}_posmask8"));
        let mixed = b.emit(
            InstKind::Binary { op: BinOp::Xor, lhs: actual_key, rhs: Value::Const(Constant::Int(Type::I8, base_key as i64)) },
            Type::I8,
            format!("{tag}_mixed1"),
        );
        let mixed = b.emit(
            InstKind::Binary { op: BinOp::Xor, lhs: mixed, rhs: pos_mask8 },
            Type::I8,
            format!("{tag}_mixed2"),
        );
        let data_byte = load_byte(&mut b, data.clone(), loop_.index.clone(), &format!("{tag}_databyte"));
        let decrypted = b.emit(InstKind::Binary { op: BinOp::Xor, lhs: data_byte, rhs: mixed }, Type::I8, format!("{tag}_dec"));
        store_byte(&mut b, data.clone(), loop_.index.clone(), decrypted, &format!("{tag}_store"));
    }
    close_counter_loop(f, &loop_);
    loop_.exit
}

/// Emits a call to the shared RC4 interpreter over one record's global, directly into
/// `pred_block`. Returns the same block (no new control flow needed for a single call).
fn emit_rc4_decrypt_call(
    f: &mut Function,
    block: BlockId,
    data_global: GlobalId,
    key_global: GlobalId,
    key_len: usize,
    length: usize,
    rc4_fid: FuncId,
    tag: &str,
) {
    let mut b = Builder::at_end(f, block);
    let data = b.emit(InstKind::GlobalAddr { global: data_global }, Type::Ptr, format!("{tag}_data"));
    let key = b.emit(InstKind::GlobalAddr { global: key_global }, Type::Ptr, format!("{tag}_key"));
    b.emit_void(InstKind::Call {
        callee: codedefender_ir::Callee::Direct(rc4_fid),
        args: vec![
            data,
            Value::Const(Constant::Int(Type::I32, length as i64)),
            key,
            Value::Const(Constant::Int(Type::I32, key_len as i64)),
        ],
    });
}

/// Encrypts every string candidate in place and returns one record per transformed global
/// (spec §4.11). Must run before any stub/constructor synthesis, which consumes these records.
pub fn encrypt_strings(
    module: &mut Module,
    rng: &mut Prng,
    cipher: StringCipher,
    pbkdf2_iterations: u32,
    counters: &mut Counters,
) -> Vec<EncryptedStringRecord> {
    let fingerprint = module_fingerprint(module);
    let candidates = identify_candidates(module);
    let mut records = Vec::new();

    for global_id in candidates {
        let mut bytes = module.global(global_id).string_bytes().unwrap().to_vec();
        let length = bytes.len();

        let record = match cipher {
            StringCipher::RotatingXor => {
                let key_len = rng.gen_range(2, 5) as usize;
                let mut keys = vec![0u8; key_len];
                rng.fill_bytes(&mut keys);
                let base_key = (rng.gen_range(1, 256)) as u8;
                crypto::rotating_xor_encrypt(&mut bytes, &keys, base_key);
                let obf_keys = crypto::obfuscate_key_bytes(&keys, base_key);
                EncryptedStringRecord {
                    global: global_id,
                    length,
                    cipher,
                    salt: None,
                    derived_key: None,
                    xor_keys: Some(obf_keys),
                    base_key: Some(base_key),
                    code_hash_seed: None,
                }
            }
            StringCipher::Rc4 => {
                let key: Vec<u8> = (0..RC4_KEY_LEN)
                    .map(|i| fingerprint.to_be_bytes()[i % 8] ^ (i as u8))
                    .collect();
                crypto::Rc4::apply_keystream(&key, &mut bytes);
                EncryptedStringRecord {
                    global: global_id,
                    length,
                    cipher,
                    salt: None,
                    derived_key: Some(key),
                    xor_keys: None,
                    base_key: None,
                    code_hash_seed: Some(fingerprint),
                }
            }
            StringCipher::Rc4WithPbkdf2 => {
                let mut salt = [0u8; 8];
                loop {
                    rng.fill_bytes(&mut salt);
                    if salt.iter().all(|b| *b != 0) {
                        break;
                    }
                }
                let key = crypto::derive_rc4_key(fingerprint, &salt, pbkdf2_iterations, RC4_KEY_LEN);
                crypto::Rc4::apply_keystream(&key, &mut bytes);
                EncryptedStringRecord {
                    global: global_id,
                    length,
                    cipher,
                    salt: Some(salt),
                    derived_key: Some(key),
                    xor_keys: None,
                    base_key: None,
                    code_hash_seed: Some(fingerprint),
                }
            }
        };

        let g = module.global_mut(global_id);
        *g.string_bytes_mut().unwrap() = bytes;
        g.comdat = None;
        g.section = None;
        g.linkage = Linkage::Internal;
        g.is_constant = false;

        records.push(record);
        counters.strings_encrypted += 1;
    }
    records
}

fn add_key_global(module: &mut Module, name: String, bytes: Vec<u8>) -> GlobalId {
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

fn add_flag_global(module: &mut Module, name: String) -> GlobalId {
    module.add_global(GlobalVariable {
        id: GlobalId(0),
        name,
        ty: Type::I8,
        initializer: Some(GlobalInit::Int(0)),
        linkage: Linkage::Internal,
        is_constant: false,
        comdat: None,
        section: None,
        is_tls_callback_entry: false,
    })
}

/// Builds a dedicated lazy decryptor stub `() -> ptr` for one record (spec §4.11 "Lazy mode").
fn build_lazy_stub(module: &mut Module, record: &EncryptedStringRecord, rc4_fid: Option<FuncId>) -> Function {
    let gname = module.global(record.global).name.clone();
    let tag = sanitize(&gname);
    let flag_global = add_flag_global(module, format!("__obf_decrypted_{tag}"));

    let mut f = Function::new(format!("__decrypt_{tag}"), Type::Ptr, vec![]);
    f.linkage = Linkage::Internal;
    let entry = f.push_block("entry");
    let (data, flag_ptr, flag) = {
        let mut b = Builder::at_end(&mut f, entry);
        let data = b.emit(InstKind::GlobalAddr { global: record.global }, Type::Ptr, "str_data");
        let flag_ptr = b.emit(InstKind::GlobalAddr { global: flag_global }, Type::Ptr, "flag_ptr");
        let flag = b.emit(InstKind::Load { ptr: flag_ptr.clone(), ty: Type::I8 }, Type::I8, "flag");
        (data, flag_ptr, flag)
    };
    let cond = {
        let mut b = Builder::at_end(&mut f, entry);
        b.emit(
            InstKind::ICmp { pred: ICmpPred::Eq, lhs: flag, rhs: Value::Const(Constant::Int(Type::I8, 0)) },
            Type::I1,
            "needs_decrypt",
        )
    };
    let decrypt_block = f.push_block("decrypt_once");
    let skip_block = f.push_block("decrypt_skip");
    f.block_mut(entry).terminator = Terminator::CondBr { cond, if_true: decrypt_block, if_false: skip_block };

    let after_decrypt = match record.cipher {
        StringCipher::RotatingXor => {
            let key_global = add_key_global(module, format!("__obf_strkey_{tag}"), record.xor_keys.clone().unwrap());
            emit_rotating_xor_decrypt(
                &mut f,
                decrypt_block,
                record.global,
                key_global,
                record.base_key.unwrap(),
                record.xor_keys.as_ref().unwrap().len(),
                record.length,
                &format!("decrypt_{tag}"),
            )
        }
        StringCipher::Rc4 | StringCipher::Rc4WithPbkdf2 => {
            let key_global = add_key_global(module, format!("__obf_strkey_{tag}"), record.derived_key.clone().unwrap());
            emit_rc4_decrypt_call(
                &mut f,
                decrypt_block,
                record.global,
                key_global,
                record.derived_key.as_ref().unwrap().len(),
                record.length,
                rc4_fid.expect("rc4 decrypt function must exist for an rc4-family record"),
                &format!("decrypt_{tag}"),
            );
            decrypt_block
        }
    };
    {
        let mut b = Builder::at_end(&mut f, after_decrypt);
        b.emit_void(InstKind::Store { ptr: flag_ptr, value: Value::Const(Constant::Int(Type::I8, 1)) });
    }
    f.block_mut(after_decrypt).terminator = Terminator::Br { target: skip_block };
    f.block_mut(skip_block).terminator = Terminator::Ret { value: Some(data) };
    f
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn build_startup_ctor_rotating_xor(module: &mut Module, records: &[EncryptedStringRecord]) -> Function {
    let mut f = Function::new("__ctor_rotating_xor_decrypt", Type::Void, vec![]);
    f.linkage = Linkage::Internal;
    let mut block = f.push_block("entry");
    for (i, record) in records.iter().enumerate() {
        let gname = module.global(record.global).name.clone();
        let tag = format!("ctor_xor_{i}_{}", sanitize(&gname));
        let key_global = add_key_global(module, format!("__obf_strkey_{tag}"), record.xor_keys.clone().unwrap());
        block = emit_rotating_xor_decrypt(
            &mut f,
            block,
            record.global,
            key_global,
            record.base_key.unwrap(),
            record.xor_keys.as_ref().unwrap().len(),
            record.length,
            &tag,
        );
    }
    f.block_mut(block).terminator = Terminator::Ret { value: None };
    f
}

fn build_startup_ctor_rc4(module: &mut Module, records: &[EncryptedStringRecord], rc4_fid: FuncId) -> Function {
    let mut f = Function::new("__ctor_rc4_decrypt", Type::Void, vec![]);
    f.linkage = Linkage::Internal;
    let block = f.push_block("entry");
    for (i, record) in records.iter().enumerate() {
        let gname = module.global(record.global).name.clone();
        let tag = format!("ctor_rc4_{i}_{}", sanitize(&gname));
        let key_global = add_key_global(module, format!("__obf_strkey_{tag}"), record.derived_key.clone().unwrap());
        emit_rc4_decrypt_call(
            &mut f,
            block,
            record.global,
            key_global,
            record.derived_key.as_ref().unwrap().len(),
            record.length,
            rc4_fid,
            &tag,
        );
    }
    f.block_mut(block).terminator = Terminator::Ret { value: None };
    f
}

/// Synthesizes runtime decryption for every record, per `decrypt_at_startup` (spec §4.11 "Stub
/// synthesis"). In lazy mode, also rewrites every use of each encrypted global across the whole
/// module to call the new stub instead.
pub fn synthesize_decryptors(module: &mut Module, records: &[EncryptedStringRecord], decrypt_at_startup: bool) {
    if records.is_empty() {
        return;
    }
    let needs_rc4 = records
        .iter()
        .any(|r| matches!(r.cipher, StringCipher::Rc4 | StringCipher::Rc4WithPbkdf2));
    let rc4_fid = if needs_rc4 { Some(ensure_rc4_decrypt(module)) } else { None };

    if decrypt_at_startup {
        let xor_records: Vec<_> = records
            .iter()
            .filter(|r| r.cipher == StringCipher::RotatingXor)
            .cloned()
            .collect();
        let rc4_records: Vec<_> = records
            .iter()
            .filter(|r| r.cipher != StringCipher::RotatingXor)
            .cloned()
            .collect();

        if !xor_records.is_empty() {
            let ctor = build_startup_ctor_rotating_xor(module, &xor_records);
            let name = ctor.name.clone();
            module.add_function(ctor);
            module.add_global_ctor(name, 10);
        }
        if !rc4_records.is_empty() {
            let ctor = build_startup_ctor_rc4(module, &rc4_records, rc4_fid.unwrap());
            let name = ctor.name.clone();
            module.add_function(ctor);
            module.add_global_ctor(name, 10);
        }
        return;
    }

    for record in records {
        let tag = sanitize(&module.global(record.global).name);
        let stub = build_lazy_stub(module, record, rc4_fid);
        let stub_name = stub.name.clone();
        let stub_fid = module.add_function(stub);
        let global = record.global;

        for f in &mut module.functions {
            if f.name == stub_name {
                continue;
            }
            let global_addr_insts: Vec<_> = f
                .insts
                .iter()
                .filter(|inst| matches!(inst.kind, InstKind::GlobalAddr { global: g } if g == global))
                .map(|inst| inst.id)
                .collect();
            if global_addr_insts.is_empty() {
                continue;
            }

            let entry = f.entry();
            let call_result = {
                let mut b = Builder::at_start(f, entry);
                b.emit(
                    InstKind::Call {
                        callee: codedefender_ir::Callee::Direct(stub_fid),
                        args: vec![],
                    },
                    Type::Ptr,
                    format!("{tag}_ptr"),
                )
            };
            for inst_id in &global_addr_insts {
                f.replace_inst_uses(*inst_id, call_result.clone());
            }
            for block in &mut f.blocks {
                block.insts.retain(|id| !global_addr_insts.contains(id));
            }
        }
    }
}

/// Top-level C11 entry point: encrypts candidates and synthesizes their decryptors.
pub fn run(module: &mut Module, rng: &mut Prng, cipher: StringCipher, pbkdf2_iterations: u32, decrypt_at_startup: bool, counters: &mut Counters) -> usize {
    let records = encrypt_strings(module, rng, cipher, pbkdf2_iterations, counters);
    let n = records.len();
    synthesize_decryptors(module, &records, decrypt_at_startup);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::types::Type;

    fn module_with_string(bytes: &[u8]) -> (Module, GlobalId) {
        let mut module = Module::new("m");
        let id = module.add_global(GlobalVariable {
            id: GlobalId(0),
            name: "greeting".to_string(),
            ty: Type::ByteArray(bytes.len()),
            initializer: Some(GlobalInit::Bytes(bytes.to_vec())),
            linkage: Linkage::Internal,
            is_constant: true,
            comdat: Some("rdata_comdat".to_string()),
            section: Some(".rdata$greeting".to_string()),
            is_tls_callback_entry: false,
        });
        let mut f = Function::new("uses_greeting", Type::Ptr, vec![]);
        let entry = f.push_block("entry");
        let mut builder = Builder::at_start(&mut f, entry);
        let v = builder.emit(InstKind::GlobalAddr { global: id }, Type::Ptr, "gaddr");
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(v) };
        module.add_function(f);
        (module, id)
    }

    #[test]
    fn encrypts_rotating_xor_in_place_same_length() {
        let (mut module, id) = module_with_string(b"hello\0");
        let mut rng = Prng::from_seed_components(1, 2);
        let mut counters = Counters::default();
        let records = encrypt_strings(&mut module, &mut rng, StringCipher::RotatingXor, 500, &mut counters);
        assert_eq!(records.len(), 1);
        let g = module.global(id);
        assert_eq!(g.string_bytes().unwrap().len(), 6);
        assert_ne!(g.string_bytes().unwrap(), b"hello\0");
        assert!(!g.is_constant);
        assert_eq!(counters.strings_encrypted, 1);
    }

    #[test]
    fn lazy_mode_rewrites_uses_and_verifies() {
        let (mut module, _id) = module_with_string(b"secret\0");
        let mut rng = Prng::from_seed_components(3, 4);
        let mut counters = Counters::default();
        run(&mut module, &mut rng, StringCipher::RotatingXor, 500, false, &mut counters);

        let f = module.function(module.func_id_by_name("uses_greeting").unwrap());
        let calls_stub = f.insts.iter().any(|i| matches!(&i.kind, InstKind::Call { .. }));
        assert!(calls_stub);
        assert!(codedefender_ir::verify_module(&module).is_ok());
    }

    #[test]
    fn startup_mode_registers_ctor_and_verifies() {
        let (mut module, _id) = module_with_string(b"another\0");
        let mut rng = Prng::from_seed_components(5, 6);
        let mut counters = Counters::default();
        run(&mut module, &mut rng, StringCipher::Rc4WithPbkdf2, 500, true, &mut counters);
        assert_eq!(module.global_ctors.len(), 1);
        assert!(codedefender_ir::verify_module(&module).is_ok());
    }
}
