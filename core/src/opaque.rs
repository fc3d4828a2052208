//! C5 — Opaque-Predicate Synthesizer (spec §4.5).
//!
//! Emits an IR expression tree that provably evaluates to a constant truth value but is opaque
//! to value analysis: a stack slot is initialized with a fresh random integer, read back
//! through a load (to defeat constant folding), and one of twelve true-identities (or six
//! false-identities) is computed over the loaded value.

use codedefender_ir::builder::Builder;
use codedefender_ir::function::Function;
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BinOp, BlockId, ICmpPred, UnOp, Value};
use codedefender_ir::InstKind;

use crate::rng::Prng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    True,
    False,
}

const TRUE_IDENTITY_COUNT: u32 = 12;
const FALSE_IDENTITY_COUNT: u32 = 6;

/// Emits the opaque predicate at the builder's current position and returns an `i1` value.
pub fn emit(builder: &mut Builder<'_>, rng: &mut Prng, polarity: Polarity, name_seed: u32) -> Value {
    let seed_value = rng.next_i64() & 0xFFFF;
    let slot = builder.emit(
        InstKind::Alloca { ty: Type::I64 },
        Type::Ptr,
        format!("obf_slot_{name_seed}"),
    );
    builder.emit_void(InstKind::Store {
        ptr: slot.clone(),
        value: Value::Const(Constant::Int(Type::I64, seed_value)),
    });
    let x = builder.emit(
        InstKind::Load {
            ptr: slot,
            ty: Type::I64,
        },
        Type::I64,
        format!("obf_x_{name_seed}"),
    );

    match polarity {
        Polarity::True => {
            let variant = rng.gen_range(0, TRUE_IDENTITY_COUNT);
            emit_true_identity(builder, x, variant, name_seed)
        }
        Polarity::False => {
            let variant = rng.gen_range(0, FALSE_IDENTITY_COUNT);
            emit_false_identity(builder, x, variant, name_seed)
        }
    }
}

fn bin(builder: &mut Builder<'_>, op: BinOp, lhs: Value, rhs: Value, name: String) -> Value {
    builder.emit(InstKind::Binary { op, lhs, rhs }, Type::I64, name)
}

fn icmp(builder: &mut Builder<'_>, pred: ICmpPred, lhs: Value, rhs: Value, name: String) -> Value {
    builder.emit(InstKind::ICmp { pred, lhs, rhs }, Type::I1, name)
}

fn c(v: i64) -> Value {
    Value::Const(Constant::Int(Type::I64, v))
}

/// `(x*(x+1)) mod 2 == 0`, `(x|1) != 0`, `x & ~x == 0`, `x ^ x == 0`, `x*x >= 0`,
/// `(x-x+1) > 0`, `x|x == x`, `x&x == x`, `((2x)/2) == x`, `7x^2+11 != 0`, `~~x == x`, `x+0==x`.
fn emit_true_identity(builder: &mut Builder<'_>, x: Value, variant: u32, s: u32) -> Value {
    let n = |suffix: &str| format!("obf_t{variant}_{s}_{suffix}");
    match variant {
        0 => {
            let xp1 = bin(builder, BinOp::Add, x.clone(), c(1), n("xp1"));
            let prod = bin(builder, BinOp::Mul, x, xp1, n("prod"));
            let m = bin(builder, BinOp::And, prod, c(1), n("mod2"));
            icmp(builder, ICmpPred::Eq, m, c(0), n("pred"))
        }
        1 => {
            let ored = bin(builder, BinOp::Or, x, c(1), n("or1"));
            icmp(builder, ICmpPred::Ne, ored, c(0), n("pred"))
        }
        2 => {
            let notx = builder.emit(InstKind::Unary { op: UnOp::Not, value: x.clone() }, Type::I64, n("not"));
            let anded = bin(builder, BinOp::And, x, notx, n("and"));
            icmp(builder, ICmpPred::Eq, anded, c(0), n("pred"))
        }
        3 => {
            let xored = bin(builder, BinOp::Xor, x.clone(), x, n("xor"));
            icmp(builder, ICmpPred::Eq, xored, c(0), n("pred"))
        }
        4 => {
            let sq = bin(builder, BinOp::Mul, x.clone(), x, n("sq"));
            icmp(builder, ICmpPred::Sge, sq, c(0), n("pred"))
        }
        5 => {
            let diff = bin(builder, BinOp::Sub, x.clone(), x, n("diff"));
            let plus1 = bin(builder, BinOp::Add, diff, c(1), n("plus1"));
            icmp(builder, ICmpPred::Sgt, plus1, c(0), n("pred"))
        }
        6 => {
            let ored = bin(builder, BinOp::Or, x.clone(), x.clone(), n("or"));
            icmp(builder, ICmpPred::Eq, ored, x, n("pred"))
        }
        7 => {
            let anded = bin(builder, BinOp::And, x.clone(), x.clone(), n("and"));
            icmp(builder, ICmpPred::Eq, anded, x, n("pred"))
        }
        8 => {
            let doubled = bin(builder, BinOp::Mul, x.clone(), c(2), n("dbl"));
            let halved = bin(builder, BinOp::SDiv, doubled, c(2), n("halved"));
            icmp(builder, ICmpPred::Eq, halved, x, n("pred"))
        }
        9 => {
            let sq = bin(builder, BinOp::Mul, x.clone(), x, n("sq"));
            let scaled = bin(builder, BinOp::Mul, sq, c(7), n("scaled"));
            let plus11 = bin(builder, BinOp::Add, scaled, c(11), n("plus11"));
            icmp(builder, ICmpPred::Ne, plus11, c(0), n("pred"))
        }
        10 => {
            let not1 = builder.emit(InstKind::Unary { op: UnOp::Not, value: x.clone() }, Type::I64, n("not1"));
            let not2 = builder.emit(InstKind::Unary { op: UnOp::Not, value: not1 }, Type::I64, n("not2"));
            icmp(builder, ICmpPred::Eq, not2, x, n("pred"))
        }
        _ => {
            let plus0 = bin(builder, BinOp::Add, x.clone(), c(0), n("plus0"));
            icmp(builder, ICmpPred::Eq, plus0, x, n("pred"))
        }
    }
}

/// Negated family: same identities, inverted comparison, so the result is provably false.
fn emit_false_identity(builder: &mut Builder<'_>, x: Value, variant: u32, s: u32) -> Value {
    let n = |suffix: &str| format!("obf_f{variant}_{s}_{suffix}");
    match variant {
        0 => {
            let xored = bin(builder, BinOp::Xor, x.clone(), x, n("xor"));
            icmp(builder, ICmpPred::Ne, xored, c(0), n("pred"))
        }
        1 => {
            let anded = bin(builder, BinOp::And, x.clone(), x.clone(), n("and"));
            icmp(builder, ICmpPred::Ne, anded, x, n("pred"))
        }
        2 => {
            let sq = bin(builder, BinOp::Mul, x.clone(), x, n("sq"));
            icmp(builder, ICmpPred::Slt, sq, c(0), n("pred"))
        }
        3 => {
            let notx = builder.emit(InstKind::Unary { op: UnOp::Not, value: x.clone() }, Type::I64, n("not"));
            let anded = bin(builder, BinOp::And, x, notx, n("and"));
            icmp(builder, ICmpPred::Ne, anded, c(0), n("pred"))
        }
        4 => {
            let ored = bin(builder, BinOp::Or, x.clone(), c(1), n("or1"));
            icmp(builder, ICmpPred::Eq, ored, c(0), n("pred"))
        }
        _ => {
            let plus0 = bin(builder, BinOp::Add, x.clone(), c(0), n("plus0"));
            icmp(builder, ICmpPred::Ne, plus0, x, n("pred"))
        }
    }
}

/// True if `block_name` carries one of the generated-entity prefixes (spec §6), and thus must
/// not be re-treated as an obfuscation candidate.
pub fn is_generated_name(name: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "obf_", "fake_", "cff_", "decrypt_", "dispatch", "resolve_api", "call_api",
        "debugger_detected", "analysis_detected", "tampered", "integrity_continue",
    ];
    PREFIXES.iter().any(|p| name.starts_with(p))
}

pub fn entry_or_declared_block(f: &Function) -> BlockId {
    f.entry()
}
