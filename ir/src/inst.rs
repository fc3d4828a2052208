//! Non-terminator instructions.

use serde::{Deserialize, Serialize};

use crate::types::Type;
use crate::value::{BinOp, BlockId, FuncId, GlobalId, ICmpPred, InstId, UnOp, Value};

/// Who an indirect/direct call targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Callee {
    /// A direct call to a function defined or declared in this module.
    Direct(FuncId),
    /// An indirect call through a first-class pointer value (used by C12's function-pointer
    /// table and resolved-import call sites after rewriting).
    Indirect(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstKind {
    /// Stack allocation; the result is a `Ptr` to storage of `ty`.
    Alloca { ty: Type },
    Load { ptr: Value, ty: Type },
    Store { ptr: Value, value: Value },
    Binary { op: BinOp, lhs: Value, rhs: Value },
    Unary { op: UnOp, value: Value },
    ICmp { pred: ICmpPred, lhs: Value, rhs: Value },
    /// `cond ? if_true : if_false` — used by flattening's next-state computation (spec §4.9)
    /// and by the MBA/opaque-predicate machinery.
    Select { cond: Value, if_true: Value, if_false: Value },
    Call { callee: Callee, args: Vec<Value> },
    /// `incomings` is `(predecessor block, value)`. PHI predecessor sets must always equal the
    /// owning block's actual predecessor set (spec invariant 4).
    Phi { incomings: Vec<(BlockId, Value)> },
    Bitcast { value: Value, ty: Type },
    /// Address of a global, typed as `Ptr`.
    GlobalAddr { global: GlobalId },
    /// Address of a function, typed as `Ptr` (used to populate C12's function-pointer table).
    FuncAddr { func: FuncId },
    /// Byte-indexed pointer arithmetic: `base + index`, typed as `Ptr`. The IR has no aggregate
    /// element types beyond `ByteArray`, so every indexed access (RC4's key/state arrays, the
    /// string cipher's byte buffers) goes through this rather than a typed GEP.
    PtrIndex { base: Value, index: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: InstId,
    pub kind: InstKind,
    /// Result type. `Type::Void` for instructions with no result (store).
    pub ty: Type,
    /// Debug/generated name, without the leading `%`. Used to apply the stable-prefix naming
    /// convention for synthesized values (spec §6).
    pub name: String,
}

impl Instruction {
    pub fn produces_value(&self) -> bool {
        !matches!(self.ty, Type::Void)
    }

    /// Every `Value::Inst` operand this instruction reads, for use-enumeration and dominance
    /// checks.
    pub fn operands(&self) -> Vec<&Value> {
        match &self.kind {
            InstKind::Alloca { .. } => vec![],
            InstKind::Load { ptr, .. } => vec![ptr],
            InstKind::Store { ptr, value } => vec![ptr, value],
            InstKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Unary { value, .. } => vec![value],
            InstKind::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![cond, if_true, if_false],
            InstKind::Call { callee, args } => {
                let mut ops: Vec<&Value> = args.iter().collect();
                if let Callee::Indirect(v) = callee {
                    ops.push(v);
                }
                ops
            }
            InstKind::Phi { incomings } => incomings.iter().map(|(_, v)| v).collect(),
            InstKind::Bitcast { value, .. } => vec![value],
            InstKind::GlobalAddr { .. } | InstKind::FuncAddr { .. } => vec![],
            InstKind::PtrIndex { base, index } => vec![base, index],
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match &mut self.kind {
            InstKind::Alloca { .. } => vec![],
            InstKind::Load { ptr, .. } => vec![ptr],
            InstKind::Store { ptr, value } => vec![ptr, value],
            InstKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Unary { value, .. } => vec![value],
            InstKind::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![cond, if_true, if_false],
            InstKind::Call { callee, args } => {
                let mut ops: Vec<&mut Value> = args.iter_mut().collect();
                if let Callee::Indirect(v) = callee {
                    ops.push(v);
                }
                ops
            }
            InstKind::Phi { incomings } => incomings.iter_mut().map(|(_, v)| v).collect(),
            InstKind::Bitcast { value, .. } => vec![value],
            InstKind::GlobalAddr { .. } | InstKind::FuncAddr { .. } => vec![],
            InstKind::PtrIndex { base, index } => vec![base, index],
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstKind::Phi { .. })
    }

    pub fn is_alloca(&self) -> bool {
        matches!(self.kind, InstKind::Alloca { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, InstKind::Call { .. })
    }

    pub fn is_memory_op(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Load { .. } | InstKind::Store { .. } | InstKind::Alloca { .. }
        )
    }

    /// A coarse, stable "opcode" identifier used by the anti-tamper fold (spec §4.14) and the
    /// criticality complexity proxy. Cheaper than hashing the full instruction.
    pub fn opcode_tag(&self) -> u32 {
        match &self.kind {
            InstKind::Alloca { .. } => 1,
            InstKind::Load { .. } => 2,
            InstKind::Store { .. } => 3,
            InstKind::Binary { op, .. } => 10 + *op as u32,
            InstKind::Unary { op, .. } => 30 + *op as u32,
            InstKind::ICmp { pred, .. } => 40 + *pred as u32,
            InstKind::Select { .. } => 60,
            InstKind::Call { .. } => 61,
            InstKind::Phi { .. } => 62,
            InstKind::Bitcast { .. } => 63,
            InstKind::GlobalAddr { .. } => 64,
            InstKind::FuncAddr { .. } => 65,
            InstKind::PtrIndex { .. } => 66,
        }
    }
}
