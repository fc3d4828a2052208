//! `codedefender-ir` is a minimal, typed, SSA-form compiler IR: a stand-in for the host IR
//! toolkit that `codedefender-core`'s obfuscation engine is specified against (module/function
//! verifier, IR builder, use-enumeration). Functions own their basic blocks and instructions in
//! an arena and reference them by id, never by pointer, so nothing outlives its owner.

pub mod block;
pub mod builder;
pub mod function;
pub mod inst;
pub mod module;
pub mod types;
pub mod value;
pub mod verify;

pub use block::{BasicBlock, Terminator};
pub use builder::{Builder, InsertPoint};
pub use function::{Function, Linkage};
pub use inst::{Callee, InstKind, Instruction};
pub use module::{GlobalInit, GlobalVariable, Module};
pub use types::{Constant, Type};
pub use value::{BinOp, BlockId, FuncId, GlobalId, ICmpPred, InstId, UnOp, Value};
pub use verify::{verify_function, verify_module, VerifyError};
