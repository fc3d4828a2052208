//! Cursor-based instruction emission, the `ir` crate's analog of an LLVM-style `IRBuilder`.

use crate::function::Function;
use crate::inst::InstKind;
use crate::types::Type;
use crate::value::{BlockId, InstId, Value};

/// Where in a block's instruction list new instructions are inserted.
#[derive(Debug, Clone, Copy)]
pub enum InsertPoint {
    /// Before the instruction at this list index within the block (append if `== insts.len()`).
    Index(usize),
}

pub struct Builder<'f> {
    func: &'f mut Function,
    block: BlockId,
    point: usize,
}

impl<'f> Builder<'f> {
    pub fn at(func: &'f mut Function, block: BlockId, point: InsertPoint) -> Self {
        let InsertPoint::Index(idx) = point;
        Builder {
            func,
            block,
            point: idx,
        }
    }

    /// Positions the cursor at the end of the block's instruction list (but still before its
    /// terminator, which is stored separately).
    pub fn at_end(func: &'f mut Function, block: BlockId) -> Self {
        let len = func.block(block).insts.len();
        Builder {
            func,
            block,
            point: len,
        }
    }

    pub fn at_start(func: &'f mut Function, block: BlockId) -> Self {
        Builder {
            func,
            block,
            point: 0,
        }
    }

    /// Inserts after any PHI prefix, which is where non-PHI instructions (bogus stores, opaque
    /// predicates, etc.) must land (spec §4.7: "after the PHI prefix").
    pub fn after_phis(func: &'f mut Function, block: BlockId) -> Self {
        let phi_count = func
            .block(block)
            .insts
            .iter()
            .take_while(|id| func.inst(**id).is_phi())
            .count();
        Builder {
            func,
            block,
            point: phi_count,
        }
    }

    pub fn emit(&mut self, kind: InstKind, ty: Type, name: impl Into<String>) -> Value {
        let id = self.func.new_inst(kind, ty, name);
        self.func.block_mut(self.block).insts.insert(self.point, id);
        self.point += 1;
        Value::Inst(id)
    }

    /// Like `emit`, but for instructions with no result (e.g. `Store`) where the caller has no
    /// use for the returned `Value`.
    pub fn emit_void(&mut self, kind: InstKind) -> InstId {
        let id = self.func.new_inst(kind, Type::Void, "");
        self.func.block_mut(self.block).insts.insert(self.point, id);
        self.point += 1;
        id
    }

    pub fn position(&self) -> usize {
        self.point
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn func_mut(&mut self) -> &mut Function {
        self.func
    }
}
