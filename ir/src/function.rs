//! Functions: an arena of basic blocks and instructions, owned exclusively by the function
//! that contains them (spec §9 — no block outlives its owner, no resurrecting stale handles).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::block::{BasicBlock, Terminator};
use crate::inst::{Instruction, InstKind};
use crate::types::Type;
use crate::value::{BlockId, InstId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    External,
    Internal,
    LinkOnceOdr,
    WeakOdr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub ret_ty: Type,
    pub param_tys: Vec<Type>,
    pub linkage: Linkage,
    pub is_declaration: bool,
    pub blocks: Vec<BasicBlock>,
    pub insts: Vec<Instruction>,
    next_name_id: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, ret_ty: Type, param_tys: Vec<Type>) -> Self {
        Function {
            name: name.into(),
            ret_ty,
            param_tys,
            linkage: Linkage::External,
            is_declaration: false,
            blocks: Vec::new(),
            insts: Vec::new(),
            next_name_id: 0,
        }
    }

    pub fn declaration(name: impl Into<String>, ret_ty: Type, param_tys: Vec<Type>) -> Self {
        let mut f = Function::new(name, ret_ty, param_tys);
        f.is_declaration = true;
        f
    }

    /// Allocates a fresh numeric suffix, used by passes to keep generated names unique within
    /// a function without colliding across cycles.
    pub fn fresh_id(&mut self) -> u32 {
        let id = self.next_name_id;
        self.next_name_id += 1;
        id
    }

    pub fn entry(&self) -> BlockId {
        self.blocks[0].id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        self.blocks
            .iter()
            .find(|b| b.id == id)
            .expect("invalid BlockId")
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        self.blocks
            .iter_mut()
            .find(|b| b.id == id)
            .expect("invalid BlockId")
    }

    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.0 as usize]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id.0 as usize]
    }

    pub fn push_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, name));
        id
    }

    /// Appends a new instruction to the function's global instruction arena and returns its id.
    /// Does not place it in any block — callers place it via `Builder` or by pushing onto a
    /// block's `insts` directly.
    pub fn new_inst(&mut self, kind: InstKind, ty: Type, name: impl Into<String>) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(Instruction {
            id,
            kind,
            ty,
            name: name.into(),
        });
        id
    }

    pub fn has_exception_pad(&self) -> bool {
        self.blocks.iter().any(|b| b.has_exception_machinery())
    }

    /// Recomputes every block's `preds` from the current terminators. Must be called after any
    /// CFG-mutating edit before the block's PHIs or dominance are consulted.
    pub fn recompute_preds(&mut self) {
        let mut preds: HashMap<BlockId, Vec<BlockId>> =
            self.blocks.iter().map(|b| (b.id, Vec::new())).collect();
        for block in &self.blocks {
            for succ in block.terminator.successors() {
                preds.entry(succ).or_default().push(block.id);
            }
        }
        for block in &mut self.blocks {
            block.preds = preds.remove(&block.id).unwrap_or_default();
        }
    }

    /// Coarse-grained dominance: for each block, the set of blocks that dominate it. Computed
    /// with the textbook iterative data-flow fixpoint. Adequate for the obfuscator's needs
    /// (functions are small; this is not a performance-critical path) — spec §9 explicitly
    /// allows "any better dominance-aware loop detector"; this is deliberately the simple one.
    pub fn dominators(&self) -> HashMap<BlockId, HashSet<BlockId>> {
        let all: HashSet<BlockId> = self.blocks.iter().map(|b| b.id).collect();
        let entry = self.entry();
        let mut dom: HashMap<BlockId, HashSet<BlockId>> = self
            .blocks
            .iter()
            .map(|b| {
                if b.id == entry {
                    let mut s = HashSet::new();
                    s.insert(entry);
                    (b.id, s)
                } else {
                    (b.id, all.clone())
                }
            })
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for block in &self.blocks {
                if block.id == entry {
                    continue;
                }
                if block.preds.is_empty() {
                    continue;
                }
                let mut new_dom = dom[&block.preds[0]].clone();
                for p in &block.preds[1..] {
                    new_dom = new_dom.intersection(&dom[p]).copied().collect();
                }
                new_dom.insert(block.id);
                if new_dom != dom[&block.id] {
                    dom.insert(block.id, new_dom);
                    changed = true;
                }
            }
        }
        dom
    }

    pub fn dominates(&self, a: BlockId, b: BlockId, dom: &HashMap<BlockId, HashSet<BlockId>>) -> bool {
        dom.get(&b).is_some_or(|set| set.contains(&a))
    }

    /// Index of `block_id` among `self.blocks`, i.e. lexical layout order (not state order).
    /// Used by the complexity proxy's "successor appears earlier in layout" loop heuristic
    /// (spec §4.3).
    pub fn layout_index(&self, block_id: BlockId) -> usize {
        self.blocks.iter().position(|b| b.id == block_id).unwrap()
    }

    /// Every direct value use in the function, as `(user-block, InstId-or-terminator-site)`.
    /// Used by the string-cipher stub rewriter (C11) to find and replace uses of an encrypted
    /// global.
    pub fn replace_global_uses(&mut self, from: crate::value::GlobalId, to: Value) {
        for inst in &mut self.insts {
            for operand in inst.operands_mut() {
                if let Value::Global(g) = operand {
                    if *g == from {
                        *operand = to.clone();
                    }
                }
            }
        }
    }

    pub fn return_type(&self) -> &Type {
        &self.ret_ty
    }

    /// Rewrites every use of `from` (an instruction result) to `to`, across instruction operands
    /// and terminator operands alike. Used by passes that replace one instruction with an
    /// equivalent expression tree rooted at a different id (spec §4.8's MBA rewrites, §4.11's
    /// string-stub rewriting).
    pub fn replace_inst_uses(&mut self, from: InstId, to: Value) {
        for inst in &mut self.insts {
            for operand in inst.operands_mut() {
                if *operand == Value::Inst(from) {
                    *operand = to.clone();
                }
            }
        }
        for block in &mut self.blocks {
            match &mut block.terminator {
                Terminator::CondBr { cond, .. } => {
                    if *cond == Value::Inst(from) {
                        *cond = to.clone();
                    }
                }
                Terminator::Switch { value, .. } => {
                    if *value == Value::Inst(from) {
                        *value = to.clone();
                    }
                }
                Terminator::Ret { value: Some(value) } => {
                    if *value == Value::Inst(from) {
                        *value = to.clone();
                    }
                }
                _ => {}
            }
        }
    }
}
