//! The top-level compilation unit: globals, functions, and the global-constructor list.

use serde::{Deserialize, Serialize};

use crate::function::{Function, Linkage};
use crate::types::Type;
use crate::value::{FuncId, GlobalId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GlobalInit {
    Bytes(Vec<u8>),
    Zero,
    Int(i64),
    /// A constant array of function-pointer-typed elements, used by C12's function-pointer
    /// table.
    FuncPtrArray(Vec<FuncId>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalVariable {
    pub id: GlobalId,
    pub name: String,
    pub ty: Type,
    pub initializer: Option<GlobalInit>,
    pub linkage: Linkage,
    pub is_constant: bool,
    pub comdat: Option<String>,
    pub section: Option<String>,
    /// TLS-callback-section placement (spec §6: Windows `.CRT$XLB`). `None` on platforms where
    /// this pass is gated off.
    pub is_tls_callback_entry: bool,
}

impl GlobalVariable {
    pub fn string_bytes(&self) -> Option<&[u8]> {
        match &self.initializer {
            Some(GlobalInit::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn string_bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.initializer {
            Some(GlobalInit::Bytes(b)) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVariable>,
    /// `(function name, priority)`, appended-only (spec §5: never replace existing entries).
    pub global_ctors: Vec<(String, u32)>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            functions: Vec::new(),
            globals: Vec::new(),
            global_ctors: Vec::new(),
        }
    }

    pub fn add_function(&mut self, f: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(f);
        id
    }

    pub fn func_id_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn add_global(&mut self, g: GlobalVariable) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        let mut g = g;
        g.id = id;
        self.globals.push(g);
        id
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        self.globals
            .iter()
            .find(|g| g.id == id)
            .expect("invalid GlobalId")
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalVariable {
        self.globals
            .iter_mut()
            .find(|g| g.id == id)
            .expect("invalid GlobalId")
    }

    /// Registers a constructor function in the module's global-constructor list at the given
    /// priority (lower runs earlier). Appends; never replaces an existing entry (spec §5).
    pub fn add_global_ctor(&mut self, func_name: impl Into<String>, priority: u32) {
        self.global_ctors.push((func_name.into(), priority));
    }

    /// All function names, in a stable, sorted order — iteration over this, rather than over
    /// `self.functions` directly, is how passes satisfy the "no unordered hash-keyed iteration"
    /// determinism rule (spec §5) when the natural definition order isn't itself the contract.
    pub fn sorted_function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|f| f.name.clone()).collect();
        names.sort();
        names
    }
}
