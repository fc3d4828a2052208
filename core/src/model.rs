//! Core-owned entities that live across passes within one `run()` invocation (spec §3).

use std::collections::{HashMap, HashSet};

use codedefender_config::{Criticality, StringCipher};
use codedefender_ir::{FuncId, GlobalId};

/// Derived per function, computed lazily and cached for the current cycle (spec §3).
#[derive(Debug, Clone)]
pub struct FunctionAnalysisRecord {
    pub criticality: Criticality,
    pub complexity: u32,
    pub sensitivity_score: u32,
    pub estimated_growth_percent: u32,
    pub caller_count: u32,
    pub has_string_ops: bool,
    pub has_crypto_ops: bool,
    pub has_network_ops: bool,
    pub has_file_ops: bool,
}

/// One per transformed string global (spec §3/§4.11).
#[derive(Debug, Clone)]
pub struct EncryptedStringRecord {
    pub global: GlobalId,
    pub length: usize,
    pub cipher: StringCipher,
    pub salt: Option<[u8; 8]>,
    pub derived_key: Option<Vec<u8>>,
    pub xor_keys: Option<Vec<u8>>,
    pub base_key: Option<u8>,
    pub code_hash_seed: Option<u64>,
}

/// Module-level function-pointer table built by C12, plus the index map from internal
/// function to its table slot. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct FunctionPointerTable {
    pub table_global: Option<GlobalId>,
    pub index_of: HashMap<FuncId, usize>,
}

/// One resolver cache slot per hidden external function (spec §3/§4.12).
#[derive(Debug, Clone)]
pub struct ApiResolutionCacheSlot {
    pub func: FuncId,
    pub cache_global: GlobalId,
    pub hash_global: GlobalId,
    pub name_hash: u64,
    pub dll_name: &'static str,
}

/// Monotonically increasing per-technique counters, accumulated across cycles and consumed by
/// C17 (spec §3 "Counters").
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub control_flow_obfuscations: u64,
    pub bogus_instructions: u64,
    pub fake_loops: u64,
    pub instruction_substitutions: u64,
    pub mba_rewrites: u64,
    pub constants_hidden: u64,
    pub functions_flattened: u64,
    pub functions_virtualized: u64,
    pub indirect_calls: u64,
    pub imports_hidden: u64,
    pub anti_debug_insertion_points: u64,
    pub anti_analysis_insertions: u64,
    pub polymorphic_variants: u64,
    pub metamorphic_transforms: u64,
    pub strings_encrypted: u64,
    pub dynamic_obfuscations: u64,
    pub verification_failures: u64,
}

/// The set of function names captured before any pass runs, frozen for the run's lifetime.
/// Only members of this set are ever candidates for further obfuscation — this is what bounds
/// polymorphic variant blow-up to `O(variants * |original functions|)` instead of exponential
/// growth across cycles (spec §3, §8 property 4).
#[derive(Debug, Clone, Default)]
pub struct OriginalFunctionSet {
    names: HashSet<String>,
}

impl OriginalFunctionSet {
    pub fn capture(module: &codedefender_ir::Module) -> Self {
        OriginalFunctionSet {
            names: module
                .functions
                .iter()
                .filter(|f| !f.is_declaration)
                .map(|f| f.name.clone())
                .collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Frozen names, in sorted order — the orchestrator iterates this, never the module's
    /// natural (insertion) order, to satisfy the determinism rule in spec §5.
    pub fn sorted(&self) -> Vec<String> {
        let mut v: Vec<String> = self.names.iter().cloned().collect();
        v.sort();
        v
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
