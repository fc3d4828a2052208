//! C3 — Criticality Analyzer (spec §4.3).

use codedefender_config::Criticality;
use codedefender_ir::block::Terminator;
use codedefender_ir::{Callee, Function, InstKind, Module};

use crate::model::FunctionAnalysisRecord;

const CRITICAL_KEYWORDS: &[&str] = &[
    "main",
    "password",
    "secret",
    "private",
    "key",
    "encrypt",
    "decrypt",
    "hash",
    "sign",
    "verify",
    "license",
    "serial",
    "auth",
    "login",
    "token",
    "credential",
    "certificate",
    "crypto",
    "cipher",
];

const IMPORTANT_KEYWORDS: &[&str] = &[
    "check", "validate", "secure", "protect", "guard", "init", "setup", "config", "admin",
    "root", "connect", "send", "receive", "download", "upload",
];

const CRYPTO_CALLEE_SUBSTRINGS: &[&str] = &["crypt", "hash", "sha", "md5", "aes"];
const NETWORK_CALLEE_SUBSTRINGS: &[&str] = &["socket", "connect", "send", "recv"];
const FILE_CALLEE_SUBSTRINGS: &[&str] = &["fopen", "fread", "createfile"];

/// Annotation marker the frontend may have stamped onto a function (e.g. `[[obfuscate]]` at
/// the source level, already lowered by the time the IR reaches this engine). Modeled as a
/// predicate over the name rather than a real attribute bag, since the `ir` crate doesn't carry
/// arbitrary source-level attributes.
fn has_obfuscate_annotation(f: &Function) -> bool {
    f.name.starts_with("__obfannotate_")
}

fn lower_contains_any(haystack: &str, needles: &[&str]) -> usize {
    let lower = haystack.to_ascii_lowercase();
    needles.iter().filter(|n| lower.contains(*n)).count()
}

fn callee_names(module: &Module, f: &Function) -> Vec<String> {
    let mut names = Vec::new();
    for inst in &f.insts {
        if let InstKind::Call { callee, .. } = &inst.kind {
            if let Callee::Direct(fid) = callee {
                names.push(module.function(*fid).name.clone());
            }
        }
    }
    names
}

/// Complexity proxy: `1 + conditional branches + case arms + 2*indirect branches +
/// 2*back-edges`, where a back-edge is approximated as "successor appears earlier in layout"
/// (spec §4.3 — explicitly a coarse, acceptable proxy).
pub fn complexity_of(f: &Function) -> u32 {
    let mut complexity: u32 = 1;
    for block in &f.blocks {
        match &block.terminator {
            Terminator::CondBr { .. } => complexity += 1,
            Terminator::Switch { cases, .. } => complexity += cases.len() as u32,
            Terminator::Ret { .. } | Terminator::Unreachable | Terminator::LandingPad { .. } => {}
            Terminator::Br { .. } => {}
        }
        for inst in &block.insts {
            if let InstKind::Call {
                callee: Callee::Indirect(_),
                ..
            } = &inst.kind
            {
                complexity += 2;
            }
        }
        for succ in block.terminator.successors() {
            if f.layout_index(succ) <= f.layout_index(block.id) {
                complexity += 2;
            }
        }
    }
    complexity
}

pub fn sensitivity_score(module: &Module, f: &Function) -> u32 {
    let mut score = 0u32;
    score += 100 * lower_contains_any(&f.name, CRITICAL_KEYWORDS) as u32;
    score += 50 * lower_contains_any(&f.name, IMPORTANT_KEYWORDS) as u32;

    for callee in callee_names(module, f) {
        score += 30 * lower_contains_any(&callee, CRYPTO_CALLEE_SUBSTRINGS) as u32;
        score += 20 * lower_contains_any(&callee, NETWORK_CALLEE_SUBSTRINGS) as u32;
        score += 15 * lower_contains_any(&callee, FILE_CALLEE_SUBSTRINGS) as u32;
    }
    score
}

fn classify(
    has_annotation: bool,
    score: u32,
    complexity: u32,
    block_count: usize,
    caller_count: u32,
) -> Criticality {
    if has_annotation {
        return Criticality::Critical;
    }
    if score >= 100 {
        return Criticality::Critical;
    }
    if score >= 50 || complexity >= 10 {
        return Criticality::Important;
    }
    if block_count < 3 || complexity <= 2 {
        return Criticality::Minimal;
    }
    if caller_count > 10 {
        return Criticality::Minimal;
    }
    Criticality::Standard
}

/// Number of direct-call sites targeting `f` across the whole module.
pub fn caller_count_of(module: &Module, target: &Function) -> u32 {
    let mut count = 0u32;
    for f in &module.functions {
        for inst in &f.insts {
            if let InstKind::Call {
                callee: Callee::Direct(fid),
                ..
            } = &inst.kind
            {
                if module.function(*fid).name == target.name {
                    count += 1;
                }
            }
        }
    }
    count
}

pub fn analyze(module: &Module, f: &Function) -> FunctionAnalysisRecord {
    let complexity = complexity_of(f);
    let score = sensitivity_score(module, f);
    let caller_count = caller_count_of(module, f);
    let criticality = classify(
        has_obfuscate_annotation(f),
        score,
        complexity,
        f.blocks.len(),
        caller_count,
    );

    let callees = callee_names(module, f);
    let has_crypto_ops = callees
        .iter()
        .any(|c| lower_contains_any(c, CRYPTO_CALLEE_SUBSTRINGS) > 0);
    let has_network_ops = callees
        .iter()
        .any(|c| lower_contains_any(c, NETWORK_CALLEE_SUBSTRINGS) > 0);
    let has_file_ops = callees
        .iter()
        .any(|c| lower_contains_any(c, FILE_CALLEE_SUBSTRINGS) > 0);
    let has_string_ops = f
        .insts
        .iter()
        .any(|i| matches!(i.kind, InstKind::GlobalAddr { .. }));

    FunctionAnalysisRecord {
        criticality,
        complexity,
        sensitivity_score: score,
        estimated_growth_percent: 0,
        caller_count,
        has_string_ops,
        has_crypto_ops,
        has_network_ops,
        has_file_ops,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::types::Type;

    fn trivial_fn(name: &str) -> Function {
        let mut f = Function::new(name, Type::Void, vec![]);
        let e = f.push_block("entry");
        f.block_mut(e).terminator = Terminator::Ret { value: None };
        f
    }

    #[test]
    fn critical_keyword_in_name_wins() {
        let f = trivial_fn("validate_license");
        let module = Module::new("m");
        let rec = analyze(&module, &f);
        assert_eq!(rec.criticality, Criticality::Critical);
    }

    #[test]
    fn tiny_function_is_minimal() {
        let f = trivial_fn("helper_do_thing");
        let module = Module::new("m");
        let rec = analyze(&module, &f);
        assert_eq!(rec.criticality, Criticality::Minimal);
    }

    #[test]
    fn monotonicity_increasing_score_never_decreases_criticality() {
        let low = classify(false, 0, 1, 1, 0);
        let mid = classify(false, 60, 1, 5, 0);
        let high = classify(false, 150, 1, 5, 0);
        assert!(low <= mid);
        assert!(mid <= high);
    }
}
