//! C17 — Report Generator (spec §4.16). Renders a human-readable summary of one orchestrator
//! run — enabled techniques, per-technique counters, and a qualitative effectiveness note — and
//! writes it to `config.report_path`, creating parent directories as needed.

use std::fmt::Write as _;
use std::io;
use std::path::Path;

use codedefender_config::{Config, TechniqueFlags};

use crate::model::{Counters, OriginalFunctionSet};

fn enabled_techniques(flags: &TechniqueFlags) -> Vec<&'static str> {
    let mut names = Vec::new();
    if flags.control_flow_obfuscation {
        names.push("control-flow obfuscation");
    }
    if flags.bogus_code {
        names.push("bogus code injection");
    }
    if flags.fake_loops {
        names.push("fake loops");
    }
    if flags.instruction_substitution {
        names.push("instruction substitution");
    }
    if flags.mixed_boolean_arithmetic {
        names.push("mixed boolean arithmetic");
    }
    if flags.control_flow_flattening {
        names.push("control-flow flattening");
    }
    if flags.constant_obfuscation {
        names.push("constant obfuscation");
    }
    if flags.pseudo_vm {
        names.push("pseudo-VM virtualization");
    }
    if flags.string_encryption {
        names.push("string encryption");
    }
    if flags.indirect_calls {
        names.push("indirect internal calls");
    }
    if flags.import_hiding {
        names.push("import hiding");
    }
    if flags.anti_debug {
        names.push("anti-debug");
    }
    if flags.anti_tamper {
        names.push("anti-tamper");
    }
    if flags.polymorphic_variants {
        names.push("polymorphic variants");
    }
    if flags.metamorphic_reshape {
        names.push("metamorphic reshape");
    }
    if flags.anti_analysis {
        names.push("anti-analysis");
    }
    names
}

/// A short qualitative read of the run, derived from which counters actually moved. Avoids
/// claiming protection for techniques that were enabled but had nothing to act on (e.g. string
/// encryption on a module with no string literals).
fn effectiveness_note(counters: &Counters) -> String {
    let mut applied = Vec::new();
    if counters.control_flow_obfuscations > 0 || counters.functions_flattened > 0 {
        applied.push("control-flow transforms reshaped the module's branch structure");
    }
    if counters.bogus_instructions > 0 || counters.fake_loops > 0 {
        applied.push("bogus and fake-loop insertions added opaque-predicate-guarded noise");
    }
    if counters.instruction_substitutions > 0 || counters.mba_rewrites > 0 {
        applied.push("arithmetic substitution and MBA rewriting obscured instruction-level semantics");
    }
    if counters.constants_hidden > 0 || counters.functions_virtualized > 0 {
        applied.push("constant obfuscation and pseudo-VM virtualization hid literal values");
    }
    if counters.strings_encrypted > 0 {
        applied.push("string literals were encrypted and routed through runtime decryptors");
    }
    if counters.indirect_calls > 0 || counters.imports_hidden > 0 {
        applied.push("call sites were indirected through a function-pointer table and a resolved-import cache");
    }
    if counters.anti_debug_insertion_points > 0 {
        applied.push("anti-debugging checks were wired into entry points and returns");
    }
    if counters.anti_analysis_insertions > 0 {
        applied.push("integrity checksums guard functions against post-build tampering");
    }
    if counters.polymorphic_variants > 0 || counters.metamorphic_transforms > 0 {
        applied.push("critical functions were cloned into polymorphic, dispatcher-selected variants");
    }

    if applied.is_empty() {
        return "No technique produced an observable change to this module — either every \
                enabled technique found nothing eligible, or none were enabled."
            .to_string();
    }
    let mut note = String::from("This run measurably strengthened the module: ");
    note.push_str(&applied.join("; "));
    note.push('.');
    note
}

/// Renders the full report body as a `String`; `write` below is the only function that touches
/// the filesystem, so this half is exercised directly in tests without any `tempfile` setup.
pub fn render(
    module_name: &str,
    config: &Config,
    counters: &Counters,
    originals: &OriginalFunctionSet,
    verified: bool,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "CodeDefender obfuscation report");
    let _ = writeln!(out, "module: {module_name}");
    let _ = writeln!(out, "functions obfuscated: {}", originals.len());
    let _ = writeln!(out, "cycles: {}", config.cycles);
    let _ = writeln!(out, "final verification: {}", if verified { "passed" } else { "FAILED" });
    let _ = writeln!(out);

    let _ = writeln!(out, "enabled techniques:");
    for name in enabled_techniques(&config.techniques) {
        let _ = writeln!(out, "  - {name}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "counters:");
    let _ = writeln!(out, "  control_flow_obfuscations:    {}", counters.control_flow_obfuscations);
    let _ = writeln!(out, "  bogus_instructions:           {}", counters.bogus_instructions);
    let _ = writeln!(out, "  fake_loops:                   {}", counters.fake_loops);
    let _ = writeln!(out, "  instruction_substitutions:    {}", counters.instruction_substitutions);
    let _ = writeln!(out, "  mba_rewrites:                 {}", counters.mba_rewrites);
    let _ = writeln!(out, "  constants_hidden:             {}", counters.constants_hidden);
    let _ = writeln!(out, "  functions_flattened:          {}", counters.functions_flattened);
    let _ = writeln!(out, "  functions_virtualized:        {}", counters.functions_virtualized);
    let _ = writeln!(out, "  indirect_calls:               {}", counters.indirect_calls);
    let _ = writeln!(out, "  imports_hidden:               {}", counters.imports_hidden);
    let _ = writeln!(out, "  anti_debug_insertion_points:  {}", counters.anti_debug_insertion_points);
    let _ = writeln!(out, "  anti_analysis_insertions:     {}", counters.anti_analysis_insertions);
    let _ = writeln!(out, "  polymorphic_variants:         {}", counters.polymorphic_variants);
    let _ = writeln!(out, "  metamorphic_transforms:       {}", counters.metamorphic_transforms);
    let _ = writeln!(out, "  strings_encrypted:            {}", counters.strings_encrypted);
    let _ = writeln!(out, "  dynamic_obfuscations:         {}", counters.dynamic_obfuscations);
    let _ = writeln!(out, "  verification_failures:        {}", counters.verification_failures);
    let _ = writeln!(out);

    let _ = writeln!(out, "{}", effectiveness_note(counters));
    out
}

/// Writes the rendered report to `config.report_path`, creating the parent directory if it
/// doesn't exist yet.
pub fn write(
    module: &codedefender_ir::Module,
    config: &Config,
    counters: &Counters,
    originals: &OriginalFunctionSet,
    verified: bool,
) -> io::Result<()> {
    let body = render(&module.name, config, counters, originals, verified);
    let path = Path::new(&config.report_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_config::Config;

    #[test]
    fn empty_counters_yield_no_observable_change_note() {
        let counters = Counters::default();
        let note = effectiveness_note(&counters);
        assert!(note.contains("No technique produced"));
    }

    #[test]
    fn populated_counters_are_reflected_in_render() {
        let mut counters = Counters::default();
        counters.strings_encrypted = 3;
        counters.bogus_instructions = 12;
        let config = Config::balanced();
        let originals = OriginalFunctionSet::default();
        let body = render("demo", &config, &counters, &originals, true);
        assert!(body.contains("strings_encrypted:            3"));
        assert!(body.contains("bogus_instructions:           12"));
        assert!(body.contains("final verification: passed"));
    }

    #[test]
    fn failed_verification_is_reported() {
        let counters = Counters::default();
        let config = Config::minimal();
        let originals = OriginalFunctionSet::default();
        let body = render("demo", &config, &counters, &originals, false);
        assert!(body.contains("final verification: FAILED"));
    }
}
