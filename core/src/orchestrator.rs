//! C16 — Orchestrator (spec §4.1). Drives the full run: seeds the RNG, freezes the original
//! function set, then for `config.cycles` iterations runs the per-function pass sequence
//! (lightweight substitution first, then the criticality-gated heavy techniques, anti-tamper
//! last) followed by the module-scoped passes, re-verifying after every step. String encryption
//! and the report are finalized once, after the last cycle.

use codedefender_config::Config;
use codedefender_ir::{Function, Module};

use crate::antidebug::{self, Platform};
use crate::bogus;
use crate::budget;
use crate::calls;
use crate::constants;
use crate::control_flow;
use crate::criticality;
use crate::flatten;
use crate::integrity;
use crate::model::{Counters, OriginalFunctionSet};
use crate::polymorphic;
use crate::report;
use crate::rng::{config_seed, module_fingerprint, Prng};
use crate::strings;
use crate::substitute;
use crate::verify;

/// Runs every enabled technique against `module` for `config.cycles` cycles, then writes the
/// report to `config.report_path`. Returns `true` if the module verified cleanly after every
/// pass this run; `false` if any pass left the module malformed (the run still completes —
/// failures are logged and counted, never fatal, per spec §7).
pub fn run(module: &mut Module, config: &Config) -> bool {
    let seed = config_seed(config);
    let fingerprint = module_fingerprint(module);
    let mut rng = Prng::from_seed_components(seed, fingerprint);
    let originals = OriginalFunctionSet::capture(module);
    let mut counters = Counters::default();
    let mut all_verified = true;
    let mut virtualized_so_far = 0usize;

    for cycle in 1..=config.cycles {
        for name in originals.sorted() {
            let Some(fid) = module.func_id_by_name(&name) else {
                continue;
            };
            if module.function(fid).is_declaration {
                continue;
            }
            let analysis = criticality::analyze(module, module.function(fid));
            let effective = budget::plan(config, &analysis);

            if effective.techniques.control_flow_obfuscation {
                control_flow::run(module.function_mut(fid), &mut rng, analysis.criticality, &mut counters);
                all_verified &= verify::check_function(module.function(fid), "control_flow_obfuscation");
            }
            if effective.techniques.instruction_substitution {
                substitute::substitute(module.function_mut(fid), &mut counters);
                all_verified &= verify::check_function(module.function(fid), "instruction_substitution");
            }
            if effective.techniques.bogus_code {
                bogus::inject_bogus_code(module.function_mut(fid), &mut rng, config.bogus_percent, &mut counters);
                all_verified &= verify::check_function(module.function(fid), "bogus_code");
            }
            if effective.techniques.fake_loops {
                bogus::inject_fake_loops(module.function_mut(fid), &mut rng, config.fake_loop_count, &mut counters);
                all_verified &= verify::check_function(module.function(fid), "fake_loops");
            }
            if effective.techniques.control_flow_flattening {
                flatten::run(module.function_mut(fid), &mut rng, config.flattening_probability, &mut counters);
                all_verified &= verify::check_function(module.function(fid), "control_flow_flattening");
            }
            if effective.techniques.mixed_boolean_arithmetic {
                substitute::apply_mba(module.function_mut(fid), config.mba_complexity, &mut counters);
                all_verified &= verify::check_function(module.function(fid), "mixed_boolean_arithmetic");
            }
            if effective.techniques.constant_obfuscation {
                constants::obfuscate_constants(module.function_mut(fid), &mut counters);
                all_verified &= verify::check_function(module.function(fid), "constant_obfuscation");
            }
            if effective.techniques.pseudo_vm {
                constants::apply_pseudo_vm(module, &name, &mut rng, &mut virtualized_so_far, &mut counters);
                all_verified &= verify::check_function(module.function(fid), "pseudo_vm");
            }
            if effective.techniques.metamorphic_reshape {
                polymorphic::metamorphic_reshape(module.function_mut(fid), &mut rng, &mut counters);
                all_verified &= verify::check_function(module.function(fid), "metamorphic_reshape");
            }
        }

        let critical_fids: Vec<_> = originals
            .sorted()
            .into_iter()
            .filter_map(|name| module.func_id_by_name(&name))
            .filter(|&fid| !module.function(fid).is_declaration)
            .filter(|&fid| {
                let analysis = criticality::analyze(module, module.function(fid));
                analysis.criticality == codedefender_config::Criticality::Critical
                    && budget::plan(config, &analysis).techniques.polymorphic_variants
            })
            .collect();
        if !critical_fids.is_empty() {
            polymorphic::polymorphic_variants(module, &critical_fids, config.poly_variants, &mut counters);
            all_verified &= verify::check_module(module, "polymorphic_variants");
        }

        if config.techniques.indirect_calls {
            calls::hide_internal_calls(module, &mut counters);
            all_verified &= verify::check_module(module, "indirect_calls");
        }
        if config.techniques.import_hiding {
            calls::hide_imports(module, &mut counters);
            all_verified &= verify::check_module(module, "import_hiding");
        }

        if cycle == 1 && config.techniques.anti_debug {
            let target_fids: Vec<_> = originals
                .sorted()
                .into_iter()
                .filter_map(|name| module.func_id_by_name(&name))
                .filter(|&fid| !module.function(fid).is_declaration)
                .filter(|&fid| is_debug_check_target(module.function(fid)))
                .collect();
            antidebug::run(module, &target_fids, Platform::Windows, &mut counters);
            all_verified &= verify::check_module(module, "anti_debug");
        }

        // Anti-tamper must see the function's final opcodes, so it runs once, after every other
        // function-scoped pass has had its last cycle (spec §4.1, §4.14).
        if cycle == config.cycles && config.techniques.anti_tamper {
            let tamper_fids: Vec<_> = originals
                .sorted()
                .into_iter()
                .filter_map(|name| module.func_id_by_name(&name))
                .filter(|&fid| !module.function(fid).is_declaration)
                .filter(|&fid| {
                    criticality::analyze(module, module.function(fid)).criticality
                        == codedefender_config::Criticality::Critical
                })
                .collect();
            if !tamper_fids.is_empty() {
                integrity::run(module, &tamper_fids, &mut counters);
                all_verified &= verify::check_module(module, "anti_tamper");
            }
        }
    }

    if config.techniques.string_encryption {
        strings::run(module, &mut rng, config.string_cipher, config.pbkdf2_iterations, config.decrypt_at_startup, &mut counters);
        all_verified &= verify::check_module(module, "string_encryption");
    }

    if !all_verified {
        counters.verification_failures += 1;
    }

    let _ = report::write(module, config, &counters, &originals, all_verified);
    all_verified
}

/// Anti-debug probes are only worth the size cost at entry points and the functions most likely
/// to be hit early by an attacker attaching a debugger — `main`-likes and anything Critical.
fn is_debug_check_target(f: &Function) -> bool {
    antidebug::is_main_like(&f.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_config::{Config, TechniqueFlags};
    use codedefender_ir::block::Terminator;
    use codedefender_ir::builder::Builder;
    use codedefender_ir::types::Type;
    use codedefender_ir::value::{BinOp, Value};
    use codedefender_ir::InstKind;

    fn sample_module() -> Module {
        let mut module = Module::new("sample");
        let mut f = Function::new("main", Type::I32, vec![]);
        let entry = f.push_block("entry");
        let val = {
            let mut b = Builder::at_end(&mut f, entry);
            let lhs = Value::Const(codedefender_ir::types::Constant::Int(Type::I32, 7));
            let rhs = Value::Const(codedefender_ir::types::Constant::Int(Type::I32, 35));
            b.emit(InstKind::Binary { op: BinOp::Add, lhs, rhs }, Type::I32, "sum")
        };
        f.block_mut(entry).terminator = Terminator::Ret { value: Some(val) };
        module.add_function(f);
        module
    }

    fn report_path_for(test_name: &str) -> String {
        std::env::temp_dir().join(format!("codedefender_orchestrator_{test_name}.txt")).to_string_lossy().into_owned()
    }

    #[test]
    fn minimal_preset_run_verifies_cleanly() {
        let mut module = sample_module();
        let mut config = Config::minimal().clamp();
        config.report_path = report_path_for("minimal");
        let ok = run(&mut module, &config);
        assert!(ok);
        assert!(codedefender_ir::verify_module(&module).is_ok());
    }

    #[test]
    fn run_is_deterministic_for_fixed_config_and_module() {
        let mut a = sample_module();
        let mut b = sample_module();
        let mut config = Config::balanced().clamp();
        config.report_path = report_path_for("determinism");
        run(&mut a, &config);
        run(&mut b, &config);
        assert_eq!(a.sorted_function_names(), b.sorted_function_names());
        assert_eq!(a.functions.len(), b.functions.len());
    }

    #[test]
    fn disabled_techniques_leave_module_untouched_besides_substitution() {
        let mut module = sample_module();
        let mut config = Config::minimal().clamp();
        config.techniques = TechniqueFlags {
            control_flow_obfuscation: false,
            bogus_code: false,
            fake_loops: false,
            instruction_substitution: false,
            mixed_boolean_arithmetic: false,
            control_flow_flattening: false,
            constant_obfuscation: false,
            pseudo_vm: false,
            string_encryption: false,
            indirect_calls: false,
            import_hiding: false,
            anti_debug: false,
            anti_tamper: false,
            polymorphic_variants: false,
            metamorphic_reshape: false,
            anti_analysis: false,
        };
        config.cycles = 1;
        config.report_path = report_path_for("disabled");
        run(&mut module, &config);
        assert_eq!(module.functions.len(), 1);
        assert!(codedefender_ir::verify_module(&module).is_ok());
    }
}
