//! Cross-module properties from the engine's testable-properties list: determinism, bounded
//! function-count growth under polymorphic cloning, and criticality monotonicity. Per-pass
//! properties (flattening single-return, string round-trip, anti-debug idempotence) live next to
//! their passes; these exercise the orchestrator end to end.

use codedefender_config::{Config, SizeMode, TechniqueFlags};
use codedefender_core::{criticality, orchestrator};
use codedefender_ir::block::Terminator;
use codedefender_ir::builder::Builder;
use codedefender_ir::types::{Constant, Type};
use codedefender_ir::value::{BinOp, ICmpPred, Value};
use codedefender_ir::{Function, InstKind, Module};

fn report_path(tag: &str) -> String {
    std::env::temp_dir().join(format!("codedefender_properties_{tag}.txt")).to_string_lossy().into_owned()
}

/// A small loop-and-branch function, representative enough to exercise flattening, bogus-code,
/// and substitution without tripping any of the exception-pad/declaration skip paths.
fn looping_fn(name: &str) -> Function {
    let mut f = Function::new(name, Type::I32, vec![Type::I32]);
    let entry = f.push_block("entry");
    let header = f.push_block("header");
    let body = f.push_block("body");
    let exit = f.push_block("exit");

    let slot = {
        let mut b = Builder::at_end(&mut f, entry);
        let slot = b.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, "acc_slot");
        b.emit_void(InstKind::Store { ptr: slot.clone(), value: Value::Const(Constant::Int(Type::I32, 0)) });
        slot
    };
    f.block_mut(entry).terminator = Terminator::Br { target: header };

    let cond = {
        let mut b = Builder::at_end(&mut f, header);
        let v = b.emit(InstKind::Load { ptr: slot.clone(), ty: Type::I32 }, Type::I32, "acc");
        b.emit(InstKind::ICmp { pred: ICmpPred::Slt, lhs: v, rhs: Value::Param(0) }, Type::I1, "keep_going")
    };
    f.block_mut(header).terminator = Terminator::CondBr { cond, if_true: body, if_false: exit };

    {
        let mut b = Builder::at_end(&mut f, body);
        let v = b.emit(InstKind::Load { ptr: slot.clone(), ty: Type::I32 }, Type::I32, "acc_body");
        let next = b.emit(
            InstKind::Binary { op: BinOp::Add, lhs: v, rhs: Value::Const(Constant::Int(Type::I32, 1)) },
            Type::I32,
            "acc_next",
        );
        b.emit_void(InstKind::Store { ptr: slot.clone(), value: next });
    }
    f.block_mut(body).terminator = Terminator::Br { target: header };

    let result = {
        let mut b = Builder::at_end(&mut f, exit);
        b.emit(InstKind::Load { ptr: slot, ty: Type::I32 }, Type::I32, "result")
    };
    f.block_mut(exit).terminator = Terminator::Ret { value: Some(result) };

    f.recompute_preds();
    f
}

fn module_with(name: &str, f: Function) -> Module {
    let mut module = Module::new(name);
    module.add_function(f);
    module
}

#[test]
fn property_well_formedness_is_preserved_across_presets() {
    for (tag, preset) in [("minimal", Config::minimal()), ("balanced", Config::balanced()), ("aggressive", Config::aggressive())] {
        let mut module = module_with("m", looping_fn("counter"));
        let mut config = preset.clamp();
        config.report_path = report_path(&format!("wellformed_{tag}"));
        orchestrator::run(&mut module, &config);
        assert!(codedefender_ir::verify_module(&module).is_ok(), "{tag} preset left module malformed");
    }
}

#[test]
fn property_determinism_same_module_and_config_yield_identical_shape() {
    let config = {
        let mut c = Config::balanced().clamp();
        c.report_path = report_path("determinism");
        c
    };
    let mut a = module_with("m", looping_fn("counter"));
    let mut b = module_with("m", looping_fn("counter"));
    orchestrator::run(&mut a, &config);
    orchestrator::run(&mut b, &config);

    assert_eq!(a.sorted_function_names(), b.sorted_function_names());
    for name in a.sorted_function_names() {
        let fa = a.function(a.func_id_by_name(&name).unwrap());
        let fb = b.function(b.func_id_by_name(&name).unwrap());
        assert_eq!(fa.blocks.len(), fb.blocks.len(), "function {name} diverged in block count");
        assert_eq!(fa.insts.len(), fb.insts.len(), "function {name} diverged in instruction count");
    }
    assert_eq!(a.globals.len(), b.globals.len());
}

#[test]
fn property_no_exponential_growth_of_function_count() {
    // "license" alone scores 100 in the sensitivity table, well past the Critical threshold,
    // regardless of the function's actual complexity.
    let mut module = module_with("m", looping_fn("license_check"));
    let original_count = module.functions.len();
    let poly_variants = 3;

    let mut config = Config::minimal().clamp();
    config.techniques = TechniqueFlags { polymorphic_variants: true, ..config.techniques };
    config.poly_variants = poly_variants;
    config.cycles = 3;
    config.size_mode = SizeMode::None;
    config.report_path = report_path("no_exp_growth");

    orchestrator::run(&mut module, &config);

    // Cloning is idempotent per function (a `_original_impl` twin already present skips
    // re-cloning), so growth is bounded once by `poly_variants + 1` regardless of how many
    // cycles ran — never multiplied by the cycle count.
    let max_allowed = original_count + poly_variants as usize + 1;
    assert!(
        module.functions.len() <= max_allowed,
        "function count {} exceeded bound {} (growth must not multiply with cycle count)",
        module.functions.len(),
        max_allowed
    );
    assert!(codedefender_ir::verify_module(&module).is_ok());
}

#[test]
fn property_criticality_is_monotonic_in_sensitivity_and_complexity() {
    let module = module_with("m", looping_fn("helper"));
    let plain = criticality::analyze(&module, module.function(module.func_id_by_name("helper").unwrap()));

    let module_critical = module_with("m", looping_fn("license_helper"));
    let critical = criticality::analyze(
        &module_critical,
        module_critical.function(module_critical.func_id_by_name("license_helper").unwrap()),
    );

    assert!(critical.sensitivity_score > plain.sensitivity_score);
    assert!(critical.criticality >= plain.criticality, "criticality regressed as sensitivity increased");
}

#[test]
fn report_file_reflects_enabled_techniques_and_counters() {
    let mut module = module_with("reported_module", looping_fn("counter"));
    let mut config = Config::balanced().clamp();
    config.cycles = 2;
    let path = report_path("contents");
    config.report_path = path.clone();

    orchestrator::run(&mut module, &config);

    let body = std::fs::read_to_string(&path).expect("report file must be written");
    assert!(body.contains("reported_module"));
    assert!(body.contains("cycles: 2"));
    assert!(body.contains("control_flow_obfuscations:"));
    assert!(body.contains("bogus_instructions:"));
    assert!(body.contains("strings_encrypted:"));
    let _ = std::fs::remove_file(&path);
}
