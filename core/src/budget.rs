//! C4 — Size-Budget Planner (spec §4.4).

use codedefender_config::{Config, Criticality, SizeMode, TechniqueFlags};

use crate::model::FunctionAnalysisRecord;

/// Fixed per-technique growth estimate, as a percent of function size, before multiplying by
/// `cycles` (spec §4.4: "each technique contributes a fixed percentage, multiplied by cycles").
fn technique_growth_percent(flags: &TechniqueFlags) -> u32 {
    let mut total = 0;
    if flags.control_flow_obfuscation {
        total += 8;
    }
    if flags.bogus_code {
        total += 10;
    }
    if flags.fake_loops {
        total += 6;
    }
    if flags.instruction_substitution {
        total += 4;
    }
    if flags.mixed_boolean_arithmetic {
        total += 15;
    }
    if flags.control_flow_flattening {
        total += 25;
    }
    if flags.constant_obfuscation {
        total += 5;
    }
    if flags.pseudo_vm {
        total += 20;
    }
    if flags.polymorphic_variants {
        total += 80;
    }
    total
}

/// Priority-of-disable order from spec §4.4: disable the most expensive/least essential
/// techniques first.
const DISABLE_PRIORITY: &[fn(&mut TechniqueFlags)] = &[
    |f| f.polymorphic_variants = false,
    |f| f.pseudo_vm = false,
    |f| f.control_flow_flattening = false,
    |f| f.mixed_boolean_arithmetic = false,
    |f| f.constant_obfuscation = false,
    |f| f.bogus_code = false,
    |f| f.fake_loops = false,
];

/// A per-function effective configuration produced by combining the global `Config` with the
/// size budget and the function's criticality.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub techniques: TechniqueFlags,
    pub cycles: u32,
}

pub fn plan(config: &Config, analysis: &FunctionAnalysisRecord) -> EffectiveConfig {
    let mut techniques = config.techniques.clone();
    let mut cycles = config.cycles;

    if config.size_mode == SizeMode::None {
        return EffectiveConfig { techniques, cycles };
    }

    let max_growth = match config.size_mode {
        SizeMode::None => u32::MAX,
        SizeMode::Minimal => config.max_size_growth_percent.min(40),
        SizeMode::Balanced => config.max_size_growth_percent.min(150),
        SizeMode::Aggressive => config.max_size_growth_percent,
    };

    let mut disable_idx = 0;
    loop {
        let estimate = technique_growth_percent(&techniques).saturating_mul(cycles);
        if estimate <= max_growth {
            break;
        }
        if disable_idx < DISABLE_PRIORITY.len() {
            DISABLE_PRIORITY[disable_idx](&mut techniques);
            disable_idx += 1;
        } else if cycles > 1 {
            cycles -= 1;
        } else {
            break;
        }
    }

    if analysis.criticality == Criticality::Critical {
        techniques.control_flow_obfuscation = true;
        techniques.string_encryption = true;
        techniques.anti_debug = true;
    }

    EffectiveConfig { techniques, cycles }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_config::StringCipher;

    fn analysis_with(criticality: Criticality) -> FunctionAnalysisRecord {
        FunctionAnalysisRecord {
            criticality,
            complexity: 1,
            sensitivity_score: 0,
            estimated_growth_percent: 0,
            caller_count: 0,
            has_string_ops: false,
            has_crypto_ops: false,
            has_network_ops: false,
            has_file_ops: false,
        }
    }

    #[test]
    fn disables_in_priority_order_until_within_budget() {
        let mut config = Config::aggressive();
        config.max_size_growth_percent = 20;
        let plan = plan(&config, &analysis_with(Criticality::Standard));
        assert!(!plan.techniques.polymorphic_variants);
        assert!(!plan.techniques.pseudo_vm);
    }

    #[test]
    fn critical_functions_force_enable_baseline_protections() {
        let mut config = Config::minimal();
        config.max_size_growth_percent = 1;
        config.techniques.control_flow_obfuscation = false;
        config.techniques.string_encryption = false;
        config.techniques.anti_debug = false;
        let plan = plan(&config, &analysis_with(Criticality::Critical));
        assert!(plan.techniques.control_flow_obfuscation);
        assert!(plan.techniques.string_encryption);
        assert!(plan.techniques.anti_debug);
    }

    #[test]
    fn size_mode_none_never_disables_anything() {
        let mut config = Config::aggressive();
        config.size_mode = SizeMode::None;
        config.string_cipher = StringCipher::Rc4WithPbkdf2;
        let plan = plan(&config, &analysis_with(Criticality::Standard));
        assert!(plan.techniques.polymorphic_variants);
        assert_eq!(plan.cycles, config.cycles);
    }
}
