//! `codedefender-config` provides the Rust data structures used for configuring the
//! CodeDefender obfuscation engine and for serializing/deserializing its YAML config files.
//! These structures are shared by the engine (`codedefender-core`) and the local CLI
//! (`codedefender-cli`).
//!
//! This crate is intended to be consumed by tools that integrate with or generate CodeDefender
//! config files.

use serde::{Deserialize, Serialize};

/// Current supported YAML config version.
pub const YAML_CONFIG_VERSION: &str = "2.0.0";

/// Per-function obfuscation intensity, assigned by the engine's criticality analyzer.
/// Not user-configurable directly, but part of the shared vocabulary between config and
/// analysis results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Criticality {
    Minimal,
    Standard,
    Important,
    Critical,
}

/// String encryption cipher family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringCipher {
    /// Legacy rotating multi-byte XOR cipher.
    RotatingXor,
    /// Textbook RC4 with a fixed, module-fingerprint-derived key.
    Rc4,
    /// RC4 whose key is derived via PBKDF2 over the module fingerprint. Strongest; default.
    Rc4WithPbkdf2,
}

/// How aggressively the size-budget planner is allowed to let the module grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeMode {
    /// No size budgeting: every enabled technique always runs.
    None,
    Minimal,
    Balanced,
    Aggressive,
}

/// Enable/disable flags for each of the sixteen transformation techniques.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechniqueFlags {
    #[serde(default = "default_true")]
    pub control_flow_obfuscation: bool,
    #[serde(default = "default_true")]
    pub bogus_code: bool,
    #[serde(default = "default_true")]
    pub fake_loops: bool,
    #[serde(default = "default_true")]
    pub instruction_substitution: bool,
    #[serde(default)]
    pub mixed_boolean_arithmetic: bool,
    #[serde(default)]
    pub control_flow_flattening: bool,
    #[serde(default)]
    pub constant_obfuscation: bool,
    #[serde(default)]
    pub pseudo_vm: bool,
    #[serde(default = "default_true")]
    pub string_encryption: bool,
    #[serde(default)]
    pub indirect_calls: bool,
    #[serde(default)]
    pub import_hiding: bool,
    #[serde(default)]
    pub anti_debug: bool,
    #[serde(default)]
    pub anti_tamper: bool,
    #[serde(default)]
    pub polymorphic_variants: bool,
    #[serde(default)]
    pub metamorphic_reshape: bool,
    #[serde(default = "default_true")]
    pub anti_analysis: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TechniqueFlags {
    fn default() -> Self {
        TechniqueFlags {
            control_flow_obfuscation: true,
            bogus_code: true,
            fake_loops: true,
            instruction_substitution: true,
            mixed_boolean_arithmetic: false,
            control_flow_flattening: false,
            constant_obfuscation: false,
            pseudo_vm: false,
            string_encryption: true,
            indirect_calls: false,
            import_hiding: false,
            anti_debug: false,
            anti_tamper: false,
            polymorphic_variants: false,
            metamorphic_reshape: false,
            anti_analysis: true,
        }
    }
}

/// Immutable per-run engine configuration. See spec §3 for field semantics and domains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which of the sixteen techniques are enabled.
    pub techniques: TechniqueFlags,
    /// Number of full obfuscation cycles to run, in `1..=10`.
    pub cycles: u32,
    /// Percent of a block's length to fill with bogus instructions, in `0..=100`.
    pub bogus_percent: u32,
    /// Number of fake loops to splice per function, in `0..=10`.
    pub fake_loop_count: u32,
    /// Complexity knob for MBA rewriting, in `1..=10`. At `>=3`, multiplication is also rewritten.
    pub mba_complexity: u32,
    /// Number of polymorphic clones to generate per Critical function, in `1..=10`.
    pub poly_variants: u32,
    /// Percent chance, per candidate block, that control-flow obfuscation applies, in `0..=100`.
    pub flattening_probability: u32,
    /// PBKDF2 iteration count for the RC4-with-PBKDF2 string cipher, in `500..=5000`.
    pub pbkdf2_iterations: u32,
    /// Cipher family used for string encryption.
    pub string_cipher: StringCipher,
    /// Size-budget mode.
    pub size_mode: SizeMode,
    /// Maximum allowed estimated size growth, as a percent of original module size.
    pub max_size_growth_percent: u32,
    /// If true, strings are decrypted once at module startup via a constructor; if false, each
    /// string gets a lazy per-use decryptor stub.
    pub decrypt_at_startup: bool,
    /// Path the report generator (C17) writes `report.txt`-style output to.
    pub report_path: String,
}

impl Config {
    /// Light protection: fast, small size overhead, safe for broad rollout.
    pub fn minimal() -> Self {
        Config {
            techniques: TechniqueFlags {
                control_flow_obfuscation: true,
                bogus_code: true,
                fake_loops: false,
                instruction_substitution: true,
                mixed_boolean_arithmetic: false,
                control_flow_flattening: false,
                constant_obfuscation: false,
                pseudo_vm: false,
                string_encryption: true,
                indirect_calls: false,
                import_hiding: false,
                anti_debug: false,
                anti_tamper: false,
                polymorphic_variants: false,
                metamorphic_reshape: false,
                anti_analysis: false,
            },
            cycles: 1,
            bogus_percent: 15,
            fake_loop_count: 1,
            mba_complexity: 1,
            poly_variants: 1,
            flattening_probability: 30,
            pbkdf2_iterations: 500,
            string_cipher: StringCipher::RotatingXor,
            size_mode: SizeMode::Minimal,
            max_size_growth_percent: 40,
            decrypt_at_startup: false,
            report_path: "report.txt".to_string(),
        }
    }

    /// Balanced protection/overhead tradeoff. The default preset.
    pub fn balanced() -> Self {
        Config {
            techniques: TechniqueFlags::default(),
            cycles: 2,
            bogus_percent: 35,
            fake_loop_count: 3,
            mba_complexity: 4,
            poly_variants: 2,
            flattening_probability: 60,
            pbkdf2_iterations: 2000,
            string_cipher: StringCipher::Rc4WithPbkdf2,
            size_mode: SizeMode::Balanced,
            max_size_growth_percent: 120,
            decrypt_at_startup: false,
            report_path: "report.txt".to_string(),
        }
    }

    /// Maximum protection. Expect significant size growth.
    pub fn aggressive() -> Self {
        Config {
            techniques: TechniqueFlags {
                control_flow_obfuscation: true,
                bogus_code: true,
                fake_loops: true,
                instruction_substitution: true,
                mixed_boolean_arithmetic: true,
                control_flow_flattening: true,
                constant_obfuscation: true,
                pseudo_vm: true,
                string_encryption: true,
                indirect_calls: true,
                import_hiding: true,
                anti_debug: true,
                anti_tamper: true,
                polymorphic_variants: true,
                metamorphic_reshape: true,
                anti_analysis: true,
            },
            cycles: 4,
            bogus_percent: 70,
            fake_loop_count: 8,
            mba_complexity: 8,
            poly_variants: 4,
            flattening_probability: 90,
            pbkdf2_iterations: 5000,
            string_cipher: StringCipher::Rc4WithPbkdf2,
            size_mode: SizeMode::Aggressive,
            max_size_growth_percent: 400,
            decrypt_at_startup: true,
            report_path: "report.txt".to_string(),
        }
    }

    /// Clamp all numeric fields into their documented domains (spec §3). Config loaded from
    /// untrusted YAML is run through this before being handed to the engine.
    pub fn clamp(mut self) -> Self {
        self.cycles = self.cycles.clamp(1, 10);
        self.bogus_percent = self.bogus_percent.min(100);
        self.fake_loop_count = self.fake_loop_count.min(10);
        self.mba_complexity = self.mba_complexity.clamp(1, 10);
        self.poly_variants = self.poly_variants.clamp(1, 10);
        self.flattening_probability = self.flattening_probability.min(100);
        self.pbkdf2_iterations = self.pbkdf2_iterations.clamp(500, 5000);
        self
    }
}

/// Root YAML config file structure loaded by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlConfig {
    /// Version of the config file format.
    pub version: String,
    /// The engine configuration.
    pub config: Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_clamp_to_documented_domains() {
        for preset in [Config::minimal(), Config::balanced(), Config::aggressive()] {
            let clamped = preset.clone().clamp();
            assert_eq!(preset.cycles, clamped.cycles);
            assert!((1..=10).contains(&clamped.cycles));
            assert!(clamped.bogus_percent <= 100);
            assert!((1..=10).contains(&clamped.mba_complexity));
            assert!((500..=5000).contains(&clamped.pbkdf2_iterations));
        }
    }

    #[test]
    fn clamp_rejects_out_of_domain_values() {
        let mut cfg = Config::minimal();
        cfg.cycles = 99;
        cfg.pbkdf2_iterations = 10;
        let clamped = cfg.clamp();
        assert_eq!(clamped.cycles, 10);
        assert_eq!(clamped.pbkdf2_iterations, 500);
    }

    #[test]
    fn yaml_round_trip() {
        let yaml_cfg = YamlConfig {
            version: YAML_CONFIG_VERSION.to_string(),
            config: Config::balanced(),
        };
        let text = serde_yaml::to_string(&yaml_cfg).unwrap();
        let parsed: YamlConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed.version, YAML_CONFIG_VERSION);
        assert_eq!(parsed.config.cycles, yaml_cfg.config.cycles);
    }
}
