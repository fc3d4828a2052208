use std::fs;
use std::path::PathBuf;

use clap::Parser;
use codedefender_config::{YamlConfig, YAML_CONFIG_VERSION};
use codedefender_ir::Module;

const CLI_DOWNLOAD_LINK: &str = "https://github.com/codedefender-io/api/releases";

/// Commandline interface for CodeDefender
#[derive(Parser, Debug)]
#[command(name = "codedefender-cli")]
#[command(about = "Commandline interface for CodeDefender", long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: log::LevelFilter,
    /// Input module, serialized as JSON
    #[arg(long, value_name = "MODULE")]
    pub module: PathBuf,
    /// Output path for the obfuscated module (JSON)
    #[arg(long, value_name = "OUTPUT")]
    pub output: PathBuf,
    /// Override the report path from the config file
    #[arg(long, value_name = "REPORT")]
    pub report: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::builder().filter_level(cli.log_level).init();

    let config_contents = fs::read_to_string(&cli.config)?;
    let yaml_config: YamlConfig = serde_yaml::from_str(&config_contents)?;

    if yaml_config.version != YAML_CONFIG_VERSION {
        log::error!(
            "Invalid config version: {}, expected: {}",
            yaml_config.version,
            YAML_CONFIG_VERSION
        );
        log::error!("Latest version available at: {CLI_DOWNLOAD_LINK}");
        return Ok(());
    }

    let mut config = yaml_config.config;
    if let Some(report) = &cli.report {
        config.report_path = report.to_string_lossy().into_owned();
    }
    let config = config.clamp();

    log::info!("Loading module from {:?}...", cli.module);
    let module_contents = fs::read_to_string(&cli.module)?;
    let mut module: Module = serde_json::from_str(&module_contents)?;

    if let Err(e) = codedefender_ir::verify_module(&module) {
        log::error!("Input module failed verification: {}", e);
        return Ok(());
    }

    log::info!("Obfuscating module {:?} ({} cycles)...", module.name, config.cycles);
    let verified = codedefender_core::run(&mut module, &config);
    if verified {
        log::info!("Obfuscated module verified cleanly.");
    } else {
        log::warn!("Obfuscated module failed final verification; see report for details.");
    }

    let output_contents = serde_json::to_string_pretty(&module)?;
    fs::write(&cli.output, output_contents)?;
    log::info!("Obfuscated module written to {:?}", cli.output);
    log::info!("Report written to {:?}", config.report_path);

    Ok(())
}
