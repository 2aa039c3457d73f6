//! Configuration view and validation commands (`vds config`).

use std::path::Path;

use anyhow::Result;
use vds::config::{CONFIG_FILE, CapabilitySpec, VdsConfig, get_vds_dir};
use vds::plan::default_step_ids;

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    explicit: Option<&Path>,
    config: &VdsConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = match explicit {
        Some(path) => path.to_path_buf(),
        None => get_vds_dir(project_dir).join(CONFIG_FILE),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("VDS Configuration");
            println!("=================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No vds.toml found at {}; using defaults", config_path.display());
            }
            println!();

            println!("[checkpoint]");
            println!("  poll_interval_ms = {}", config.checkpoint.poll_interval_ms);
            println!("  max_checks = {}", config.checkpoint.max_checks);
            println!(
                "  (timeout = {}s)",
                config.checkpoint.timeout().as_secs_f64()
            );
            println!();

            println!("[autonomy]");
            println!("  default_level = \"{}\"", config.autonomy.default_level);
            println!(
                "  semi_auto_gated_steps = {:?}",
                config.autonomy.semi_auto_gated_steps
            );
            println!();

            println!("[audit]");
            println!("  payload_max_chars = {}", config.audit.payload_max_chars);
            println!("  redacted_keys = {:?}", config.audit.redacted_keys);
            if let Some(dir) = &config.audit.export_dir {
                println!("  export_dir = \"{}\"", dir.display());
            }
            println!();

            println!("[server]");
            println!("  port = {}", config.server.port);
            println!("  db_path = \"{}\"", config.server.db_path.display());
            println!("  resume_on_startup = {}", config.server.resume_on_startup);
            println!("  dev_mode = {}", config.server.dev_mode);
            println!();

            println!("[logging]");
            println!("  level = \"{}\"", config.logging.level);
            println!("  format = \"{:?}\"", config.logging.format);
            println!("  file = {}", config.logging.file);
            println!();

            if config.capabilities.is_empty() {
                println!("No capabilities configured.");
            } else {
                for (id, spec) in &config.capabilities {
                    println!("[capabilities.{}]", id);
                    match spec {
                        CapabilitySpec::Command { program, args, .. } => {
                            println!("  kind = \"command\"");
                            println!("  program = \"{}\"", program);
                            if !args.is_empty() {
                                println!("  args = {:?}", args);
                            }
                        }
                        CapabilitySpec::Http { url, .. } => {
                            println!("  kind = \"http\"");
                            println!("  url = \"{}\"", url);
                        }
                    }
                }
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate(&default_step_ids());
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                anyhow::bail!("{} already exists", config_path.display());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            VdsConfig::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
